//! Service configuration with builder-style construction.

use std::time::Duration;

use crate::session::IdleStatus;

/// The number of selector processors to run when none is configured: one per
/// available core.
pub fn default_processor_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Tuning knobs shared by servers and clients.
///
/// ## Resource limits
///
/// - `read_buffer_size`: size of the per-processor shared read buffer
/// - `processor_count`: how many selector loops (and worker threads) to shard
///   sessions over
///
/// ## Socket options
///
/// - `no_delay`: when enabled (default), disables Nagle's algorithm on
///   accepted and connected sockets
///
/// ## Idle defaults
///
/// - `idle_time`: per-kind thresholds inherited by every new session;
///   overridable per session via `IoSession::set_idle_time`
#[derive(Clone)]
pub struct ServiceConfig {
    /// Size of the shared read buffer, in bytes.
    pub read_buffer_size: usize,
    /// Number of selector processors.
    pub processor_count: usize,
    /// Enable TCP_NODELAY on sessions.
    pub no_delay: bool,
    /// Default idle thresholds, indexed reader/writer/both.
    pub idle_time: [Option<Duration>; 3],
}

impl ServiceConfig {
    /// Create a new builder for ServiceConfig
    pub fn builder() -> ServiceConfigBuilder {
        ServiceConfigBuilder::new()
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            read_buffer_size: 1024,
            processor_count: default_processor_count(),
            no_delay: true,
            idle_time: [None; 3],
        }
    }
}

/// Builder for [`ServiceConfig`]. Unset fields fall back to the defaults.
pub struct ServiceConfigBuilder {
    read_buffer_size: Option<usize>,
    processor_count: Option<usize>,
    no_delay: Option<bool>,
    idle_time: [Option<Duration>; 3],
}

impl ServiceConfigBuilder {
    pub fn new() -> Self {
        ServiceConfigBuilder {
            read_buffer_size: None,
            processor_count: None,
            no_delay: None,
            idle_time: [None; 3],
        }
    }

    /// Set the shared read buffer size in bytes
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = Some(size);
        self
    }

    /// Set the number of selector processors
    pub fn processor_count(mut self, count: usize) -> Self {
        self.processor_count = Some(count.max(1));
        self
    }

    /// Enable or disable TCP_NODELAY
    pub fn no_delay(mut self, enabled: bool) -> Self {
        self.no_delay = Some(enabled);
        self
    }

    /// Set a default idle threshold for one idle kind
    pub fn idle_time(mut self, status: IdleStatus, threshold: Duration) -> Self {
        self.idle_time[status.index()] = Some(threshold);
        self
    }

    /// Build the ServiceConfig
    pub fn build(self) -> ServiceConfig {
        let default = ServiceConfig::default();
        ServiceConfig {
            read_buffer_size: self.read_buffer_size.unwrap_or(default.read_buffer_size),
            processor_count: self.processor_count.unwrap_or(default.processor_count),
            no_delay: self.no_delay.unwrap_or(default.no_delay),
            idle_time: self.idle_time,
        }
    }
}

impl Default for ServiceConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_fills_defaults() {
        let config = ServiceConfig::builder().build();
        assert_eq!(config.read_buffer_size, 1024);
        assert!(config.processor_count >= 1);
        assert!(config.no_delay);
        assert_eq!(config.idle_time, [None; 3]);
    }

    #[test]
    fn builder_overrides_stick() {
        let config = ServiceConfig::builder()
            .read_buffer_size(4096)
            .processor_count(2)
            .no_delay(false)
            .idle_time(IdleStatus::ReaderIdle, Duration::from_secs(1))
            .build();
        assert_eq!(config.read_buffer_size, 4096);
        assert_eq!(config.processor_count, 2);
        assert!(!config.no_delay);
        assert_eq!(
            config.idle_time[IdleStatus::ReaderIdle.index()],
            Some(Duration::from_secs(1))
        );
    }

    #[test]
    fn processor_count_is_never_zero() {
        let config = ServiceConfig::builder().processor_count(0).build();
        assert_eq!(config.processor_count, 1);
    }
}
