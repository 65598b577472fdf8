//! Sharding of sessions and server channels over selector processors.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::Result;
use crate::transport::processor::SelectorProcessor;

/// Chooses which [`SelectorProcessor`] owns a new session or server channel.
pub trait SelectorStrategy: Send + Sync {
    /// Processor for a freshly accepted or connected session. `current` is
    /// the processor that produced it (the acceptor's), which a strategy may
    /// choose to reuse.
    fn for_new_session(&self, current: &Arc<SelectorProcessor>) -> Arc<SelectorProcessor>;

    /// Processor for a new listen address.
    fn for_bind(&self) -> Arc<SelectorProcessor>;

    fn processors(&self) -> &[Arc<SelectorProcessor>];
}

/// Round-robin assignment over a fixed pool of processors. Every pick takes
/// the next processor regardless of the current one, spreading sessions
/// evenly without tracking load.
pub struct RoundRobinStrategy {
    processors: Vec<Arc<SelectorProcessor>>,
    next: AtomicUsize,
}

impl RoundRobinStrategy {
    pub fn new(count: usize, read_buffer_size: usize) -> Result<Self> {
        let count = count.max(1);
        let mut processors = Vec::with_capacity(count);
        for index in 0..count {
            processors.push(SelectorProcessor::new(format!("{index}"), read_buffer_size)?);
        }
        Ok(RoundRobinStrategy {
            processors,
            next: AtomicUsize::new(0),
        })
    }

    fn pick(&self) -> Arc<SelectorProcessor> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.processors.len();
        Arc::clone(&self.processors[index])
    }
}

impl SelectorStrategy for RoundRobinStrategy {
    fn for_new_session(&self, _current: &Arc<SelectorProcessor>) -> Arc<SelectorProcessor> {
        self.pick()
    }

    fn for_bind(&self) -> Arc<SelectorProcessor> {
        self.pick()
    }

    fn processors(&self) -> &[Arc<SelectorProcessor>] {
        &self.processors
    }
}
