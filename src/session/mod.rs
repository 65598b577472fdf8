//! Per-connection state: identity, attributes, write queue, lifecycle.

pub mod write_queue;

use std::any::Any;
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use lockfree::map::Map;
use mio::net::TcpStream;
use mio::Token;

use crate::buffer::IoBuffer;
use crate::error::Error;
use crate::filter::FilterChain;
use crate::future::{CloseFuture, ConnectFuture, IoFuture, WriteFuture};
use crate::service::ServiceCore;
use crate::transport::processor::SelectorProcessor;
use crate::Message;
use self::write_queue::{WriteQueue, WriteRequest};

/// Which direction of traffic has been absent long enough to count as idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdleStatus {
    ReaderIdle,
    WriterIdle,
    BothIdle,
}

impl IdleStatus {
    pub(crate) const ALL: [IdleStatus; 3] = [
        IdleStatus::ReaderIdle,
        IdleStatus::WriterIdle,
        IdleStatus::BothIdle,
    ];

    pub(crate) fn index(self) -> usize {
        match self {
            IdleStatus::ReaderIdle => 0,
            IdleStatus::WriterIdle => 1,
            IdleStatus::BothIdle => 2,
        }
    }
}

/// Typed lookup key for session attributes.
///
/// The underlying storage is a concurrent map from the key name to an opaque
/// value; the type parameter makes lookups statically typed. Two keys with
/// the same name address the same slot, so names should be unique per
/// concern.
pub struct AttributeKey<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Any + Send + Sync> AttributeKey<T> {
    pub const fn new(name: &'static str) -> Self {
        AttributeKey {
            name,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

static NEXT_RESOURCE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide unique id for sessions and server channels. Id 0 is reserved
/// for each selector's waker token.
pub(crate) fn next_resource_id() -> u64 {
    NEXT_RESOURCE_ID.fetch_add(1, Ordering::Relaxed)
}

const STATE_NEW: u8 = 0;
const STATE_CONNECTING: u8 = 1;
const STATE_CONNECTED: u8 = 2;
const STATE_CLOSING: u8 = 3;
const STATE_CLOSED: u8 = 4;

pub(crate) const INTEREST_NONE: u8 = 0;
pub(crate) const INTEREST_READ: u8 = 1;
pub(crate) const INTEREST_WRITE: u8 = 2;

/// Read/write activity bookkeeping for idle detection. Each idle kind fires
/// at most once per quiet period; activity of the matching direction re-arms
/// it.
pub(crate) struct IdleTracker {
    thresholds_ms: [AtomicU64; 3],
    activity: Mutex<Activity>,
}

struct Activity {
    last_read: Instant,
    last_write: Instant,
    fired: [bool; 3],
}

impl IdleTracker {
    fn new(defaults: [Option<Duration>; 3]) -> Self {
        let now = Instant::now();
        let tracker = IdleTracker {
            thresholds_ms: Default::default(),
            activity: Mutex::new(Activity {
                last_read: now,
                last_write: now,
                fired: [false; 3],
            }),
        };
        for status in IdleStatus::ALL {
            tracker.set_threshold(status, defaults[status.index()]);
        }
        tracker
    }

    fn set_threshold(&self, status: IdleStatus, threshold: Option<Duration>) {
        let millis = match threshold {
            Some(d) => (d.as_millis() as u64).max(1),
            None => 0,
        };
        self.thresholds_ms[status.index()].store(millis, Ordering::Relaxed);
    }

    fn threshold(&self, status: IdleStatus) -> Option<Duration> {
        match self.thresholds_ms[status.index()].load(Ordering::Relaxed) {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    fn mark_read(&self, now: Instant) {
        let mut activity = self.activity.lock().unwrap();
        activity.last_read = now;
        activity.fired[IdleStatus::ReaderIdle.index()] = false;
        activity.fired[IdleStatus::BothIdle.index()] = false;
    }

    fn mark_write(&self, now: Instant) {
        let mut activity = self.activity.lock().unwrap();
        activity.last_write = now;
        activity.fired[IdleStatus::WriterIdle.index()] = false;
        activity.fired[IdleStatus::BothIdle.index()] = false;
    }

    fn check(&self, now: Instant) -> Vec<IdleStatus> {
        let mut due = Vec::new();
        let mut activity = self.activity.lock().unwrap();
        for status in IdleStatus::ALL {
            let threshold = self.thresholds_ms[status.index()].load(Ordering::Relaxed);
            if threshold == 0 || activity.fired[status.index()] {
                continue;
            }
            let last = match status {
                IdleStatus::ReaderIdle => activity.last_read,
                IdleStatus::WriterIdle => activity.last_write,
                IdleStatus::BothIdle => activity.last_read.max(activity.last_write),
            };
            if now.saturating_duration_since(last) > Duration::from_millis(threshold) {
                activity.fired[status.index()] = true;
                due.push(status);
            }
        }
        due
    }
}

/// One TCP connection: the unit of addressability for handlers and filters.
///
/// A session is owned by exactly one [`SelectorProcessor`] for its whole
/// life; the processor's worker is the only thread touching the socket.
/// Everything applications call here — `write`, `close`, attributes — is safe
/// from any thread and funnels through the owning processor's intake queues.
pub struct IoSession {
    id: u64,
    remote: SocketAddr,
    local: SocketAddr,
    io: Mutex<TcpStream>,
    state: AtomicU8,
    registered: AtomicU8,
    write_queue: WriteQueue,
    attributes: Map<String, Arc<dyn Any + Send + Sync>>,
    chain: Arc<FilterChain>,
    service: Weak<ServiceCore>,
    processor: Weak<SelectorProcessor>,
    close_future: CloseFuture,
    connect_future: Option<ConnectFuture>,
    idle: IdleTracker,
}

impl IoSession {
    pub(crate) fn new(
        core: &Arc<ServiceCore>,
        io: TcpStream,
        remote: SocketAddr,
        processor: Weak<SelectorProcessor>,
        connect_future: Option<ConnectFuture>,
    ) -> Arc<IoSession> {
        let local = io
            .local_addr()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
        let state = if connect_future.is_some() {
            STATE_CONNECTING
        } else {
            STATE_NEW
        };
        Arc::new(IoSession {
            id: next_resource_id(),
            remote,
            local,
            io: Mutex::new(io),
            state: AtomicU8::new(state),
            registered: AtomicU8::new(INTEREST_NONE),
            write_queue: WriteQueue::new(),
            attributes: Map::new(),
            chain: core.chain(),
            service: Arc::downgrade(core),
            processor,
            close_future: IoFuture::new(),
            connect_future,
            idle: IdleTracker::new(core.config().idle_time),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn is_connected(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_CONNECTED
    }

    pub fn is_closing(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_CLOSING
    }

    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_CLOSED
    }

    pub(crate) fn is_connecting(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_CONNECTING
    }

    pub(crate) fn is_closing_or_closed(&self) -> bool {
        self.state.load(Ordering::SeqCst) >= STATE_CLOSING
    }

    /// Writes a message. It traverses the outbound filter chain (encoders
    /// turn it into an [`IoBuffer`]), lands in the write queue and is drained
    /// by the owning worker when the socket accepts it. Never blocks.
    pub fn write<M: Any + Send + Sync>(self: &Arc<Self>, message: M) -> WriteFuture {
        self.write_message(Box::new(message))
    }

    /// Type-erased variant of [`write`](Self::write).
    pub fn write_message(self: &Arc<Self>, message: Message) -> WriteFuture {
        if self.is_closing_or_closed() {
            return IoFuture::failed(Error::SessionClosed(self.id));
        }
        let request = WriteRequest::new(message);
        let future = request.future().clone();
        self.chain.fire_filter_write(self, request);
        future
    }

    /// Requests close. `immediate` discards pending writes (their futures
    /// fail); otherwise the queue drains first. Repeated calls return the
    /// same future.
    pub fn close(self: &Arc<Self>, immediate: bool) -> CloseFuture {
        let won = self
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |s| {
                if s >= STATE_CLOSING {
                    None
                } else {
                    Some(STATE_CLOSING)
                }
            })
            .is_ok();
        if won {
            self.chain.fire_filter_close(self, immediate);
        }
        self.close_future.clone()
    }

    pub fn close_future(&self) -> CloseFuture {
        self.close_future.clone()
    }

    pub fn set_attribute<T: Any + Send + Sync>(
        &self,
        key: &AttributeKey<T>,
        value: T,
    ) -> Option<Arc<T>> {
        self.attributes
            .insert(key.name.to_string(), Arc::new(value))
            .and_then(|previous| previous.val().clone().downcast::<T>().ok())
    }

    pub fn get_attribute<T: Any + Send + Sync>(&self, key: &AttributeKey<T>) -> Option<Arc<T>> {
        self.attributes
            .get(key.name)
            .and_then(|guard| guard.val().clone().downcast::<T>().ok())
    }

    pub fn contains_attribute<T: Any + Send + Sync>(&self, key: &AttributeKey<T>) -> bool {
        self.get_attribute(key).is_some()
    }

    pub fn remove_attribute<T: Any + Send + Sync>(&self, key: &AttributeKey<T>) -> Option<Arc<T>> {
        self.attributes
            .remove(key.name)
            .and_then(|removed| removed.val().clone().downcast::<T>().ok())
    }

    /// Configures an idle threshold; `None` disables that kind.
    pub fn set_idle_time(&self, status: IdleStatus, threshold: Option<Duration>) {
        self.idle.set_threshold(status, threshold);
    }

    pub fn idle_time(&self, status: IdleStatus) -> Option<Duration> {
        self.idle.threshold(status)
    }

    pub fn write_queue(&self) -> &WriteQueue {
        &self.write_queue
    }

    pub(crate) fn chain(&self) -> &Arc<FilterChain> {
        &self.chain
    }

    pub(crate) fn service(&self) -> Option<Arc<ServiceCore>> {
        self.service.upgrade()
    }

    pub(crate) fn io(&self) -> &Mutex<TcpStream> {
        &self.io
    }

    pub(crate) fn token(&self) -> Token {
        Token(self.id as usize)
    }

    pub(crate) fn connect_future(&self) -> Option<&ConnectFuture> {
        self.connect_future.as_ref()
    }

    pub(crate) fn set_connected(&self) {
        let _ = self
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |s| {
                if s <= STATE_CONNECTING {
                    Some(STATE_CONNECTED)
                } else {
                    None
                }
            });
    }

    /// Transitions to the terminal state; true only for the call that made
    /// the transition.
    pub(crate) fn mark_closed(&self) -> bool {
        self.state.swap(STATE_CLOSED, Ordering::SeqCst) != STATE_CLOSED
    }

    pub(crate) fn registered_interest(&self) -> u8 {
        self.registered.load(Ordering::SeqCst)
    }

    pub(crate) fn set_registered_interest(&self, interest: u8) {
        self.registered.store(interest, Ordering::SeqCst);
    }

    pub(crate) fn mark_read(&self, now: Instant) {
        self.idle.mark_read(now);
    }

    pub(crate) fn mark_write(&self, now: Instant) {
        self.idle.mark_write(now);
    }

    pub(crate) fn check_idle(&self, now: Instant) -> Vec<IdleStatus> {
        self.idle.check(now)
    }

    /// Terminal action of the outbound chain for a write: make sure the
    /// request carries wire bytes, queue it and schedule write interest.
    pub(crate) fn enqueue_write(
        self: &Arc<Self>,
        mut request: WriteRequest,
    ) -> crate::error::Result<()> {
        if request.encoded().is_none() {
            match request.take_message() {
                Some(message) => match message.downcast::<IoBuffer>() {
                    Ok(buffer) => request.set_encoded(*buffer),
                    Err(original) => {
                        request.set_message(original);
                        request.future().fail(Error::Unencoded);
                        return Err(Error::Unencoded);
                    }
                },
                None => {
                    request.future().fail(Error::Unencoded);
                    return Err(Error::Unencoded);
                }
            }
        }
        if self.is_closing_or_closed() {
            request.future().fail(Error::SessionClosed(self.id));
            return Err(Error::SessionClosed(self.id));
        }
        self.write_queue.offer(request);
        if let Some(processor) = self.processor.upgrade() {
            processor.flush(self);
        }
        Ok(())
    }

    /// Terminal action of the outbound chain for a close request.
    pub(crate) fn schedule_close(self: &Arc<Self>, immediate: bool) {
        if immediate {
            for request in self.write_queue.drain() {
                request.future().fail(Error::SessionClosed(self.id));
            }
        }
        if immediate || self.write_queue.is_empty() {
            match self.processor.upgrade() {
                Some(processor) => processor.enqueue_close(self),
                // processor gone: nothing will drain the close queue, finish
                // the lifecycle here so awaiters unblock
                None => {
                    if self.mark_closed() {
                        for request in self.write_queue.drain() {
                            request.future().fail(Error::SessionClosed(self.id));
                        }
                        self.chain.fire_session_closed(self);
                        self.close_future.complete(());
                    }
                }
            }
        }
        // a graceful close with writes still queued completes once the
        // worker drains the queue and notices the closing flag
    }
}

impl std::fmt::Debug for IoSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoSession")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("local", &self.local)
            .field("state", &self.state.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_ids_are_unique_and_nonzero() {
        let a = next_resource_id();
        let b = next_resource_id();
        assert_ne!(a, 0);
        assert_ne!(a, b);
    }

    #[test]
    fn idle_fires_once_per_quiet_period() {
        let tracker = IdleTracker::new([Some(Duration::from_millis(50)), None, None]);
        let start = Instant::now();
        assert!(tracker.check(start).is_empty());
        let later = start + Duration::from_millis(120);
        assert_eq!(tracker.check(later), vec![IdleStatus::ReaderIdle]);
        // no re-fire while still quiet
        let much_later = start + Duration::from_millis(500);
        assert!(tracker.check(much_later).is_empty());
        // activity re-arms
        tracker.mark_read(much_later);
        let after_activity = much_later + Duration::from_millis(120);
        assert_eq!(tracker.check(after_activity), vec![IdleStatus::ReaderIdle]);
    }

    #[test]
    fn both_idle_tracks_the_most_recent_activity() {
        let tracker = IdleTracker::new([None, None, Some(Duration::from_millis(50))]);
        let start = Instant::now();
        let t1 = start + Duration::from_millis(40);
        tracker.mark_write(t1);
        // read is stale but write is fresh: both-idle not due yet
        assert!(tracker.check(start + Duration::from_millis(80)).is_empty());
        assert_eq!(
            tracker.check(t1 + Duration::from_millis(80)),
            vec![IdleStatus::BothIdle]
        );
    }

    #[test]
    fn threshold_roundtrip() {
        let tracker = IdleTracker::new([None; 3]);
        tracker.set_threshold(IdleStatus::WriterIdle, Some(Duration::from_secs(2)));
        assert_eq!(
            tracker.threshold(IdleStatus::WriterIdle),
            Some(Duration::from_secs(2))
        );
        tracker.set_threshold(IdleStatus::WriterIdle, None);
        assert_eq!(tracker.threshold(IdleStatus::WriterIdle), None);
    }
}
