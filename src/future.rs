//! One-shot completion latches for connect, write and close operations.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::Error;
use crate::session::IoSession;

/// Completes when a pending connect finishes; carries the session on success.
pub type ConnectFuture = IoFuture<Arc<IoSession>>;

/// Completes when a queued write has been fully drained to the socket, or
/// fails when the session closes first.
pub type WriteFuture = IoFuture<()>;

/// Completes when the session reaches its terminal closed state.
pub type CloseFuture = IoFuture<()>;

struct Inner<T> {
    state: Mutex<Option<Result<T, Arc<Error>>>>,
    cond: Condvar,
}

/// A one-shot completion latch.
///
/// The first completion (success or failure) wins; later completions are
/// ignored. Waiters block on [`wait`](IoFuture::wait) or poll with
/// [`wait_for`](IoFuture::wait_for).
pub struct IoFuture<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for IoFuture<T> {
    fn clone(&self) -> Self {
        IoFuture {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone> Default for IoFuture<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> IoFuture<T> {
    pub fn new() -> Self {
        IoFuture {
            inner: Arc::new(Inner {
                state: Mutex::new(None),
                cond: Condvar::new(),
            }),
        }
    }

    /// A future born failed, for operations rejected synchronously.
    pub(crate) fn failed(cause: Error) -> Self {
        let future = Self::new();
        future.fail(cause);
        future
    }

    pub fn is_done(&self) -> bool {
        self.inner.state.lock().unwrap().is_some()
    }

    pub fn is_success(&self) -> bool {
        matches!(&*self.inner.state.lock().unwrap(), Some(Ok(_)))
    }

    /// The failure cause, if the operation completed unsuccessfully.
    pub fn cause(&self) -> Option<Arc<Error>> {
        match &*self.inner.state.lock().unwrap() {
            Some(Err(cause)) => Some(Arc::clone(cause)),
            _ => None,
        }
    }

    /// The success value, if the operation completed successfully.
    pub fn value(&self) -> Option<T> {
        match &*self.inner.state.lock().unwrap() {
            Some(Ok(value)) => Some(value.clone()),
            _ => None,
        }
    }

    /// Blocks until the operation completes.
    pub fn wait(&self) -> Result<T, Arc<Error>> {
        let mut state = self.inner.state.lock().unwrap();
        while state.is_none() {
            state = self.inner.cond.wait(state).unwrap();
        }
        state.as_ref().unwrap().clone()
    }

    /// Blocks until the operation completes or `timeout` elapses. Returns
    /// whether the future is done.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock().unwrap();
        while state.is_none() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .inner
                .cond
                .wait_timeout(state, deadline - now)
                .unwrap();
            state = guard;
        }
        true
    }

    /// Whether two handles refer to the same underlying latch.
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Completes the future successfully. Returns false if it was already
    /// done.
    pub(crate) fn complete(&self, value: T) -> bool {
        self.finish(Ok(value))
    }

    /// Completes the future with a failure. Returns false if it was already
    /// done.
    pub(crate) fn fail(&self, cause: Error) -> bool {
        self.finish(Err(Arc::new(cause)))
    }

    pub(crate) fn fail_shared(&self, cause: Arc<Error>) -> bool {
        self.finish(Err(cause))
    }

    fn finish(&self, outcome: Result<T, Arc<Error>>) -> bool {
        let mut state = self.inner.state.lock().unwrap();
        if state.is_some() {
            return false;
        }
        *state = Some(outcome);
        self.inner.cond.notify_all();
        true
    }
}
