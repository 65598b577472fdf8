//! Per-session FIFO of pending outbound writes.

use std::any::Any;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use crate::buffer::IoBuffer;
use crate::future::{IoFuture, WriteFuture};
use crate::Message;

/// One pending write: the application message, the encoded wire bytes once a
/// codec filter (or the chain head) has produced them, and the future that
/// completes when the bytes fully reach the socket.
///
/// The original message is retained so that `message_sent` observes what the
/// application wrote, not its encoded form.
pub struct WriteRequest {
    message: Option<Message>,
    encoded: Option<IoBuffer>,
    future: WriteFuture,
}

impl WriteRequest {
    pub fn new(message: Message) -> Self {
        WriteRequest {
            message: Some(message),
            encoded: None,
            future: IoFuture::new(),
        }
    }

    pub fn future(&self) -> &WriteFuture {
        &self.future
    }

    pub fn message(&self) -> Option<&(dyn Any + Send + Sync)> {
        self.message.as_deref()
    }

    pub fn take_message(&mut self) -> Option<Message> {
        self.message.take()
    }

    pub fn set_message(&mut self, message: Message) {
        self.message = Some(message);
    }

    pub fn set_encoded(&mut self, buffer: IoBuffer) {
        self.encoded = Some(buffer);
    }

    pub fn encoded(&self) -> Option<&IoBuffer> {
        self.encoded.as_ref()
    }

    pub(crate) fn encoded_mut(&mut self) -> Option<&mut IoBuffer> {
        self.encoded.as_mut()
    }

    /// What `message_sent` should report: the original message when it was
    /// retained, otherwise the encoded buffer.
    pub(crate) fn sent_message(&self) -> &(dyn Any + Send + Sync) {
        if let Some(message) = &self.message {
            &**message
        } else if let Some(encoded) = &self.encoded {
            encoded
        } else {
            &()
        }
    }
}

/// FIFO of [`WriteRequest`]s for one session.
///
/// Producers append from any thread; the owning selector worker is the only
/// consumer. A mutex guards the deque; the worker releases it before firing
/// any event so handlers may write re-entrantly.
pub struct WriteQueue {
    inner: Mutex<VecDeque<WriteRequest>>,
}

impl WriteQueue {
    pub(crate) fn new() -> Self {
        WriteQueue {
            inner: Mutex::new(VecDeque::new()),
        }
    }

    /// Appends a request at the tail.
    pub fn offer(&self, request: WriteRequest) {
        self.inner.lock().unwrap().push_back(request);
    }

    /// Applies `f` to the head request without removing it.
    pub fn peek<R>(&self, f: impl FnOnce(Option<&WriteRequest>) -> R) -> R {
        let queue = self.inner.lock().unwrap();
        f(queue.front())
    }

    /// Drops and returns the head request, if any.
    pub fn remove(&self) -> Option<WriteRequest> {
        self.inner.lock().unwrap().pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    /// Direct access for the worker's partial-write loop.
    pub(crate) fn lock(&self) -> MutexGuard<'_, VecDeque<WriteRequest>> {
        self.inner.lock().unwrap()
    }

    /// Empties the queue, handing back every pending request (close path:
    /// the caller fails their futures).
    pub(crate) fn drain(&self) -> Vec<WriteRequest> {
        self.inner.lock().unwrap().drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(tag: u8) -> WriteRequest {
        let mut req = WriteRequest::new(Box::new(tag));
        req.set_encoded(IoBuffer::wrap(vec![tag]));
        req
    }

    #[test]
    fn fifo_order() {
        let queue = WriteQueue::new();
        for tag in 0..4u8 {
            queue.offer(request(tag));
        }
        assert_eq!(queue.len(), 4);
        let head = queue.peek(|head| head.unwrap().message().unwrap().downcast_ref::<u8>().copied());
        assert_eq!(head, Some(0));
        for tag in 0..4u8 {
            let req = queue.remove().unwrap();
            assert_eq!(req.message().unwrap().downcast_ref::<u8>(), Some(&tag));
        }
        assert!(queue.is_empty());
        assert!(queue.remove().is_none());
    }

    #[test]
    fn drain_returns_everything_in_order() {
        let queue = WriteQueue::new();
        queue.offer(request(1));
        queue.offer(request(2));
        let drained = queue.drain();
        assert_eq!(drained.len(), 2);
        assert!(queue.is_empty());
        assert_eq!(drained[0].message().unwrap().downcast_ref::<u8>(), Some(&1));
    }

    #[test]
    fn sent_message_prefers_the_original() {
        let req = request(9);
        assert_eq!(req.sent_message().downcast_ref::<u8>(), Some(&9));

        let mut raw = WriteRequest::new(Box::new(IoBuffer::wrap(vec![1, 2])));
        let buffer = raw.take_message().unwrap().downcast::<IoBuffer>().unwrap();
        raw.set_encoded(*buffer);
        assert!(raw.sent_message().downcast_ref::<IoBuffer>().is_some());
    }
}
