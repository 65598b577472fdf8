//! User-facing callback surface for session I/O events.

use std::any::Any;
use std::sync::Arc;

use log::warn;

use crate::error::{Error, Result};
use crate::session::{IdleStatus, IoSession};
use crate::Message;

/// Handles all I/O events fired by the framework. Applications implement
/// this trait to consume incoming messages and drive responses.
///
/// Events for one session arrive in a fixed order: `session_created`, then
/// `session_opened`, then any number of `message_received` / `message_sent` /
/// `session_idle`, then `session_closed` exactly once. An `Err` returned from
/// any callback is re-dispatched through the filter chain as
/// `exception_caught`; when the error is I/O classed the session is then
/// closed.
///
/// Callbacks run on the selector worker that owns the session, so they should
/// not block for long.
pub trait IoHandler: Send + Sync {
    /// A connection exists but is not yet registered with its selector.
    fn session_created(&self, _session: &Arc<IoSession>) -> Result<()> {
        Ok(())
    }

    /// The session is registered and ready for traffic.
    fn session_opened(&self, _session: &Arc<IoSession>) -> Result<()> {
        Ok(())
    }

    /// The session reached its terminal state; no more events will follow.
    fn session_closed(&self, _session: &Arc<IoSession>) -> Result<()> {
        Ok(())
    }

    /// The session saw no read and/or write activity for its configured
    /// threshold. Advisory only; the session stays open unless the handler
    /// closes it.
    fn session_idle(&self, _session: &Arc<IoSession>, _status: IdleStatus) -> Result<()> {
        Ok(())
    }

    /// A decoded message arrived.
    fn message_received(&self, session: &Arc<IoSession>, message: Message) -> Result<()>;

    /// A message written via [`IoSession::write`] was fully handed to the
    /// socket. Delivery to the peer is not implied.
    fn message_sent(
        &self,
        _session: &Arc<IoSession>,
        _message: &(dyn Any + Send + Sync),
    ) -> Result<()> {
        Ok(())
    }

    /// A failure occurred while processing an event for this session.
    fn exception_caught(&self, session: &Arc<IoSession>, cause: &Error) -> Result<()> {
        warn!("unhandled failure on session {}: {}", session.id(), cause);
        Ok(())
    }
}
