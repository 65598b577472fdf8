//! Ordered, bidirectional pipeline of interceptors between the socket and
//! the handler.
//!
//! Inbound events (opened, message received, exceptions, ...) travel from the
//! chain head (socket side) through every filter to the terminal
//! [`IoHandler`]. Outbound operations (`filter_write`, `filter_close`) travel
//! the opposite way and terminate at the session, which queues bytes and
//! schedules selector interest.

pub mod codec;

use std::any::Any;
use std::sync::Arc;

use log::{trace, warn};

use crate::error::{Error, Result};
use crate::handler::IoHandler;
use crate::session::write_queue::WriteRequest;
use crate::session::{IdleStatus, IoSession};
use crate::Message;

/// An interceptor in the session's event pipeline.
///
/// Every method receives a [`NextFilter`] continuation; the default
/// implementations pass events straight through, so a filter only overrides
/// the events it cares about. Returning `Err` aborts the traversal and is
/// re-dispatched to the chain as `exception_caught`.
pub trait IoFilter: Send + Sync {
    fn session_created(&self, next: &NextFilter<'_>, session: &Arc<IoSession>) -> Result<()> {
        next.session_created(session)
    }

    fn session_opened(&self, next: &NextFilter<'_>, session: &Arc<IoSession>) -> Result<()> {
        next.session_opened(session)
    }

    fn session_closed(&self, next: &NextFilter<'_>, session: &Arc<IoSession>) -> Result<()> {
        next.session_closed(session)
    }

    fn session_idle(
        &self,
        next: &NextFilter<'_>,
        session: &Arc<IoSession>,
        status: IdleStatus,
    ) -> Result<()> {
        next.session_idle(session, status)
    }

    fn message_received(
        &self,
        next: &NextFilter<'_>,
        session: &Arc<IoSession>,
        message: Message,
    ) -> Result<()> {
        next.message_received(session, message)
    }

    fn message_sent(
        &self,
        next: &NextFilter<'_>,
        session: &Arc<IoSession>,
        message: &(dyn Any + Send + Sync),
    ) -> Result<()> {
        next.message_sent(session, message)
    }

    fn exception_caught(
        &self,
        next: &NextFilter<'_>,
        session: &Arc<IoSession>,
        cause: &Error,
    ) -> Result<()> {
        next.exception_caught(session, cause)
    }

    fn filter_write(
        &self,
        next: &NextFilter<'_>,
        session: &Arc<IoSession>,
        request: WriteRequest,
    ) -> Result<()> {
        next.filter_write(session, request)
    }

    fn filter_close(
        &self,
        next: &NextFilter<'_>,
        session: &Arc<IoSession>,
        immediate: bool,
    ) -> Result<()> {
        next.filter_close(session, immediate)
    }
}

/// Continuation handed to each filter. `pos` is the filter's place in the
/// chain: inbound calls walk toward the handler, outbound calls walk toward
/// the socket.
pub struct NextFilter<'a> {
    chain: &'a FilterChain,
    pos: usize,
}

impl NextFilter<'_> {
    fn at(&self, pos: usize) -> NextFilter<'_> {
        NextFilter {
            chain: self.chain,
            pos,
        }
    }

    pub fn session_created(&self, session: &Arc<IoSession>) -> Result<()> {
        match self.chain.filters.get(self.pos) {
            Some(filter) => filter.session_created(&self.at(self.pos + 1), session),
            None => self.chain.handler.session_created(session),
        }
    }

    pub fn session_opened(&self, session: &Arc<IoSession>) -> Result<()> {
        match self.chain.filters.get(self.pos) {
            Some(filter) => filter.session_opened(&self.at(self.pos + 1), session),
            None => self.chain.handler.session_opened(session),
        }
    }

    pub fn session_closed(&self, session: &Arc<IoSession>) -> Result<()> {
        match self.chain.filters.get(self.pos) {
            Some(filter) => filter.session_closed(&self.at(self.pos + 1), session),
            None => self.chain.handler.session_closed(session),
        }
    }

    pub fn session_idle(&self, session: &Arc<IoSession>, status: IdleStatus) -> Result<()> {
        match self.chain.filters.get(self.pos) {
            Some(filter) => filter.session_idle(&self.at(self.pos + 1), session, status),
            None => self.chain.handler.session_idle(session, status),
        }
    }

    pub fn message_received(&self, session: &Arc<IoSession>, message: Message) -> Result<()> {
        match self.chain.filters.get(self.pos) {
            Some(filter) => filter.message_received(&self.at(self.pos + 1), session, message),
            None => self.chain.handler.message_received(session, message),
        }
    }

    pub fn message_sent(
        &self,
        session: &Arc<IoSession>,
        message: &(dyn Any + Send + Sync),
    ) -> Result<()> {
        match self.chain.filters.get(self.pos) {
            Some(filter) => filter.message_sent(&self.at(self.pos + 1), session, message),
            None => self.chain.handler.message_sent(session, message),
        }
    }

    pub fn exception_caught(&self, session: &Arc<IoSession>, cause: &Error) -> Result<()> {
        match self.chain.filters.get(self.pos) {
            Some(filter) => filter.exception_caught(&self.at(self.pos + 1), session, cause),
            None => self.chain.handler.exception_caught(session, cause),
        }
    }

    pub fn filter_write(&self, session: &Arc<IoSession>, request: WriteRequest) -> Result<()> {
        if self.pos == 0 {
            return session.enqueue_write(request);
        }
        let filter = &self.chain.filters[self.pos - 1];
        filter.filter_write(&self.at(self.pos - 1), session, request)
    }

    pub fn filter_close(&self, session: &Arc<IoSession>, immediate: bool) -> Result<()> {
        if self.pos == 0 {
            session.schedule_close(immediate);
            return Ok(());
        }
        let filter = &self.chain.filters[self.pos - 1];
        filter.filter_close(&self.at(self.pos - 1), session, immediate)
    }
}

/// The assembled pipeline for one service: filters in head-to-tail order plus
/// the terminal handler.
///
/// The `fire_*` entry points apply the error containment policy: a failure
/// anywhere in the traversal is re-dispatched as `exception_caught`, a
/// failure inside `exception_caught` itself is logged and swallowed, and an
/// I/O classed cause schedules the session for close.
pub struct FilterChain {
    filters: Vec<Arc<dyn IoFilter>>,
    handler: Arc<dyn IoHandler>,
}

impl FilterChain {
    pub fn new(filters: Vec<Arc<dyn IoFilter>>, handler: Arc<dyn IoHandler>) -> Self {
        FilterChain { filters, handler }
    }

    fn inbound(&self) -> NextFilter<'_> {
        NextFilter {
            chain: self,
            pos: 0,
        }
    }

    fn outbound(&self) -> NextFilter<'_> {
        NextFilter {
            chain: self,
            pos: self.filters.len(),
        }
    }

    pub(crate) fn fire_session_created(&self, session: &Arc<IoSession>) {
        self.contain(session, self.inbound().session_created(session));
    }

    pub(crate) fn fire_session_opened(&self, session: &Arc<IoSession>) {
        self.contain(session, self.inbound().session_opened(session));
    }

    pub(crate) fn fire_session_closed(&self, session: &Arc<IoSession>) {
        self.contain(session, self.inbound().session_closed(session));
    }

    pub(crate) fn fire_session_idle(&self, session: &Arc<IoSession>, status: IdleStatus) {
        self.contain(session, self.inbound().session_idle(session, status));
    }

    pub(crate) fn fire_message_received(&self, session: &Arc<IoSession>, message: Message) {
        self.contain(session, self.inbound().message_received(session, message));
    }

    pub(crate) fn fire_message_sent(
        &self,
        session: &Arc<IoSession>,
        message: &(dyn Any + Send + Sync),
    ) {
        self.contain(session, self.inbound().message_sent(session, message));
    }

    pub(crate) fn fire_filter_write(&self, session: &Arc<IoSession>, request: WriteRequest) {
        let future = request.future().clone();
        if let Err(cause) = self.outbound().filter_write(session, request) {
            let cause = Arc::new(cause);
            future.fail_shared(Arc::clone(&cause));
            self.caught_ref(session, &cause);
        }
    }

    pub(crate) fn fire_filter_close(&self, session: &Arc<IoSession>, immediate: bool) {
        if let Err(cause) = self.outbound().filter_close(session, immediate) {
            self.caught(session, cause);
        }
    }

    fn contain(&self, session: &Arc<IoSession>, outcome: Result<()>) {
        if let Err(cause) = outcome {
            self.caught(session, cause);
        }
    }

    /// Dispatches a failure as `exception_caught`, then closes the session
    /// when the cause was I/O classed.
    pub(crate) fn caught(&self, session: &Arc<IoSession>, cause: Error) {
        self.caught_ref(session, &cause);
    }

    fn caught_ref(&self, session: &Arc<IoSession>, cause: &Error) {
        let io_classed = cause.is_io();
        if let Err(secondary) = self.inbound().exception_caught(session, cause) {
            // never loop: a failing exception handler is logged, not re-dispatched
            warn!(
                "exception handler failed on session {}: {} (original failure: {})",
                session.id(),
                secondary,
                cause
            );
        }
        if io_classed && !session.is_closed() {
            trace!("closing session {} after i/o failure", session.id());
            session.close(true);
        }
    }
}

/// Pass-through filter that logs every event, useful while wiring up a new
/// protocol.
#[derive(Default)]
pub struct LoggingFilter;

impl IoFilter for LoggingFilter {
    fn session_created(&self, next: &NextFilter<'_>, session: &Arc<IoSession>) -> Result<()> {
        trace!("session {} created (remote {})", session.id(), session.remote_addr());
        next.session_created(session)
    }

    fn session_opened(&self, next: &NextFilter<'_>, session: &Arc<IoSession>) -> Result<()> {
        trace!("session {} opened", session.id());
        next.session_opened(session)
    }

    fn session_closed(&self, next: &NextFilter<'_>, session: &Arc<IoSession>) -> Result<()> {
        trace!("session {} closed", session.id());
        next.session_closed(session)
    }

    fn session_idle(
        &self,
        next: &NextFilter<'_>,
        session: &Arc<IoSession>,
        status: IdleStatus,
    ) -> Result<()> {
        trace!("session {} idle: {:?}", session.id(), status);
        next.session_idle(session, status)
    }

    fn message_received(
        &self,
        next: &NextFilter<'_>,
        session: &Arc<IoSession>,
        message: Message,
    ) -> Result<()> {
        trace!("session {} received a message", session.id());
        next.message_received(session, message)
    }

    fn message_sent(
        &self,
        next: &NextFilter<'_>,
        session: &Arc<IoSession>,
        message: &(dyn Any + Send + Sync),
    ) -> Result<()> {
        trace!("session {} sent a message", session.id());
        next.message_sent(session, message)
    }

    fn exception_caught(
        &self,
        next: &NextFilter<'_>,
        session: &Arc<IoSession>,
        cause: &Error,
    ) -> Result<()> {
        warn!("session {} failure: {}", session.id(), cause);
        next.exception_caught(session, cause)
    }
}
