//! One readiness loop: a selector, five intake queues and a worker thread
//! owning a shard of sessions.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::queue::SegQueue;
use log::{debug, error, trace, warn};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry, Token, Waker};

use crate::buffer::IoBuffer;
use crate::error::{Error, Result};
use crate::future::ConnectFuture;
use crate::service::ServiceCore;
use crate::session::{self, IoSession, INTEREST_NONE, INTEREST_READ, INTEREST_WRITE};
use crate::transport::strategy::SelectorStrategy;

/// Select timeout; bounded so idle detection runs even on a quiet selector.
const SELECT_TIMEOUT: Duration = Duration::from_secs(1);
const EVENTS_CAPACITY: usize = 1024;
const WAKER_TOKEN: Token = Token(0);

/// Everything the accept path needs to build sessions for one listen
/// address.
pub(crate) struct Acceptor {
    pub(crate) core: Arc<ServiceCore>,
    pub(crate) strategy: Arc<dyn SelectorStrategy>,
}

enum ConnectProgress {
    Ready,
    Pending,
    Failed,
}

/// A selector plus the worker thread that owns it.
///
/// The worker is the sole mutator of selector registrations and session I/O
/// state. All cross-thread submissions (binds, new sessions, closes, flush
/// requests) land in the intake queues and are applied at the top of the next
/// loop pass; every enqueue ensures the worker is running and interrupts its
/// blocking select.
///
/// The worker is lazy: it starts on first demand and exits when the selector
/// has no registered keys and no intake is pending. The exit check and the
/// start check run under the same lock, after the enqueue, so a submission
/// either is seen by the departing worker or respawns one.
pub struct SelectorProcessor {
    name: String,
    poll: Mutex<Poll>,
    waker: Waker,
    read_buffer_size: usize,
    servers_to_add: SegQueue<(Token, TcpListener, Arc<Acceptor>)>,
    servers_to_remove: SegQueue<Token>,
    sessions_to_connect: SegQueue<Arc<IoSession>>,
    sessions_to_close: SegQueue<Arc<IoSession>>,
    flushing_sessions: SegQueue<Arc<IoSession>>,
    /// Sessions registered with this selector. Mutated only by the worker;
    /// read by dispose and the idle scan.
    sessions: Mutex<HashMap<Token, Arc<IoSession>>>,
    bound: Mutex<HashMap<SocketAddr, Token>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    shutting_down: AtomicBool,
}

impl SelectorProcessor {
    pub(crate) fn new(name: String, read_buffer_size: usize) -> Result<Arc<Self>> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        Ok(Arc::new(SelectorProcessor {
            name,
            poll: Mutex::new(poll),
            waker,
            read_buffer_size,
            servers_to_add: SegQueue::new(),
            servers_to_remove: SegQueue::new(),
            sessions_to_connect: SegQueue::new(),
            sessions_to_close: SegQueue::new(),
            flushing_sessions: SegQueue::new(),
            sessions: Mutex::new(HashMap::new()),
            bound: Mutex::new(HashMap::new()),
            worker: Mutex::new(None),
            shutting_down: AtomicBool::new(false),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Binds a listen address and schedules it for accept interest.
    pub(crate) fn bind(
        self: &Arc<Self>,
        addr: SocketAddr,
        acceptor: Arc<Acceptor>,
    ) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr)?;
        let actual = listener.local_addr()?;
        let token = Token(session::next_resource_id() as usize);
        {
            let mut bound = self.bound.lock().unwrap();
            if bound.contains_key(&actual) {
                return Err(Error::AlreadyBound(actual));
            }
            bound.insert(actual, token);
        }
        debug!("[{}] adding a server channel on {}", self.name, actual);
        self.servers_to_add.push((token, listener, acceptor));
        self.wakeup_worker();
        Ok(actual)
    }

    /// Stops accepting on a previously bound address. Unknown addresses are
    /// ignored.
    pub(crate) fn unbind(self: &Arc<Self>, addr: &SocketAddr) {
        let token = self.bound.lock().unwrap().remove(addr);
        match token {
            Some(token) => {
                debug!("[{}] removing the server channel on {}", self.name, addr);
                self.servers_to_remove.push(token);
                self.wakeup_worker();
            }
            None => debug!("[{}] unbind {}: not bound here", self.name, addr),
        }
    }

    /// Builds a session around a connected (or connecting) socket and
    /// schedules it for registration. `session_created` fires here, before
    /// the registration; `session_opened` fires from the worker afterwards.
    pub(crate) fn create_session(
        self: &Arc<Self>,
        core: &Arc<ServiceCore>,
        io: TcpStream,
        remote: SocketAddr,
        connect_future: Option<ConnectFuture>,
    ) -> Arc<IoSession> {
        if core.config().no_delay {
            let _ = io.set_nodelay(true);
        }
        let session = IoSession::new(core, io, remote, Arc::downgrade(self), connect_future);
        trace!("[{}] created session {}", self.name, session.id());
        core.register_session(&session);
        session.chain().fire_session_created(&session);
        self.sessions_to_connect.push(Arc::clone(&session));
        self.wakeup_worker();
        session
    }

    /// Schedules write-interest registration for a session with queued
    /// writes. Idempotent; a no-op for closed sessions.
    pub(crate) fn flush(self: &Arc<Self>, session: &Arc<IoSession>) {
        if session.is_closed() {
            return;
        }
        trace!("[{}] scheduling session {} for writing", self.name, session.id());
        self.flushing_sessions.push(Arc::clone(session));
        self.wakeup_worker();
    }

    pub(crate) fn enqueue_close(self: &Arc<Self>, session: &Arc<IoSession>) {
        self.sessions_to_close.push(Arc::clone(session));
        self.wakeup_worker();
    }

    /// Stops the processor: every managed session is closed, the worker is
    /// joined and the selector dropped with it.
    pub(crate) fn dispose(self: &Arc<Self>) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let managed: Vec<Arc<IoSession>> =
            self.sessions.lock().unwrap().values().cloned().collect();
        for session in managed {
            self.sessions_to_close.push(session);
        }
        self.wakeup_worker();
        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    /// Starts the worker if absent, then interrupts its select. Callers must
    /// have enqueued their work first.
    fn wakeup_worker(self: &Arc<Self>) {
        {
            let mut slot = self.worker.lock().unwrap();
            if slot.is_none() {
                let me = Arc::clone(self);
                let handle = thread::Builder::new()
                    .name(format!("sluice-worker-{}", self.name))
                    .spawn(move || me.run())
                    .expect("failed to spawn the selector worker thread");
                *slot = Some(handle);
            }
        }
        if let Err(cause) = self.waker.wake() {
            warn!("[{}] failed to wake the selector: {}", self.name, cause);
        }
    }

    fn intake_is_empty(&self) -> bool {
        self.servers_to_add.is_empty()
            && self.servers_to_remove.is_empty()
            && self.sessions_to_connect.is_empty()
            && self.sessions_to_close.is_empty()
            && self.flushing_sessions.is_empty()
    }

    fn run(self: Arc<Self>) {
        trace!("[{}] selector worker started", self.name);
        let mut poll = self.poll.lock().unwrap();
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        let mut servers: HashMap<Token, (TcpListener, Arc<Acceptor>)> = HashMap::new();
        let mut read_buf = vec![0u8; self.read_buffer_size];

        loop {
            let shutting_down = self.shutting_down.load(Ordering::SeqCst);
            if shutting_down && !servers.is_empty() {
                for (_, (mut listener, _)) in servers.drain() {
                    let _ = poll.registry().deregister(&mut listener);
                }
            }

            while let Some(token) = self.servers_to_remove.pop() {
                match servers.remove(&token) {
                    Some((mut listener, _)) => {
                        let _ = poll.registry().deregister(&mut listener);
                    }
                    None => warn!(
                        "[{}] the server channel was already removed from the selector",
                        self.name
                    ),
                }
            }

            while let Some((token, mut listener, acceptor)) = self.servers_to_add.pop() {
                match poll.registry().register(&mut listener, token, Interest::READABLE) {
                    Ok(()) => {
                        servers.insert(token, (listener, acceptor));
                    }
                    Err(cause) => {
                        error!("[{}] failed to register a server channel: {}", self.name, cause)
                    }
                }
            }

            while let Some(session) = self.sessions_to_connect.pop() {
                self.register_session(poll.registry(), session, shutting_down);
            }

            while let Some(session) = self.sessions_to_close.pop() {
                self.finish_close(poll.registry(), &session);
            }

            while let Some(session) = self.flushing_sessions.pop() {
                self.arm_write_interest(poll.registry(), &session);
            }

            let timeout = if shutting_down {
                Duration::ZERO
            } else {
                SELECT_TIMEOUT
            };
            if let Err(cause) = poll.poll(&mut events, Some(timeout)) {
                if cause.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                // transient selection failures do not kill the loop
                error!("[{}] selection failure: {}", self.name, cause);
                continue;
            }

            for event in events.iter() {
                let token = event.token();
                if token == WAKER_TOKEN {
                    continue;
                }
                if let Some((listener, acceptor)) = servers.get(&token) {
                    self.accept_ready(listener, acceptor);
                    continue;
                }
                let session = self.sessions.lock().unwrap().get(&token).cloned();
                let Some(session) = session else { continue };
                if event.is_writable() {
                    self.write_ready(poll.registry(), &session);
                }
                if event.is_readable() {
                    self.read_ready(&session, &mut read_buf);
                }
            }

            let now = Instant::now();
            let managed: Vec<Arc<IoSession>> =
                self.sessions.lock().unwrap().values().cloned().collect();
            for session in managed {
                for status in session.check_idle(now) {
                    session.chain().fire_session_idle(&session, status);
                }
            }

            {
                let mut slot = self.worker.lock().unwrap();
                let no_keys = servers.is_empty() && self.sessions.lock().unwrap().is_empty();
                if no_keys && self.intake_is_empty() {
                    *slot = None;
                    trace!("[{}] selector worker exiting", self.name);
                    return;
                }
            }
        }
    }

    fn register_session(
        self: &Arc<Self>,
        registry: &Registry,
        session: Arc<IoSession>,
        shutting_down: bool,
    ) {
        if shutting_down || session.is_closing_or_closed() {
            // close wins over a pending registration
            self.sessions_to_close.push(session);
            return;
        }
        let connecting = session.is_connecting();
        let mut bits = INTEREST_READ;
        if connecting || !session.write_queue().is_empty() {
            bits |= INTEREST_WRITE;
        }
        let outcome = {
            let mut io = session.io().lock().unwrap();
            registry.register(&mut *io, session.token(), mio_interest(bits))
        };
        match outcome {
            Ok(()) => {
                self.sessions
                    .lock()
                    .unwrap()
                    .insert(session.token(), Arc::clone(&session));
                session.set_registered_interest(bits);
                if !connecting {
                    session.set_connected();
                    session.chain().fire_session_opened(&session);
                }
            }
            // a session whose socket died before registration goes straight
            // to the close path, via the i/o containment policy
            Err(cause) => session.chain().caught(&session, Error::Io(cause)),
        }
    }

    fn arm_write_interest(&self, registry: &Registry, session: &Arc<IoSession>) {
        if session.is_closed() {
            return;
        }
        let bits = session.registered_interest();
        if bits == INTEREST_NONE || bits & INTEREST_WRITE != 0 {
            // not yet registered (registration arms it) or already armed
            return;
        }
        let outcome = {
            let mut io = session.io().lock().unwrap();
            registry.reregister(
                &mut *io,
                session.token(),
                Interest::READABLE | Interest::WRITABLE,
            )
        };
        match outcome {
            Ok(()) => session.set_registered_interest(INTEREST_READ | INTEREST_WRITE),
            Err(cause) => session.chain().caught(session, Error::Io(cause)),
        }
    }

    fn disarm_write_interest(&self, registry: &Registry, session: &Arc<IoSession>) {
        if session.registered_interest() & INTEREST_WRITE == 0 {
            return;
        }
        let outcome = {
            let mut io = session.io().lock().unwrap();
            registry.reregister(&mut *io, session.token(), Interest::READABLE)
        };
        match outcome {
            Ok(()) => session.set_registered_interest(INTEREST_READ),
            Err(cause) => session.chain().caught(session, Error::Io(cause)),
        }
    }

    fn accept_ready(self: &Arc<Self>, listener: &TcpListener, acceptor: &Arc<Acceptor>) {
        loop {
            match listener.accept() {
                Ok((io, peer)) => {
                    debug!("[{}] accepted client {}", self.name, peer);
                    let target = acceptor.strategy.for_new_session(self);
                    target.create_session(&acceptor.core, io, peer, None);
                }
                Err(cause) if cause.kind() == io::ErrorKind::WouldBlock => return,
                Err(cause) if cause.kind() == io::ErrorKind::Interrupted => continue,
                Err(cause) => {
                    error!("[{}] accept failure: {}", self.name, cause);
                    return;
                }
            }
        }
    }

    fn read_ready(self: &Arc<Self>, session: &Arc<IoSession>, buf: &mut [u8]) {
        loop {
            if session.is_closing_or_closed() {
                return;
            }
            let outcome = {
                let mut io = session.io().lock().unwrap();
                io.read(buf)
            };
            match outcome {
                Ok(0) => {
                    debug!(
                        "[{}] session {} closed by the remote peer",
                        self.name,
                        session.id()
                    );
                    self.enqueue_close(session);
                    return;
                }
                Ok(n) => {
                    trace!("[{}] read {} bytes on session {}", self.name, n, session.id());
                    session.mark_read(Instant::now());
                    let message = IoBuffer::from(&buf[..n]);
                    session
                        .chain()
                        .fire_message_received(session, Box::new(message));
                }
                Err(cause) if cause.kind() == io::ErrorKind::WouldBlock => return,
                Err(cause) if cause.kind() == io::ErrorKind::Interrupted => continue,
                Err(cause) => {
                    session.chain().caught(session, Error::Io(cause));
                    return;
                }
            }
        }
    }

    fn write_ready(self: &Arc<Self>, registry: &Registry, session: &Arc<IoSession>) {
        if session.is_connecting() {
            match self.finish_connect(session) {
                ConnectProgress::Ready => {}
                ConnectProgress::Pending | ConnectProgress::Failed => return,
            }
        }
        if session.is_closed() {
            return;
        }
        loop {
            let mut queue = session.write_queue().lock();
            let Some(request) = queue.front_mut() else {
                drop(queue);
                self.disarm_write_interest(registry, session);
                if session.is_closing() {
                    // graceful close: the queue just drained
                    self.enqueue_close(session);
                }
                return;
            };
            let wrote = match request.encoded_mut() {
                Some(buffer) if buffer.has_remaining() => {
                    let mut io = session.io().lock().unwrap();
                    io.write(buffer.remaining_slice()).map(|n| {
                        buffer.advance(n);
                        buffer.has_remaining()
                    })
                }
                _ => Ok(false),
            };
            match wrote {
                // the socket refused more; await the next writability
                Ok(true) => return,
                Ok(false) => {
                    let request = queue.pop_front().expect("head request exists");
                    drop(queue);
                    session.mark_write(Instant::now());
                    request.future().complete(());
                    session
                        .chain()
                        .fire_message_sent(session, request.sent_message());
                }
                Err(cause) if cause.kind() == io::ErrorKind::WouldBlock => return,
                Err(cause) if cause.kind() == io::ErrorKind::Interrupted => continue,
                Err(cause) => {
                    drop(queue);
                    session.chain().caught(session, Error::Io(cause));
                    return;
                }
            }
        }
    }

    fn finish_connect(self: &Arc<Self>, session: &Arc<IoSession>) -> ConnectProgress {
        let outcome = {
            let io = session.io().lock().unwrap();
            match io.take_error() {
                Ok(Some(cause)) => Err(cause),
                Err(cause) => Err(cause),
                Ok(None) => match io.peer_addr() {
                    Ok(_) => Ok(true),
                    Err(cause) if cause.kind() == io::ErrorKind::NotConnected => Ok(false),
                    Err(cause) => Err(cause),
                },
            }
        };
        match outcome {
            Ok(true) => {
                trace!("[{}] session {} finished connecting", self.name, session.id());
                session.set_connected();
                if let Some(future) = session.connect_future() {
                    future.complete(Arc::clone(session));
                }
                session.chain().fire_session_opened(session);
                ConnectProgress::Ready
            }
            Ok(false) => ConnectProgress::Pending,
            Err(cause) => {
                debug!(
                    "[{}] session {} failed to connect: {}",
                    self.name,
                    session.id(),
                    cause
                );
                if let Some(future) = session.connect_future() {
                    future.fail(Error::Io(cause));
                }
                self.enqueue_close(session);
                ConnectProgress::Failed
            }
        }
    }

    fn finish_close(&self, registry: &Registry, session: &Arc<IoSession>) {
        if !session.mark_closed() {
            return;
        }
        debug!("[{}] closing session {}", self.name, session.id());
        {
            let mut io = session.io().lock().unwrap();
            let _ = registry.deregister(&mut *io);
            let _ = io.shutdown(Shutdown::Both);
        }
        self.sessions.lock().unwrap().remove(&session.token());
        session.set_registered_interest(INTEREST_NONE);
        for request in session.write_queue().drain() {
            request.future().fail(Error::SessionClosed(session.id()));
        }
        if let Some(future) = session.connect_future() {
            // a connect aborted before completing must still release waiters
            future.fail(Error::SessionClosed(session.id()));
        }
        session.chain().fire_session_closed(session);
        session.close_future().complete(());
        if let Some(core) = session.service() {
            core.unregister_session(session);
        }
    }
}

fn mio_interest(bits: u8) -> Interest {
    match (bits & INTEREST_READ != 0, bits & INTEREST_WRITE != 0) {
        (true, true) => Interest::READABLE | Interest::WRITABLE,
        (false, true) => Interest::WRITABLE,
        _ => Interest::READABLE,
    }
}
