#![allow(dead_code)]

use std::any::Any;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use sluice_io::{Error, IdleStatus, IoBuffer, IoHandler, IoSession, Message, Result};

/// Appends a two-letter code per event, in the order the session saw them:
/// CR created, OP opened, RE received, SE sent, ID idle, EC exception,
/// CL closed.
#[derive(Clone, Default)]
pub struct TraceHandler {
    trace: Arc<Mutex<String>>,
    /// Echo every received buffer back to the peer.
    pub echo: bool,
    /// Return an I/O error from `message_received`, closing the session.
    pub fail_on_receive: bool,
}

impl TraceHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn echoing() -> Self {
        TraceHandler {
            echo: true,
            ..Self::default()
        }
    }

    pub fn failing() -> Self {
        TraceHandler {
            fail_on_receive: true,
            ..Self::default()
        }
    }

    pub fn trace(&self) -> String {
        self.trace.lock().unwrap().clone()
    }

    pub fn count(&self, code: &str) -> usize {
        self.trace().matches(code).count()
    }

    fn push(&self, code: &str) {
        self.trace.lock().unwrap().push_str(code);
    }
}

impl IoHandler for TraceHandler {
    fn session_created(&self, _session: &Arc<IoSession>) -> Result<()> {
        self.push("CR");
        Ok(())
    }

    fn session_opened(&self, _session: &Arc<IoSession>) -> Result<()> {
        self.push("OP");
        Ok(())
    }

    fn session_closed(&self, _session: &Arc<IoSession>) -> Result<()> {
        self.push("CL");
        Ok(())
    }

    fn session_idle(&self, _session: &Arc<IoSession>, _status: IdleStatus) -> Result<()> {
        self.push("ID");
        Ok(())
    }

    fn message_received(&self, session: &Arc<IoSession>, message: Message) -> Result<()> {
        self.push("RE");
        if self.fail_on_receive {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                "poisoned payload",
            )));
        }
        if self.echo {
            if let Ok(buffer) = message.downcast::<IoBuffer>() {
                session.write(*buffer);
            }
        }
        Ok(())
    }

    fn message_sent(
        &self,
        _session: &Arc<IoSession>,
        _message: &(dyn Any + Send + Sync),
    ) -> Result<()> {
        self.push("SE");
        Ok(())
    }

    fn exception_caught(&self, _session: &Arc<IoSession>, _cause: &Error) -> Result<()> {
        self.push("EC");
        Ok(())
    }
}

/// Polls `condition` every few milliseconds until it holds or `timeout`
/// elapses.
pub fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}
