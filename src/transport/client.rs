//! TCP client service: connects sessions to remote endpoints.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use mio::net::TcpStream;

use crate::error::{Error, Result};
use crate::filter::IoFilter;
use crate::future::{ConnectFuture, IoFuture};
use crate::handler::IoHandler;
use crate::service::{IoService, IoServiceListener, ServiceCore};
use crate::session::IoSession;
use crate::transport::config::ServiceConfig;
use crate::transport::strategy::{RoundRobinStrategy, SelectorStrategy};

/// Opens outbound TCP connections, one session per connect.
///
/// `connect` starts a non-blocking connect and returns a [`ConnectFuture`];
/// the owning selector completes it (with the session) once the socket
/// reports writability, or fails it if the connect is refused.
pub struct TcpClient {
    core: Arc<ServiceCore>,
    strategy: Arc<RoundRobinStrategy>,
}

impl TcpClient {
    pub fn new(config: ServiceConfig, handler: impl IoHandler + 'static) -> Result<Self> {
        let strategy = Arc::new(RoundRobinStrategy::new(
            config.processor_count,
            config.read_buffer_size,
        )?);
        let core = ServiceCore::new(config, Arc::new(handler));
        Ok(TcpClient { core, strategy })
    }

    /// Starts connecting to `remote`. Never blocks the caller; completion is
    /// observed on the returned future.
    pub fn connect(&self, remote: SocketAddr) -> ConnectFuture {
        let future: ConnectFuture = IoFuture::new();
        match TcpStream::connect(remote) {
            Ok(io) => {
                let processor = self.strategy.for_bind();
                processor.create_session(&self.core, io, remote, Some(future.clone()));
            }
            Err(cause) => {
                future.fail(Error::Io(cause));
            }
        }
        future
    }

    /// Closes every managed session and joins the selector workers.
    pub fn dispose(&self) {
        for session in self.core.managed_sessions().values() {
            session.close(true);
        }
        for processor in self.strategy.processors() {
            processor.dispose();
        }
    }
}

impl IoService for TcpClient {
    fn set_handler(&self, handler: Arc<dyn IoHandler>) {
        self.core.set_handler(handler);
    }

    fn set_filters(&self, filters: Vec<Arc<dyn IoFilter>>) {
        self.core.set_filters(filters);
    }

    fn managed_sessions(&self) -> HashMap<u64, Arc<IoSession>> {
        self.core.managed_sessions()
    }

    fn add_listener(&self, listener: Arc<dyn IoServiceListener>) {
        self.core.add_listener(listener);
    }

    fn remove_listener(&self, listener: &Arc<dyn IoServiceListener>) {
        self.core.remove_listener(listener);
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        self.dispose();
    }
}
