//! TCP server service: binds listen addresses and manages accepted sessions.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::filter::IoFilter;
use crate::handler::IoHandler;
use crate::service::{IoService, IoServiceListener, ServiceCore};
use crate::session::IoSession;
use crate::transport::config::ServiceConfig;
use crate::transport::processor::{Acceptor, SelectorProcessor};
use crate::transport::strategy::{RoundRobinStrategy, SelectorStrategy};

/// Accepts inbound TCP connections and drives their sessions through the
/// configured filter chain into the handler.
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use sluice_io::{IoBuffer, IoHandler, IoSession, Message, Result, ServiceConfig, TcpServer};
///
/// struct EchoHandler;
///
/// impl IoHandler for EchoHandler {
///     fn message_received(&self, session: &Arc<IoSession>, message: Message) -> Result<()> {
///         if let Ok(buffer) = message.downcast::<IoBuffer>() {
///             session.write(*buffer);
///         }
///         Ok(())
///     }
/// }
///
/// # fn main() -> Result<()> {
/// let server = TcpServer::new(ServiceConfig::default(), EchoHandler)?;
/// let addr = server.bind("127.0.0.1:8080".parse().unwrap())?;
/// println!("listening on {addr}");
/// # Ok(())
/// # }
/// ```
pub struct TcpServer {
    core: Arc<ServiceCore>,
    strategy: Arc<RoundRobinStrategy>,
    bound: Mutex<HashMap<SocketAddr, Arc<SelectorProcessor>>>,
}

impl TcpServer {
    pub fn new(config: ServiceConfig, handler: impl IoHandler + 'static) -> Result<Self> {
        let strategy = Arc::new(RoundRobinStrategy::new(
            config.processor_count,
            config.read_buffer_size,
        )?);
        let core = ServiceCore::new(config, Arc::new(handler));
        Ok(TcpServer {
            core,
            strategy,
            bound: Mutex::new(HashMap::new()),
        })
    }

    /// Binds one address; the bound address (with any ephemeral port
    /// resolved) is returned.
    pub fn bind(&self, addr: SocketAddr) -> Result<SocketAddr> {
        self.bind_all(&[addr]).map(|mut bound| bound.remove(0))
    }

    /// Binds every address or none: on failure, the addresses already bound
    /// by this call are unbound again before the error is returned.
    pub fn bind_all(&self, addrs: &[SocketAddr]) -> Result<Vec<SocketAddr>> {
        let mut done: Vec<(SocketAddr, Arc<SelectorProcessor>)> = Vec::new();
        for addr in addrs {
            let processor = self.strategy.for_bind();
            let acceptor = Arc::new(Acceptor {
                core: Arc::clone(&self.core),
                strategy: Arc::clone(&self.strategy) as Arc<dyn SelectorStrategy>,
            });
            match processor.bind(*addr, acceptor) {
                Ok(actual) => done.push((actual, processor)),
                Err(cause) => {
                    for (bound_addr, bound_processor) in done {
                        bound_processor.unbind(&bound_addr);
                    }
                    return Err(cause);
                }
            }
        }
        let newly_active = {
            let mut bound = self.bound.lock().unwrap();
            let was_empty = bound.is_empty();
            for (addr, processor) in &done {
                bound.insert(*addr, Arc::clone(processor));
            }
            was_empty && !done.is_empty()
        };
        if newly_active {
            self.core.notify_activated();
        }
        Ok(done.into_iter().map(|(addr, _)| addr).collect())
    }

    /// Stops accepting on `addr`. Idempotent; unknown addresses are ignored.
    pub fn unbind(&self, addr: &SocketAddr) {
        let (processor, now_empty) = {
            let mut bound = self.bound.lock().unwrap();
            let processor = bound.remove(addr);
            (processor, bound.is_empty())
        };
        if let Some(processor) = processor {
            processor.unbind(addr);
            if now_empty {
                self.core.notify_deactivated();
            }
        }
    }

    pub fn unbind_all(&self) {
        let addrs: Vec<SocketAddr> = self.bound.lock().unwrap().keys().copied().collect();
        for addr in addrs {
            self.unbind(&addr);
        }
    }

    /// The addresses currently accepting connections.
    pub fn bound_addresses(&self) -> Vec<SocketAddr> {
        self.bound.lock().unwrap().keys().copied().collect()
    }

    /// Unbinds everything, closes every managed session and joins the
    /// selector workers.
    pub fn dispose(&self) {
        self.unbind_all();
        for processor in self.strategy.processors() {
            processor.dispose();
        }
    }
}

impl IoService for TcpServer {
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

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.dispose();
    }
}
