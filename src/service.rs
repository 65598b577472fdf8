//! Shared state behind every server and client: managed sessions, the filter
//! chain, listeners and session defaults.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use lockfree::map::Map;

use crate::filter::{FilterChain, IoFilter};
use crate::handler::IoHandler;
use crate::session::IoSession;
use crate::transport::config::ServiceConfig;

/// Observes service-level lifecycle events.
pub trait IoServiceListener: Send + Sync {
    /// The service bound its first address (or connected its first session).
    fn service_activated(&self) {}

    /// The service released its last address / disposed.
    fn service_deactivated(&self) {}

    fn session_created(&self, _session: &Arc<IoSession>) {}

    fn session_destroyed(&self, _session: &Arc<IoSession>) {}
}

/// Common surface of servers and clients.
pub trait IoService {
    /// Replaces the terminal handler. Takes effect for sessions created
    /// afterwards.
    fn set_handler(&self, handler: Arc<dyn IoHandler>);

    /// Replaces the filter list. Call before binding or connecting; sessions
    /// capture the chain they were created with.
    fn set_filters(&self, filters: Vec<Arc<dyn IoFilter>>);

    /// Snapshot of the sessions currently managed by this service, keyed by
    /// session id.
    fn managed_sessions(&self) -> HashMap<u64, Arc<IoSession>>;

    fn add_listener(&self, listener: Arc<dyn IoServiceListener>);

    fn remove_listener(&self, listener: &Arc<dyn IoServiceListener>);
}

pub(crate) struct ServiceCore {
    sessions: Map<u64, Arc<IoSession>>,
    filters: Mutex<Vec<Arc<dyn IoFilter>>>,
    handler: Mutex<Arc<dyn IoHandler>>,
    chain: Mutex<Arc<FilterChain>>,
    listeners: Mutex<Vec<Arc<dyn IoServiceListener>>>,
    config: ServiceConfig,
}

impl ServiceCore {
    pub(crate) fn new(config: ServiceConfig, handler: Arc<dyn IoHandler>) -> Arc<Self> {
        let chain = Arc::new(FilterChain::new(Vec::new(), Arc::clone(&handler)));
        Arc::new(ServiceCore {
            sessions: Map::new(),
            filters: Mutex::new(Vec::new()),
            handler: Mutex::new(handler),
            chain: Mutex::new(chain),
            listeners: Mutex::new(Vec::new()),
            config,
        })
    }

    pub(crate) fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// The chain new sessions will capture.
    pub(crate) fn chain(&self) -> Arc<FilterChain> {
        Arc::clone(&self.chain.lock().unwrap())
    }

    pub(crate) fn set_handler(&self, handler: Arc<dyn IoHandler>) {
        *self.handler.lock().unwrap() = handler;
        self.rebuild_chain();
    }

    pub(crate) fn set_filters(&self, filters: Vec<Arc<dyn IoFilter>>) {
        *self.filters.lock().unwrap() = filters;
        self.rebuild_chain();
    }

    fn rebuild_chain(&self) {
        let filters = self.filters.lock().unwrap().clone();
        let handler = Arc::clone(&self.handler.lock().unwrap());
        *self.chain.lock().unwrap() = Arc::new(FilterChain::new(filters, handler));
    }

    pub(crate) fn register_session(&self, session: &Arc<IoSession>) {
        self.sessions.insert(session.id(), Arc::clone(session));
        for listener in self.listeners.lock().unwrap().iter() {
            listener.session_created(session);
        }
    }

    pub(crate) fn unregister_session(&self, session: &Arc<IoSession>) {
        self.sessions.remove(&session.id());
        for listener in self.listeners.lock().unwrap().iter() {
            listener.session_destroyed(session);
        }
    }

    pub(crate) fn managed_sessions(&self) -> HashMap<u64, Arc<IoSession>> {
        self.sessions
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.val())))
            .collect()
    }

    pub(crate) fn add_listener(&self, listener: Arc<dyn IoServiceListener>) {
        self.listeners.lock().unwrap().push(listener);
    }

    pub(crate) fn remove_listener(&self, listener: &Arc<dyn IoServiceListener>) {
        self.listeners
            .lock()
            .unwrap()
            .retain(|known| !Arc::ptr_eq(known, listener));
    }

    pub(crate) fn notify_activated(&self) {
        for listener in self.listeners.lock().unwrap().iter() {
            listener.service_activated();
        }
    }

    pub(crate) fn notify_deactivated(&self) {
        for listener in self.listeners.lock().unwrap().iter() {
            listener.service_deactivated();
        }
    }
}
