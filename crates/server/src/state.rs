//! Application state shared by every HTTP and WebSocket handler

use std::sync::Arc;
use std::time::Duration;

use crate::lifecycle::ConnectionLifecycleManager;
use crate::registry::SessionRegistry;
use crate::relay::ChatRelay;
use crate::store::SqliteConnector;

#[derive(Clone)]
pub struct AppState {
    /// Lazily opened record store
    pub store: ConnectionLifecycleManager<SqliteConnector>,

    /// Live WebSocket sessions
    pub registry: Arc<SessionRegistry>,

    /// Agent/requester chat routing
    pub relay: Arc<ChatRelay>,
}

impl AppState {
    /// The registry reports session demand to the store manager; the relay
    /// routes through the registry.
    pub fn new(connector: SqliteConnector, store_idle: Duration) -> Self {
        let store = ConnectionLifecycleManager::new(connector, store_idle);
        let registry = Arc::new(SessionRegistry::new(Arc::new(store.clone())));
        let relay = Arc::new(ChatRelay::new(registry.clone()));
        Self {
            store,
            registry,
            relay,
        }
    }
}
