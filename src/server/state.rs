//! Application State
//!
//! Shared state accessible by all handlers.
//! Wrapped in Arc for thread-safe sharing across async tasks.

use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::dispatch::{ChatHandler, MessageHandler};
use crate::governor::RateGovernor;
use crate::store::Store;
use crate::websocket::Hub;

/// Shared application state for all handlers
#[derive(Clone)]
pub struct AppState {
    /// Registry of authenticated connections
    pub hub: Arc<Hub>,
    /// Per-address admission and authentication limits
    pub governor: Arc<RateGovernor>,
    /// Application logic behind every connection
    pub handler: Arc<dyn MessageHandler>,
    pub config: Arc<Config>,
    /// Server start time for uptime tracking
    pub start_time: Instant,
}

impl AppState {
    /// Create state around an arbitrary message handler
    pub fn new(config: Config, handler: Arc<dyn MessageHandler>) -> Self {
        Self {
            hub: Arc::new(Hub::new(config.hub.clone())),
            governor: Arc::new(RateGovernor::new(config.governor.clone())),
            handler,
            config: Arc::new(config),
            start_time: Instant::now(),
        }
    }

    /// Create state serving the chat protocol from a store
    pub fn with_store<S: Store>(config: Config, store: Arc<S>) -> Self {
        Self::new(config, Arc::new(ChatHandler::new(store)))
    }

    /// Get server uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Number of authenticated connections
    pub async fn connection_count(&self) -> usize {
        self.hub.connection_count().await
    }
}
