//! # Parley
//!
//! A real-time messaging relay. Clients hold one WebSocket each, log in
//! over it, and exchange chat traffic that the relay fans out to the other
//! participants of each conversation.
//!
//! ## Features
//!
//! - **Admission control**: Per-address connection ceiling and a sliding
//!   window on login attempts
//! - **Scoped fan-out**: Conversation traffic reaches only its participants;
//!   slow consumers are evicted instead of stalling everyone else
//! - **Pluggable persistence**: Accounts, conversations and messages live
//!   behind the [`store::Store`] trait
//! - **Reconnecting client**: Bounded linear backoff with credential replay
//!   and an encrypted saved session
//!
//! ## Modules
//!
//! - [`governor`]: Connection ceiling and login rate limiting
//! - [`websocket`]: Wire format, per-connection actor and the fan-out hub
//! - [`dispatch`]: Message handlers that turn envelopes into deliveries
//! - [`store`]: Persistence interface and the in-memory store
//! - [`server`]: Axum router, health endpoints and startup
//! - [`client`]: Reconnecting client and saved sessions
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use parley::{serve, AppState, Config, MemoryStore};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let server_config = config.server.clone();
//!
//!     let state = AppState::with_store(config, Arc::new(MemoryStore::new()));
//!     serve(state, &server_config).await?;
//!
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod dispatch;
pub mod governor;
pub mod logging;
pub mod server;
pub mod store;
pub mod websocket;

// Re-export top-level types for convenience
pub use config::{ClientConfig, Config, ConfigError, LoggingConfig, ServerConfig};

pub use governor::{client_address, AdmissionGuard, GovernorConfig, RateGovernor};

pub use websocket::{
    websocket_handler, ConnectionActor, DeliveryMode, Envelope, Frame, Hub, HubConfig,
    ServerMessage,
};

pub use dispatch::{ChatEvent, ChatHandler, Dispatch, HandlerError, MessageHandler, Session};

pub use store::{Conversation, MemoryStore, Message, Store, StoreError, User};

pub use server::{build_router, serve, serve_with_shutdown, AppState, ServerError};

pub use client::{
    ClientError, ClientEvent, ConnectionState, Credentials, ReconnectController, ReconnectPolicy,
    SessionStore, WsConnector,
};
