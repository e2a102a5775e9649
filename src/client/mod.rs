//! Relay Client
//!
//! Client-side plumbing for talking to a relay: a [`ReconnectController`]
//! that keeps one connection alive with bounded backoff and replays login
//! credentials after every reconnect, the [`Connector`]s it dials through,
//! and encrypted on-disk [`SessionRecord`]s.
//!
//! ## Example
//!
//! ```rust,no_run
//! use parley::client::{ClientEvent, Credentials, ReconnectController, ReconnectPolicy, WsConnector};
//!
//! # async fn run() -> Result<(), parley::client::ClientError> {
//! let controller = ReconnectController::start(
//!     WsConnector::new("ws://localhost:3567/ws"),
//!     ReconnectPolicy::default(),
//! );
//! controller.login(Credentials::login("ana", "secret"))?;
//!
//! while let Some(event) = controller.recv().await {
//!     if let ClientEvent::Frame(frame) = event {
//!         println!("{}: {}", frame.kind, frame.body);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod connector;
mod controller;
mod session;

pub use connector::{connector_fn, BoxSink, BoxStream, Connection, Connector, ConnectorFn, WsConnector};
pub use controller::{CloseHandle, ConnectionState, Credentials, ReconnectController, ReconnectPolicy};
pub use session::{SessionCipher, SessionError, SessionRecord, SessionStore};

use serde::de::{DeserializeOwned, Error as _};
use serde_json::Value;
use thiserror::Error;

/// Client-side errors
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect: {0}")]
    Connect(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("not connected")]
    NotConnected,

    #[error("client is closed")]
    Closed,

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// A frame received from the relay
#[derive(Debug, Clone, PartialEq)]
pub struct Incoming {
    /// Value of the `type` field
    pub kind: String,
    /// The whole decoded object, `type` included
    pub body: Value,
}

impl Incoming {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        let body: Value = serde_json::from_str(text)?;
        let kind = body
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| serde_json::Error::custom("frame has no type tag"))?
            .to_string();
        Ok(Self { kind, body })
    }

    /// Decode the frame as a concrete message type
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.body)
    }
}

/// What a [`ReconnectController`] reports to its owner
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// The connection moved to a new state
    State(ConnectionState),
    /// A frame arrived from the relay
    Frame(Incoming),
}
