//! WebSocket Message Types
//!
//! Wire formats shared by the relay and its clients. Inbound traffic is a
//! tagged envelope whose payload the core never looks inside; outbound
//! traffic is a flat object tagged by `type`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

/// Identifier of an authenticated user
pub type UserId = i64;

/// Identifier of a conversation
pub type ConversationId = i64;

/// Tag of the authentication envelope
pub const AUTH: &str = "auth";

/// Tag of a successful authentication reply
pub const AUTH_SUCCESS: &str = "auth_success";

/// Tag of a rejected authentication reply
pub const AUTH_ERROR: &str = "auth_error";

/// Inbound unit: a logical type tag and an opaque payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    /// Build an envelope from any serializable payload
    pub fn new<T: Serialize>(kind: impl Into<String>, payload: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            kind: kind.into(),
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Interpret the payload as a concrete type
    pub fn parse_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }
}

/// Whether an auth envelope logs in or creates an account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthAction {
    #[default]
    Login,
    Register,
}

/// Payload of an `auth` envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthPayload {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub action: AuthAction,
}

/// Replies produced by the relay itself
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Authentication accepted
    AuthSuccess {
        user_id: UserId,
        username: String,
        /// Session bootstrap data supplied by the message handler
        #[serde(flatten)]
        bootstrap: Map<String, Value>,
    },
    /// Authentication rejected; the connection stays open
    AuthError {
        message: String,
    },
    /// Generic error
    Error {
        message: String,
    },
}

impl ServerMessage {
    /// Shorthand for a generic error reply
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    /// Shorthand for an authentication rejection
    pub fn auth_error(message: impl Into<String>) -> Self {
        ServerMessage::AuthError {
            message: message.into(),
        }
    }
}

/// One serialized outbound message
///
/// Cloning shares the underlying text, so a broadcast serializes once no
/// matter how many recipients it has.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Frame(Arc<str>);

impl Frame {
    /// Serialize a message into a frame
    pub fn encode<T: Serialize + ?Sized>(message: &T) -> Result<Self, serde_json::Error> {
        Ok(Self(serde_json::to_string(message)?.into()))
    }

    /// Wrap already-serialized text
    pub fn from_text(text: impl Into<Arc<str>>) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<ServerMessage> for Frame {
    fn from(message: ServerMessage) -> Self {
        // Every ServerMessage variant is a string-keyed object; encoding cannot fail.
        Frame::encode(&message).unwrap_or_else(|_| Frame::from_text(r#"{"type":"error"}"#))
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
