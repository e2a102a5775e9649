//! Message Dispatch
//!
//! The connection layer knows how to authenticate, queue and fan out frames,
//! but not what any message means. A [`MessageHandler`] supplies that
//! meaning: it turns credentials into an [`AuthGrant`] and each inbound
//! [`Envelope`] into a list of [`Dispatch`] instructions the actor carries
//! out in order.

mod chat;

pub use chat::{ChatEvent, ChatHandler, MESSAGE_HISTORY_LIMIT};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::store::StoreError;
use crate::websocket::{ActorId, AuthPayload, ConversationId, Envelope, Frame, UserId};

/// Errors a handler reports back to the originating connection
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("failed to encode reply: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Result of a successful authentication
#[derive(Debug, Clone, PartialEq)]
pub struct AuthGrant {
    pub user_id: UserId,
    pub username: String,
    /// Conversations the connection is subscribed to on registration
    pub conversation_ids: Vec<ConversationId>,
    /// Extra fields merged into the `auth_success` reply
    pub bootstrap: Map<String, Value>,
}

/// Identity of the authenticated connection an envelope came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub actor_id: ActorId,
    pub user_id: UserId,
    pub username: String,
}

/// One delivery instruction produced by a handler
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// Queue on the originating connection only
    Reply(Frame),
    /// Send to every registered connection
    Broadcast(Frame),
    /// Send to the subscribers of one conversation
    Publish {
        conversation_id: ConversationId,
        frame: Frame,
    },
    /// Subscribe all live connections of these users to a conversation
    Join {
        user_ids: Vec<UserId>,
        conversation_id: ConversationId,
    },
    /// Unsubscribe all live connections of a user from a conversation
    Leave {
        user_id: UserId,
        conversation_id: ConversationId,
    },
}

/// Application logic plugged into every connection
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Log in or register; errors are reported as `auth_error`
    async fn authenticate(&self, request: AuthPayload) -> Result<AuthGrant, HandlerError>;

    /// Interpret one envelope from an authenticated connection
    ///
    /// Unknown tags should yield no dispatches rather than an error.
    async fn handle(
        &self,
        session: &Session,
        envelope: Envelope,
    ) -> Result<Vec<Dispatch>, HandlerError>;
}

/// Decode an envelope payload, reporting failures as [`HandlerError::InvalidPayload`]
pub(crate) fn payload<T: for<'de> Deserialize<'de>>(
    envelope: &Envelope,
) -> Result<T, HandlerError> {
    envelope
        .parse_payload()
        .map_err(|e| HandlerError::InvalidPayload(format!("{}: {}", envelope.kind, e)))
}
