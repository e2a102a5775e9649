//! Persistence Interface
//!
//! The relay never owns durable state. Everything it needs from storage goes
//! through the [`Store`] trait; [`MemoryStore`] is the in-process
//! implementation used by the bundled server and the tests.

mod memory;
mod models;

pub use memory::MemoryStore;
pub use models::{Conversation, Message, NewConversation, User};

use async_trait::async_trait;
use thiserror::Error;

use crate::websocket::{ConversationId, UserId};

/// Errors a store can report
///
/// Display strings are shown to end users as-is.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("username already taken")]
    UserExists,

    #[error("user not found: {0}")]
    UserNotFound(String),

    #[error("invalid username or password")]
    InvalidCredentials,

    #[error("conversation not found")]
    ConversationNotFound,

    #[error("not a participant of this conversation")]
    NotParticipant,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Query and transaction interface consumed by the chat handler
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Create an account
    async fn create_user(&self, username: &str, password: &str) -> StoreResult<User>;

    /// Look up an account by its credentials
    async fn verify_credentials(&self, username: &str, password: &str) -> StoreResult<User>;

    /// Whether a username is taken
    async fn user_exists(&self, username: &str) -> StoreResult<bool>;

    /// Conversations a user participates in, most recently active first
    async fn user_conversations(&self, user_id: UserId) -> StoreResult<Vec<Conversation>>;

    /// Open a conversation between the creator and the named users
    async fn create_conversation(
        &self,
        creator: UserId,
        request: NewConversation,
    ) -> StoreResult<Conversation>;

    /// Add a user to a conversation, returning the user's id
    async fn add_participant(
        &self,
        conversation_id: ConversationId,
        username: &str,
    ) -> StoreResult<UserId>;

    async fn rename_conversation(
        &self,
        conversation_id: ConversationId,
        name: &str,
    ) -> StoreResult<()>;

    async fn leave_conversation(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
    ) -> StoreResult<()>;

    /// Move the user's read marker to the newest message
    async fn mark_read(&self, user_id: UserId, conversation_id: ConversationId) -> StoreResult<()>;

    /// Newest `limit` messages in chronological order
    async fn conversation_messages(
        &self,
        conversation_id: ConversationId,
        limit: usize,
    ) -> StoreResult<Vec<Message>>;

    /// Append a message; the sender must be a participant
    async fn save_message(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        content: &str,
    ) -> StoreResult<Message>;

    /// Ids of everyone in a conversation
    async fn participant_ids(&self, conversation_id: ConversationId) -> StoreResult<Vec<UserId>>;
}
