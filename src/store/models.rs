//! Persistent entities exposed by a [`Store`](super::Store).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::websocket::{ConversationId, UserId};

/// A registered account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub created_at: DateTime<Utc>,
}

/// A conversation as seen by one participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub is_group: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub participants: Vec<String>,
    /// Messages from others newer than this participant's read marker
    #[serde(default)]
    pub unread_count: u32,
}

/// A stored chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sender_username: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Request to open a new conversation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewConversation {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub is_group: bool,
    /// Participants besides the creator
    #[serde(default)]
    pub usernames: Vec<String>,
}
