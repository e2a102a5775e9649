//! In-memory store
//!
//! Keeps every entity in process memory behind one `RwLock`. Passwords are
//! kept as salted SHA-256 digests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{Conversation, Message, NewConversation, Store, StoreError, StoreResult, User};
use crate::websocket::{ConversationId, UserId};

const MAX_USERNAME_LEN: usize = 32;

struct Account {
    user: User,
    salt: String,
    digest: String,
}

struct Room {
    id: ConversationId,
    name: Option<String>,
    is_group: bool,
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    participants: Vec<UserId>,
    messages: Vec<Message>,
}

#[derive(Default)]
struct Tables {
    next_user_id: UserId,
    next_conversation_id: ConversationId,
    next_message_id: i64,
    accounts: HashMap<UserId, Account>,
    usernames: HashMap<String, UserId>,
    rooms: HashMap<ConversationId, Room>,
    /// (user, conversation) → id of the last message read
    read_markers: HashMap<(UserId, ConversationId), i64>,
}

impl Tables {
    fn username(&self, id: UserId) -> String {
        self.accounts
            .get(&id)
            .map(|a| a.user.username.clone())
            .unwrap_or_default()
    }

    fn room(&self, id: ConversationId) -> StoreResult<&Room> {
        self.rooms.get(&id).ok_or(StoreError::ConversationNotFound)
    }

    fn room_mut(&mut self, id: ConversationId) -> StoreResult<&mut Room> {
        self.rooms.get_mut(&id).ok_or(StoreError::ConversationNotFound)
    }

    fn view(&self, room: &Room, viewer: UserId) -> Conversation {
        let marker = self.read_markers.get(&(viewer, room.id)).copied().unwrap_or(0);
        let unread = room
            .messages
            .iter()
            .filter(|m| m.id > marker && m.sender_id != viewer)
            .count();

        Conversation {
            id: room.id,
            name: room.name.clone(),
            is_group: room.is_group,
            created_at: room.created_at,
            participants: room.participants.iter().map(|id| self.username(*id)).collect(),
            unread_count: unread as u32,
        }
    }
}

/// Store that lives entirely in process memory
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn digest(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn normalize_username(username: &str) -> StoreResult<String> {
    let username = username.trim();
    if username.is_empty() {
        return Err(StoreError::InvalidInput("username must not be empty".into()));
    }
    if username.chars().count() > MAX_USERNAME_LEN {
        return Err(StoreError::InvalidInput(format!(
            "username must be at most {} characters",
            MAX_USERNAME_LEN
        )));
    }
    Ok(username.to_string())
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_user(&self, username: &str, password: &str) -> StoreResult<User> {
        let username = normalize_username(username)?;
        if password.is_empty() {
            return Err(StoreError::InvalidInput("password must not be empty".into()));
        }

        let mut tables = self.tables.write().await;
        if tables.usernames.contains_key(&username) {
            return Err(StoreError::UserExists);
        }

        tables.next_user_id += 1;
        let user = User {
            id: tables.next_user_id,
            username: username.clone(),
            created_at: Utc::now(),
        };
        let salt = Uuid::new_v4().to_string();
        let account = Account {
            user: user.clone(),
            digest: digest(&salt, password),
            salt,
        };

        tables.usernames.insert(username, user.id);
        tables.accounts.insert(user.id, account);
        Ok(user)
    }

    async fn verify_credentials(&self, username: &str, password: &str) -> StoreResult<User> {
        let tables = self.tables.read().await;
        let account = tables
            .usernames
            .get(username.trim())
            .and_then(|id| tables.accounts.get(id))
            .ok_or(StoreError::InvalidCredentials)?;

        if digest(&account.salt, password) != account.digest {
            return Err(StoreError::InvalidCredentials);
        }
        Ok(account.user.clone())
    }

    async fn user_exists(&self, username: &str) -> StoreResult<bool> {
        Ok(self.tables.read().await.usernames.contains_key(username.trim()))
    }

    async fn user_conversations(&self, user_id: UserId) -> StoreResult<Vec<Conversation>> {
        let tables = self.tables.read().await;
        let mut rooms: Vec<&Room> = tables
            .rooms
            .values()
            .filter(|r| r.participants.contains(&user_id))
            .collect();
        rooms.sort_by(|a, b| b.last_activity.cmp(&a.last_activity).then(b.id.cmp(&a.id)));

        Ok(rooms.into_iter().map(|r| tables.view(r, user_id)).collect())
    }

    async fn create_conversation(
        &self,
        creator: UserId,
        request: NewConversation,
    ) -> StoreResult<Conversation> {
        let mut tables = self.tables.write().await;
        if !tables.accounts.contains_key(&creator) {
            return Err(StoreError::UserNotFound(creator.to_string()));
        }

        let mut participants = vec![creator];
        for username in &request.usernames {
            let username = username.trim();
            if username.is_empty() {
                continue;
            }
            let id = *tables
                .usernames
                .get(username)
                .ok_or_else(|| StoreError::UserNotFound(username.to_string()))?;
            if !participants.contains(&id) {
                participants.push(id);
            }
        }
        if participants.len() < 2 {
            return Err(StoreError::InvalidInput(
                "a conversation needs at least one other participant".into(),
            ));
        }

        let name = request
            .name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty());
        let now = Utc::now();

        tables.next_conversation_id += 1;
        let room = Room {
            id: tables.next_conversation_id,
            name,
            is_group: request.is_group || participants.len() > 2,
            created_at: now,
            last_activity: now,
            participants,
            messages: Vec::new(),
        };
        let view = tables.view(&room, creator);
        tables.rooms.insert(room.id, room);
        Ok(view)
    }

    async fn add_participant(
        &self,
        conversation_id: ConversationId,
        username: &str,
    ) -> StoreResult<UserId> {
        let mut tables = self.tables.write().await;
        let user_id = *tables
            .usernames
            .get(username.trim())
            .ok_or_else(|| StoreError::UserNotFound(username.trim().to_string()))?;

        let room = tables.room_mut(conversation_id)?;
        if !room.participants.contains(&user_id) {
            room.participants.push(user_id);
            room.is_group = room.participants.len() > 2 || room.is_group;
        }
        Ok(user_id)
    }

    async fn rename_conversation(
        &self,
        conversation_id: ConversationId,
        name: &str,
    ) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let room = tables.room_mut(conversation_id)?;
        let name = name.trim();
        room.name = (!name.is_empty()).then(|| name.to_string());
        Ok(())
    }

    async fn leave_conversation(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
    ) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let room = tables.room_mut(conversation_id)?;
        let before = room.participants.len();
        room.participants.retain(|id| *id != user_id);
        if room.participants.len() == before {
            return Err(StoreError::NotParticipant);
        }
        if room.participants.is_empty() {
            tables.rooms.remove(&conversation_id);
        }
        tables.read_markers.remove(&(user_id, conversation_id));
        Ok(())
    }

    async fn mark_read(&self, user_id: UserId, conversation_id: ConversationId) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let room = tables.room(conversation_id)?;
        if !room.participants.contains(&user_id) {
            return Err(StoreError::NotParticipant);
        }
        let newest = room.messages.last().map(|m| m.id).unwrap_or(0);
        tables.read_markers.insert((user_id, conversation_id), newest);
        Ok(())
    }

    async fn conversation_messages(
        &self,
        conversation_id: ConversationId,
        limit: usize,
    ) -> StoreResult<Vec<Message>> {
        let tables = self.tables.read().await;
        let room = tables.room(conversation_id)?;
        let skip = room.messages.len().saturating_sub(limit);
        Ok(room.messages[skip..].to_vec())
    }

    async fn save_message(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        content: &str,
    ) -> StoreResult<Message> {
        let content = content.trim();
        if content.is_empty() {
            return Err(StoreError::InvalidInput("message must not be empty".into()));
        }

        let mut tables = self.tables.write().await;
        let sender_username = tables.username(sender_id);
        tables.next_message_id += 1;
        let id = tables.next_message_id;

        let room = tables.room_mut(conversation_id)?;
        if !room.participants.contains(&sender_id) {
            return Err(StoreError::NotParticipant);
        }

        let message = Message {
            id,
            conversation_id,
            sender_id,
            sender_username,
            content: content.to_string(),
            created_at: Utc::now(),
        };
        room.last_activity = message.created_at;
        room.messages.push(message.clone());
        Ok(message)
    }

    async fn participant_ids(&self, conversation_id: ConversationId) -> StoreResult<Vec<UserId>> {
        let tables = self.tables.read().await;
        Ok(tables.room(conversation_id)?.participants.clone())
    }
}
