//! WebSocket Connection Hub
//!
//! Registry of authenticated connections and the fan-out point for
//! everything sent to more than one of them. One mutex guards the registry;
//! delivery paths snapshot the recipients, release the lock, push frames
//! without blocking, then evict whichever recipients could not keep up.

use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;

use super::messages::{ConversationId, Frame, UserId};
use super::outbox::{ActorId, Outbox, PushError, DEFAULT_QUEUE_CAPACITY};

/// How conversation traffic is fanned out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Only connections subscribed to the conversation receive it
    #[default]
    Scoped,
    /// Every registered connection receives everything
    Global,
}

impl std::str::FromStr for DeliveryMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "scoped" => Ok(DeliveryMode::Scoped),
            "global" => Ok(DeliveryMode::Global),
            other => Err(format!("unknown delivery mode: {}", other)),
        }
    }
}

/// Configuration for the connection hub
#[derive(Debug, Clone, Deserialize)]
pub struct HubConfig {
    /// Outbound queue depth per connection
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Fan-out policy for conversation traffic
    #[serde(default)]
    pub delivery: DeliveryMode,
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            delivery: DeliveryMode::default(),
        }
    }
}

/// A registered connection
struct Member {
    outbox: Outbox,
    user_id: UserId,
    conversations: HashSet<ConversationId>,
}

#[derive(Default)]
struct Registry {
    /// Registered connections: ActorId → Member
    members: HashMap<ActorId, Member>,
    /// Conversation → subscribed ActorIds
    topics: HashMap<ConversationId, HashSet<ActorId>>,
}

impl Registry {
    fn remove(&mut self, id: &ActorId) -> Option<Member> {
        let member = self.members.remove(id)?;
        for conversation in &member.conversations {
            if let Some(subscribers) = self.topics.get_mut(conversation) {
                subscribers.remove(id);
                if subscribers.is_empty() {
                    self.topics.remove(conversation);
                }
            }
        }
        Some(member)
    }

    fn subscribe(&mut self, id: ActorId, conversation: ConversationId) -> bool {
        let Some(member) = self.members.get_mut(&id) else {
            return false;
        };
        member.conversations.insert(conversation);
        self.topics.entry(conversation).or_default().insert(id);
        true
    }

    fn unsubscribe(&mut self, id: ActorId, conversation: ConversationId) {
        if let Some(member) = self.members.get_mut(&id) {
            member.conversations.remove(&conversation);
        }
        if let Some(subscribers) = self.topics.get_mut(&conversation) {
            subscribers.remove(&id);
            if subscribers.is_empty() {
                self.topics.remove(&conversation);
            }
        }
    }

    fn actors_of(&self, user_id: UserId) -> Vec<ActorId> {
        self.members
            .iter()
            .filter(|(_, m)| m.user_id == user_id)
            .map(|(id, _)| *id)
            .collect()
    }
}

/// Outcome of one fan-out pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    /// Recipients whose queue accepted the frame
    pub delivered: usize,
    /// Recipients evicted because their queue was full or closed
    pub evicted: usize,
}

/// Manages all authenticated connections and their subscriptions
pub struct Hub {
    registry: Mutex<Registry>,
    config: HubConfig,
}

impl Hub {
    /// Create a new hub
    pub fn new(config: HubConfig) -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            config,
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Register an authenticated connection
    ///
    /// Returns false if the connection is already registered; the existing
    /// entry is left untouched.
    pub async fn register(&self, outbox: Outbox, user_id: UserId) -> bool {
        let id = outbox.id();
        let mut registry = self.registry.lock().await;
        if registry.members.contains_key(&id) {
            tracing::warn!(connection_id = %id, "Connection already registered");
            return false;
        }
        registry.members.insert(
            id,
            Member {
                outbox,
                user_id,
                conversations: HashSet::new(),
            },
        );
        drop(registry);

        tracing::info!(connection_id = %id, user_id, "Connection registered");
        true
    }

    /// Remove a connection and close its outbound queue
    ///
    /// No-op if the connection is not registered.
    pub async fn unregister(&self, id: ActorId) -> bool {
        let removed = self.registry.lock().await.remove(&id);

        match removed {
            Some(member) => {
                member.outbox.close();
                tracing::info!(connection_id = %id, user_id = member.user_id, "Connection unregistered");
                true
            }
            None => false,
        }
    }

    /// Subscribe a registered connection to conversations
    pub async fn subscribe(&self, id: ActorId, conversations: &[ConversationId]) {
        let mut registry = self.registry.lock().await;
        for conversation in conversations {
            if !registry.subscribe(id, *conversation) {
                tracing::debug!(connection_id = %id, "Subscribe for unregistered connection ignored");
                return;
            }
        }
        tracing::debug!(
            connection_id = %id,
            conversations = ?conversations,
            "Subscribed to conversations"
        );
    }

    /// Subscribe every live connection of a user to a conversation
    pub async fn join_user(&self, user_id: UserId, conversation: ConversationId) -> usize {
        let mut registry = self.registry.lock().await;
        let actors = registry.actors_of(user_id);
        for id in &actors {
            registry.subscribe(*id, conversation);
        }
        actors.len()
    }

    /// Unsubscribe every live connection of a user from a conversation
    pub async fn leave_user(&self, user_id: UserId, conversation: ConversationId) -> usize {
        let mut registry = self.registry.lock().await;
        let actors = registry.actors_of(user_id);
        for id in &actors {
            registry.unsubscribe(*id, conversation);
        }
        actors.len()
    }

    /// Deliver a frame to every registered connection
    pub async fn broadcast(&self, frame: &Frame) -> Delivery {
        let recipients: Vec<Outbox> = {
            let registry = self.registry.lock().await;
            registry.members.values().map(|m| m.outbox.clone()).collect()
        };

        let delivery = self.deliver(recipients, frame).await;
        tracing::trace!(
            delivered = delivery.delivered,
            evicted = delivery.evicted,
            "Broadcast frame"
        );
        delivery
    }

    /// Deliver a frame to a conversation's subscribers
    ///
    /// Falls back to [`Hub::broadcast`] under [`DeliveryMode::Global`].
    pub async fn publish(&self, conversation: ConversationId, frame: &Frame) -> Delivery {
        if self.config.delivery == DeliveryMode::Global {
            return self.broadcast(frame).await;
        }

        let recipients: Vec<Outbox> = {
            let registry = self.registry.lock().await;
            registry
                .topics
                .get(&conversation)
                .map(|ids| {
                    ids.iter()
                        .filter_map(|id| registry.members.get(id))
                        .map(|m| m.outbox.clone())
                        .collect()
                })
                .unwrap_or_default()
        };

        let delivery = self.deliver(recipients, frame).await;
        tracing::trace!(
            conversation,
            delivered = delivery.delivered,
            evicted = delivery.evicted,
            "Published frame"
        );
        delivery
    }

    async fn deliver(&self, recipients: Vec<Outbox>, frame: &Frame) -> Delivery {
        let mut delivery = Delivery::default();
        let mut failed = Vec::new();

        for outbox in recipients {
            match outbox.push(frame.clone()) {
                Ok(()) => delivery.delivered += 1,
                Err(PushError::Full) => {
                    tracing::warn!(connection_id = %outbox.id(), "Outbound queue full, dropping connection");
                    failed.push(outbox);
                }
                Err(PushError::Closed) => failed.push(outbox),
            }
        }

        if !failed.is_empty() {
            let mut registry = self.registry.lock().await;
            for outbox in failed {
                if registry.remove(&outbox.id()).is_some() {
                    delivery.evicted += 1;
                }
                outbox.close();
            }
        }

        delivery
    }

    /// Whether a connection is currently registered
    pub async fn is_registered(&self, id: ActorId) -> bool {
        self.registry.lock().await.members.contains_key(&id)
    }

    /// Get the current connection count
    pub async fn connection_count(&self) -> usize {
        self.registry.lock().await.members.len()
    }

    /// Get subscriber count for a conversation
    pub async fn subscriber_count(&self, conversation: ConversationId) -> usize {
        self.registry
            .lock()
            .await
            .topics
            .get(&conversation)
            .map(|s| s.len())
            .unwrap_or(0)
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(HubConfig::default())
    }
}
