//! Chat message handler
//!
//! Maps the chat protocol's envelope tags onto [`Store`] calls and decides
//! who hears about the result.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Map;
use std::sync::Arc;

use super::{payload, AuthGrant, Dispatch, HandlerError, MessageHandler, Session};
use crate::store::{Conversation, Message, NewConversation, Store, StoreError};
use crate::websocket::{AuthAction, AuthPayload, ConversationId, Envelope, Frame, UserId};

/// How many messages `get_messages` returns
pub const MESSAGE_HISTORY_LIMIT: usize = 100;

/// Events the chat handler sends to clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    Typing {
        conversation_id: ConversationId,
        user_id: UserId,
        username: String,
    },
    UserCheckResult {
        username: String,
        exists: bool,
    },
    ConversationCreated {
        conversation: Conversation,
    },
    Messages {
        conversation_id: ConversationId,
        messages: Vec<Message>,
    },
    NewMessage {
        message: Message,
    },
    Conversations {
        conversations: Vec<Conversation>,
    },
}

#[derive(Debug, Deserialize)]
struct ConversationRef {
    conversation_id: ConversationId,
}

#[derive(Debug, Deserialize)]
struct CheckUser {
    username: String,
}

#[derive(Debug, Deserialize)]
struct SendMessage {
    conversation_id: ConversationId,
    content: String,
}

#[derive(Debug, Deserialize)]
struct AddParticipant {
    conversation_id: ConversationId,
    username: String,
}

#[derive(Debug, Deserialize)]
struct Rename {
    conversation_id: ConversationId,
    #[serde(default)]
    name: String,
}

fn reply(event: &ChatEvent) -> Result<Dispatch, HandlerError> {
    Ok(Dispatch::Reply(Frame::encode(event)?))
}

/// Handler implementing the chat protocol on top of a [`Store`]
pub struct ChatHandler<S> {
    store: Arc<S>,
}

impl<S: Store> ChatHandler<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    async fn require_participant(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
    ) -> Result<(), HandlerError> {
        let participants = self.store.participant_ids(conversation_id).await?;
        if participants.contains(&user_id) {
            Ok(())
        } else {
            Err(StoreError::NotParticipant.into())
        }
    }

    async fn conversations_reply(&self, user_id: UserId) -> Result<Dispatch, HandlerError> {
        let conversations = self.store.user_conversations(user_id).await?;
        reply(&ChatEvent::Conversations { conversations })
    }
}

#[async_trait]
impl<S: Store> MessageHandler for ChatHandler<S> {
    async fn authenticate(&self, request: AuthPayload) -> Result<AuthGrant, HandlerError> {
        let user = match request.action {
            AuthAction::Register => {
                self.store
                    .create_user(&request.username, &request.password)
                    .await?
            }
            AuthAction::Login => {
                self.store
                    .verify_credentials(&request.username, &request.password)
                    .await?
            }
        };

        let conversations = self.store.user_conversations(user.id).await?;
        let conversation_ids = conversations.iter().map(|c| c.id).collect();

        let mut bootstrap = Map::new();
        bootstrap.insert(
            "conversations".to_string(),
            serde_json::to_value(&conversations)?,
        );

        Ok(AuthGrant {
            user_id: user.id,
            username: user.username,
            conversation_ids,
            bootstrap,
        })
    }

    async fn handle(
        &self,
        session: &Session,
        envelope: Envelope,
    ) -> Result<Vec<Dispatch>, HandlerError> {
        match envelope.kind.as_str() {
            "typing" => {
                let target: ConversationRef = payload(&envelope)?;
                self.require_participant(session.user_id, target.conversation_id)
                    .await?;
                let frame = Frame::encode(&ChatEvent::Typing {
                    conversation_id: target.conversation_id,
                    user_id: session.user_id,
                    username: session.username.clone(),
                })?;
                Ok(vec![Dispatch::Publish {
                    conversation_id: target.conversation_id,
                    frame,
                }])
            }

            "check_user" => {
                let request: CheckUser = payload(&envelope)?;
                let exists = self.store.user_exists(&request.username).await?;
                Ok(vec![reply(&ChatEvent::UserCheckResult {
                    username: request.username,
                    exists,
                })?])
            }

            "create_conversation" => {
                let request: NewConversation = payload(&envelope)?;
                let conversation = self
                    .store
                    .create_conversation(session.user_id, request)
                    .await?;
                let user_ids = self.store.participant_ids(conversation.id).await?;
                tracing::debug!(
                    conversation_id = conversation.id,
                    participants = user_ids.len(),
                    "Conversation created"
                );

                Ok(vec![
                    Dispatch::Join {
                        user_ids,
                        conversation_id: conversation.id,
                    },
                    reply(&ChatEvent::ConversationCreated { conversation })?,
                ])
            }

            "get_messages" => {
                let target: ConversationRef = payload(&envelope)?;
                self.store
                    .mark_read(session.user_id, target.conversation_id)
                    .await?;
                let messages = self
                    .store
                    .conversation_messages(target.conversation_id, MESSAGE_HISTORY_LIMIT)
                    .await?;
                Ok(vec![reply(&ChatEvent::Messages {
                    conversation_id: target.conversation_id,
                    messages,
                })?])
            }

            "read_receipt" => {
                let target: ConversationRef = payload(&envelope)?;
                self.store
                    .mark_read(session.user_id, target.conversation_id)
                    .await?;
                Ok(Vec::new())
            }

            "send_message" => {
                let request: SendMessage = payload(&envelope)?;
                let message = self
                    .store
                    .save_message(request.conversation_id, session.user_id, &request.content)
                    .await?;
                let frame = Frame::encode(&ChatEvent::NewMessage { message })?;
                Ok(vec![Dispatch::Publish {
                    conversation_id: request.conversation_id,
                    frame,
                }])
            }

            "get_conversations" => Ok(vec![self.conversations_reply(session.user_id).await?]),

            "add_participant" => {
                let request: AddParticipant = payload(&envelope)?;
                self.require_participant(session.user_id, request.conversation_id)
                    .await?;
                let user_id = self
                    .store
                    .add_participant(request.conversation_id, &request.username)
                    .await?;
                Ok(vec![
                    Dispatch::Join {
                        user_ids: vec![user_id],
                        conversation_id: request.conversation_id,
                    },
                    self.conversations_reply(session.user_id).await?,
                ])
            }

            "rename_conversation" => {
                let request: Rename = payload(&envelope)?;
                self.require_participant(session.user_id, request.conversation_id)
                    .await?;
                self.store
                    .rename_conversation(request.conversation_id, &request.name)
                    .await?;
                Ok(vec![self.conversations_reply(session.user_id).await?])
            }

            "leave_conversation" => {
                let target: ConversationRef = payload(&envelope)?;
                self.store
                    .leave_conversation(session.user_id, target.conversation_id)
                    .await?;
                Ok(vec![
                    Dispatch::Leave {
                        user_id: session.user_id,
                        conversation_id: target.conversation_id,
                    },
                    self.conversations_reply(session.user_id).await?,
                ])
            }

            other => {
                tracing::debug!(kind = other, user_id = session.user_id, "Ignoring unknown message type");
                Ok(Vec::new())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::{json, Value};
    use uuid::Uuid;

    fn handler() -> ChatHandler<MemoryStore> {
        ChatHandler::new(Arc::new(MemoryStore::new()))
    }

    fn auth(username: &str, action: AuthAction) -> AuthPayload {
        AuthPayload {
            username: username.to_string(),
            password: "secret".to_string(),
            action,
        }
    }

    async fn session(handler: &ChatHandler<MemoryStore>, username: &str) -> Session {
        let grant = handler
            .authenticate(auth(username, AuthAction::Register))
            .await
            .unwrap();
        Session {
            actor_id: Uuid::new_v4(),
            user_id: grant.user_id,
            username: grant.username,
        }
    }

    fn envelope(kind: &str, payload: Value) -> Envelope {
        Envelope {
            kind: kind.to_string(),
            payload,
        }
    }

    fn frame_json(dispatch: &Dispatch) -> Value {
        let frame = match dispatch {
            Dispatch::Reply(frame) | Dispatch::Broadcast(frame) => frame,
            Dispatch::Publish { frame, .. } => frame,
            other => panic!("dispatch carries no frame: {:?}", other),
        };
        serde_json::from_str(frame.as_str()).unwrap()
    }

    async fn open_conversation(
        handler: &ChatHandler<MemoryStore>,
        creator: &Session,
        others: &[&str],
    ) -> ConversationId {
        let out = handler
            .handle(
                creator,
                envelope("create_conversation", json!({ "usernames": others })),
            )
            .await
            .unwrap();
        frame_json(&out[1])["conversation"]["id"].as_i64().unwrap()
    }

    #[tokio::test]
    async fn test_register_then_login() {
        let handler = handler();
        let registered = handler
            .authenticate(auth("ana", AuthAction::Register))
            .await
            .unwrap();
        assert!(registered.conversation_ids.is_empty());
        assert_eq!(registered.bootstrap["conversations"], json!([]));

        let logged_in = handler
            .authenticate(auth("ana", AuthAction::Login))
            .await
            .unwrap();
        assert_eq!(logged_in.user_id, registered.user_id);

        let err = handler
            .authenticate(AuthPayload {
                password: "nope".into(),
                ..auth("ana", AuthAction::Login)
            })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "invalid username or password");

        let err = handler
            .authenticate(auth("ana", AuthAction::Register))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "username already taken");
    }

    #[tokio::test]
    async fn test_create_conversation_joins_everyone() {
        let handler = handler();
        let ana = session(&handler, "ana").await;
        let bob = session(&handler, "bob").await;

        let out = handler
            .handle(
                &ana,
                envelope("create_conversation", json!({ "name": "plans", "usernames": ["bob"] })),
            )
            .await
            .unwrap();
        assert_eq!(out.len(), 2);

        let created = frame_json(&out[1]);
        assert_eq!(created["type"], "conversation_created");
        let conversation_id = created["conversation"]["id"].as_i64().unwrap();

        match &out[0] {
            Dispatch::Join {
                user_ids,
                conversation_id: joined,
            } => {
                assert_eq!(*joined, conversation_id);
                assert_eq!(user_ids, &vec![ana.user_id, bob.user_id]);
            }
            other => panic!("expected join, got {:?}", other),
        }

        // The bootstrap on the next login lists it
        let grant = handler
            .authenticate(auth("bob", AuthAction::Login))
            .await
            .unwrap();
        assert_eq!(grant.conversation_ids, vec![conversation_id]);
    }

    #[tokio::test]
    async fn test_send_message_is_published_to_conversation() {
        let handler = handler();
        let ana = session(&handler, "ana").await;
        session(&handler, "bob").await;
        let conversation_id = open_conversation(&handler, &ana, &["bob"]).await;

        let out = handler
            .handle(
                &ana,
                envelope(
                    "send_message",
                    json!({ "conversation_id": conversation_id, "content": "hello" }),
                ),
            )
            .await
            .unwrap();

        assert_eq!(out.len(), 1);
        match &out[0] {
            Dispatch::Publish {
                conversation_id: target,
                ..
            } => assert_eq!(*target, conversation_id),
            other => panic!("expected publish, got {:?}", other),
        }
        let value = frame_json(&out[0]);
        assert_eq!(value["type"], "new_message");
        assert_eq!(value["message"]["content"], "hello");
        assert_eq!(value["message"]["sender_username"], "ana");
    }

    #[tokio::test]
    async fn test_outsider_cannot_send_or_read() {
        let handler = handler();
        let ana = session(&handler, "ana").await;
        session(&handler, "bob").await;
        let eve = session(&handler, "eve").await;
        let conversation_id = open_conversation(&handler, &ana, &["bob"]).await;

        let err = handler
            .handle(
                &eve,
                envelope(
                    "send_message",
                    json!({ "conversation_id": conversation_id, "content": "psst" }),
                ),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Store(StoreError::NotParticipant)));

        let err = handler
            .handle(
                &eve,
                envelope("get_messages", json!({ "conversation_id": conversation_id })),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Store(StoreError::NotParticipant)));
    }

    #[tokio::test]
    async fn test_get_messages_marks_read() {
        let handler = handler();
        let ana = session(&handler, "ana").await;
        let bob = session(&handler, "bob").await;
        let conversation_id = open_conversation(&handler, &ana, &["bob"]).await;

        for text in ["one", "two"] {
            handler
                .handle(
                    &ana,
                    envelope(
                        "send_message",
                        json!({ "conversation_id": conversation_id, "content": text }),
                    ),
                )
                .await
                .unwrap();
        }

        let out = handler
            .handle(&bob, envelope("get_conversations", Value::Null))
            .await
            .unwrap();
        assert_eq!(frame_json(&out[0])["conversations"][0]["unread_count"], 2);

        let out = handler
            .handle(
                &bob,
                envelope("get_messages", json!({ "conversation_id": conversation_id })),
            )
            .await
            .unwrap();
        let value = frame_json(&out[0]);
        assert_eq!(value["type"], "messages");
        assert_eq!(value["messages"].as_array().unwrap().len(), 2);

        let out = handler
            .handle(&bob, envelope("get_conversations", Value::Null))
            .await
            .unwrap();
        assert_eq!(frame_json(&out[0])["conversations"][0]["unread_count"], 0);
    }

    #[tokio::test]
    async fn test_typing_and_check_user() {
        let handler = handler();
        let ana = session(&handler, "ana").await;
        session(&handler, "bob").await;
        let conversation_id = open_conversation(&handler, &ana, &["bob"]).await;

        let out = handler
            .handle(&ana, envelope("typing", json!({ "conversation_id": conversation_id })))
            .await
            .unwrap();
        let value = frame_json(&out[0]);
        assert_eq!(value["type"], "typing");
        assert_eq!(value["username"], "ana");

        let out = handler
            .handle(&ana, envelope("check_user", json!({ "username": "zed" })))
            .await
            .unwrap();
        let value = frame_json(&out[0]);
        assert_eq!(value["type"], "user_check_result");
        assert_eq!(value["exists"], false);
    }

    #[tokio::test]
    async fn test_add_rename_leave() {
        let handler = handler();
        let ana = session(&handler, "ana").await;
        session(&handler, "bob").await;
        let cy = session(&handler, "cy").await;
        let conversation_id = open_conversation(&handler, &ana, &["bob"]).await;

        let out = handler
            .handle(
                &ana,
                envelope(
                    "add_participant",
                    json!({ "conversation_id": conversation_id, "username": "cy" }),
                ),
            )
            .await
            .unwrap();
        assert_eq!(
            out[0],
            Dispatch::Join {
                user_ids: vec![cy.user_id],
                conversation_id
            }
        );

        let out = handler
            .handle(
                &cy,
                envelope(
                    "rename_conversation",
                    json!({ "conversation_id": conversation_id, "name": "trio" }),
                ),
            )
            .await
            .unwrap();
        assert_eq!(frame_json(&out[0])["conversations"][0]["name"], "trio");

        let out = handler
            .handle(
                &cy,
                envelope("leave_conversation", json!({ "conversation_id": conversation_id })),
            )
            .await
            .unwrap();
        assert_eq!(
            out[0],
            Dispatch::Leave {
                user_id: cy.user_id,
                conversation_id
            }
        );
        assert_eq!(frame_json(&out[1])["conversations"], json!([]));
    }

    #[tokio::test]
    async fn test_unknown_tag_and_bad_payload() {
        let handler = handler();
        let ana = session(&handler, "ana").await;

        let out = handler
            .handle(&ana, envelope("dance", json!({})))
            .await
            .unwrap();
        assert!(out.is_empty());

        let err = handler
            .handle(&ana, envelope("send_message", json!({ "content": 5 })))
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::InvalidPayload(_)));
    }
}
