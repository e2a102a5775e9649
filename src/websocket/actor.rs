//! Connection Actor
//!
//! Owns one client connection for its whole life. Two tasks run side by
//! side: the writer drains the outbound queue to the transport in FIFO
//! order, the reader decodes envelopes and acts on them. Whichever finishes
//! first takes the other down, and the actor leaves the hub exactly once.
//!
//! ```text
//! Unauthenticated --auth ok--> Authenticated --read error / close--> Closed
//!        |                                                            ^
//!        +------------------- read error / close ---------------------+
//! ```

use axum::extract::ws::Message;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::Display;
use std::sync::Arc;
use uuid::Uuid;

use super::hub::Hub;
use super::messages::{AuthPayload, Envelope, Frame, ServerMessage, AUTH};
use super::outbox::{ActorId, Outbox, OutboxReceiver};
use crate::dispatch::{Dispatch, MessageHandler, Session};
use crate::governor::RateGovernor;

const RATE_LIMITED: &str = "Too many login attempts. Please wait a minute.";

/// One client connection
pub struct ConnectionActor {
    id: ActorId,
    address: String,
    hub: Arc<Hub>,
    governor: Arc<RateGovernor>,
    handler: Arc<dyn MessageHandler>,
    outbox: Outbox,
    receiver: OutboxReceiver,
}

impl ConnectionActor {
    /// Create an actor whose queue depth follows the hub configuration
    pub fn new(
        hub: Arc<Hub>,
        governor: Arc<RateGovernor>,
        handler: Arc<dyn MessageHandler>,
        address: impl Into<String>,
    ) -> Self {
        let id = Uuid::new_v4();
        let (outbox, receiver) = Outbox::channel(id, hub.config().queue_capacity);
        Self {
            id,
            address: address.into(),
            hub,
            governor,
            handler,
            outbox,
            receiver,
        }
    }

    pub fn id(&self) -> ActorId {
        self.id
    }

    /// Pump the connection until either direction fails or the peer closes
    pub async fn run<R, W, E>(self, stream: R, sink: W)
    where
        R: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
        W: Sink<Message> + Unpin + Send + 'static,
        W::Error: Display,
        E: Display + Send + 'static,
    {
        let ConnectionActor {
            id,
            address,
            hub,
            governor,
            handler,
            outbox,
            receiver,
        } = self;

        tracing::info!(connection_id = %id, address = %address, "Connection opened");

        let mut send_task = tokio::spawn(write_loop(id, receiver, sink));

        let reader = Reader {
            id,
            address,
            hub: Arc::clone(&hub),
            governor,
            handler,
            outbox: outbox.clone(),
            session: None,
        };
        let mut recv_task = tokio::spawn(reader.read_loop(stream));

        tokio::select! {
            _ = &mut send_task => {
                recv_task.abort();
            }
            _ = &mut recv_task => {
                send_task.abort();
            }
            // Evicted or failed a reply while the writer may be stuck on the transport
            _ = outbox.closed() => {
                tracing::debug!(connection_id = %id, "Outbound queue closed, dropping transport");
                send_task.abort();
                recv_task.abort();
            }
        }

        hub.unregister(id).await;
        outbox.close();
        tracing::info!(connection_id = %id, "Connection closed");
    }
}

async fn write_loop<W>(id: ActorId, mut receiver: OutboxReceiver, mut sink: W)
where
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    while let Some(frame) = receiver.recv().await {
        if let Err(e) = sink.send(Message::Text(frame.as_str().to_owned())).await {
            tracing::debug!(connection_id = %id, error = %e, "Send failed, closing connection");
            return;
        }
    }
    let _ = sink.close().await;
}

/// Inbound half of an actor
struct Reader {
    id: ActorId,
    address: String,
    hub: Arc<Hub>,
    governor: Arc<RateGovernor>,
    handler: Arc<dyn MessageHandler>,
    outbox: Outbox,
    session: Option<Session>,
}

impl Reader {
    async fn read_loop<R, E>(mut self, mut stream: R)
    where
        R: Stream<Item = Result<Message, E>> + Unpin,
        E: Display,
    {
        while let Some(result) = stream.next().await {
            let message = match result {
                Ok(message) => message,
                Err(e) => {
                    tracing::debug!(connection_id = %self.id, error = %e, "Receive error");
                    break;
                }
            };
            if !self.on_message(message).await {
                break;
            }
            // Evicted by a fan-out while we were busy
            if self.outbox.is_closed() {
                break;
            }
        }
    }

    /// Returns false once the connection should close
    async fn on_message(&mut self, message: Message) -> bool {
        match message {
            Message::Text(text) => {
                let envelope = match serde_json::from_str::<Envelope>(&text) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        tracing::debug!(connection_id = %self.id, error = %e, "Discarding malformed envelope");
                        return true;
                    }
                };
                self.on_envelope(envelope).await
            }
            Message::Binary(_) => {
                self.reply(ServerMessage::error("Binary messages not supported").into())
                    .await
            }
            Message::Ping(_) | Message::Pong(_) => true,
            Message::Close(_) => {
                tracing::debug!(connection_id = %self.id, "Client requested close");
                false
            }
        }
    }

    async fn on_envelope(&mut self, envelope: Envelope) -> bool {
        if envelope.kind == AUTH {
            return self.authenticate(envelope).await;
        }

        let Some(session) = self.session.clone() else {
            tracing::debug!(connection_id = %self.id, kind = %envelope.kind, "Ignoring message before authentication");
            return true;
        };

        let kind = envelope.kind.clone();
        match self.handler.handle(&session, envelope).await {
            Ok(dispatches) => self.apply(dispatches).await,
            Err(e) => {
                tracing::debug!(connection_id = %self.id, kind = %kind, error = %e, "Handler rejected message");
                self.reply(ServerMessage::error(e.to_string()).into()).await
            }
        }
    }

    async fn authenticate(&mut self, envelope: Envelope) -> bool {
        if self.session.is_some() {
            return self
                .reply(ServerMessage::error("Already authenticated").into())
                .await;
        }

        if !self.governor.can_attempt_authentication(&self.address) {
            tracing::warn!(connection_id = %self.id, address = %self.address, "Authentication rate limited");
            return self.reply(ServerMessage::auth_error(RATE_LIMITED).into()).await;
        }

        let request: AuthPayload = match envelope.parse_payload() {
            Ok(request) => request,
            Err(e) => {
                tracing::debug!(connection_id = %self.id, error = %e, "Malformed auth payload");
                return self
                    .reply(ServerMessage::auth_error("Invalid auth payload").into())
                    .await;
            }
        };

        let grant = match self.handler.authenticate(request).await {
            Ok(grant) => grant,
            Err(e) => {
                tracing::warn!(connection_id = %self.id, address = %self.address, error = %e, "Authentication failed");
                return self.reply(ServerMessage::auth_error(e.to_string()).into()).await;
            }
        };

        if !self.hub.register(self.outbox.clone(), grant.user_id).await {
            return self
                .reply(ServerMessage::error("Already authenticated").into())
                .await;
        }
        self.hub.subscribe(self.id, &grant.conversation_ids).await;

        tracing::info!(
            connection_id = %self.id,
            user_id = grant.user_id,
            username = %grant.username,
            "Authenticated"
        );
        self.session = Some(Session {
            actor_id: self.id,
            user_id: grant.user_id,
            username: grant.username.clone(),
        });

        let success = ServerMessage::AuthSuccess {
            user_id: grant.user_id,
            username: grant.username,
            bootstrap: grant.bootstrap,
        };
        self.reply(success.into()).await
    }

    async fn apply(&self, dispatches: Vec<Dispatch>) -> bool {
        for dispatch in dispatches {
            match dispatch {
                Dispatch::Reply(frame) => {
                    if !self.reply(frame).await {
                        return false;
                    }
                }
                Dispatch::Broadcast(frame) => {
                    self.hub.broadcast(&frame).await;
                }
                Dispatch::Publish {
                    conversation_id,
                    frame,
                } => {
                    self.hub.publish(conversation_id, &frame).await;
                }
                Dispatch::Join {
                    user_ids,
                    conversation_id,
                } => {
                    for user_id in user_ids {
                        self.hub.join_user(user_id, conversation_id).await;
                    }
                }
                Dispatch::Leave {
                    user_id,
                    conversation_id,
                } => {
                    self.hub.leave_user(user_id, conversation_id).await;
                }
            }
        }
        true
    }

    /// Queue a frame for this connection; a full queue ends it
    async fn reply(&self, frame: Frame) -> bool {
        match self.outbox.push(frame) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(connection_id = %self.id, error = %e, "Cannot queue reply, dropping connection");
                self.outbox.close();
                self.hub.unregister(self.id).await;
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::ChatHandler;
    use crate::governor::GovernorConfig;
    use crate::store::MemoryStore;
    use crate::websocket::HubConfig;
    use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
    use serde_json::{json, Value};
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    struct Fixture {
        hub: Arc<Hub>,
        governor: Arc<RateGovernor>,
        handler: Arc<dyn MessageHandler>,
    }

    impl Fixture {
        fn new(auth_attempts_per_minute: usize) -> Self {
            Self {
                hub: Arc::new(Hub::default()),
                governor: Arc::new(RateGovernor::new(GovernorConfig {
                    auth_attempts_per_minute,
                    ..Default::default()
                })),
                handler: Arc::new(ChatHandler::new(Arc::new(MemoryStore::new()))),
            }
        }

        fn with_queue_capacity(queue_capacity: usize) -> Self {
            Self {
                hub: Arc::new(Hub::new(HubConfig {
                    queue_capacity,
                    ..Default::default()
                })),
                ..Self::new(5)
            }
        }

        /// Admit and run an actor whose transport never accepts a write
        fn connect_stalled(&self, address: &str) -> StalledClient {
            let guard = self.governor.try_admit(address).expect("address over its ceiling");
            let actor = ConnectionActor::new(
                Arc::clone(&self.hub),
                Arc::clone(&self.governor),
                Arc::clone(&self.handler),
                address,
            );
            let id = actor.id();
            let (tx, inbound) = unbounded::<Result<Message, io::Error>>();
            let task = tokio::spawn(async move {
                actor.run(inbound, StalledSink).await;
                drop(guard);
            });
            StalledClient { id, tx, task }
        }

        async fn wait_registered(&self, id: ActorId) {
            timeout(Duration::from_secs(1), async {
                while !self.hub.is_registered(id).await {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .expect("actor never registered");
        }

        fn connect(&self, address: &str) -> TestClient {
            let actor = ConnectionActor::new(
                Arc::clone(&self.hub),
                Arc::clone(&self.governor),
                Arc::clone(&self.handler),
                address,
            );
            let id = actor.id();
            let (tx, inbound) = unbounded::<Result<Message, io::Error>>();
            let (outbound, rx) = unbounded::<Message>();
            let task = tokio::spawn(actor.run(inbound, outbound));
            TestClient { id, tx, rx, task }
        }
    }

    struct TestClient {
        id: ActorId,
        tx: UnboundedSender<Result<Message, io::Error>>,
        rx: UnboundedReceiver<Message>,
        task: JoinHandle<()>,
    }

    /// Transport whose writes never complete
    struct StalledSink;

    impl Sink<Message> for StalledSink {
        type Error = io::Error;

        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
            Poll::Pending
        }

        fn start_send(self: Pin<&mut Self>, _item: Message) -> Result<(), io::Error> {
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
            Poll::Pending
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
            Poll::Pending
        }
    }

    struct StalledClient {
        id: ActorId,
        tx: UnboundedSender<Result<Message, io::Error>>,
        task: JoinHandle<()>,
    }

    impl StalledClient {
        fn send(&self, value: Value) {
            self.tx
                .unbounded_send(Ok(Message::Text(value.to_string())))
                .unwrap();
        }

        fn auth(&self, username: &str) {
            self.send(json!({
                "type": "auth",
                "payload": { "username": username, "password": "secret", "action": "register" }
            }));
        }

        /// Wait until the actor has let go of its inbound stream
        async fn transport_dropped(&self) {
            timeout(Duration::from_secs(1), async {
                while !self.tx.is_closed() {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .expect("transport still held");
        }
    }

    impl TestClient {
        fn send(&self, value: Value) {
            self.tx
                .unbounded_send(Ok(Message::Text(value.to_string())))
                .unwrap();
        }

        fn send_raw(&self, message: Message) {
            self.tx.unbounded_send(Ok(message)).unwrap();
        }

        async fn next(&mut self) -> Value {
            let message = timeout(Duration::from_secs(1), self.rx.next())
                .await
                .expect("timed out waiting for frame")
                .expect("connection closed");
            match message {
                Message::Text(text) => serde_json::from_str(&text).unwrap(),
                other => panic!("unexpected message: {:?}", other),
            }
        }

        async fn is_quiet(&mut self) -> bool {
            timeout(Duration::from_millis(50), self.rx.next()).await.is_err()
        }

        async fn auth(&mut self, username: &str, action: &str) -> Value {
            self.send(json!({
                "type": "auth",
                "payload": { "username": username, "password": "secret", "action": action }
            }));
            self.next().await
        }
    }

    #[tokio::test]
    async fn test_auth_registers_with_hub() {
        let fixture = Fixture::new(5);
        let mut client = fixture.connect("10.0.0.1");

        let reply = client.auth("ana", "register").await;
        assert_eq!(reply["type"], "auth_success");
        assert_eq!(reply["username"], "ana");
        assert_eq!(reply["conversations"], json!([]));
        assert!(fixture.hub.is_registered(client.id).await);
    }

    #[tokio::test]
    async fn test_unauthenticated_messages_are_ignored() {
        let fixture = Fixture::new(5);
        let mut client = fixture.connect("10.0.0.1");

        client.send(json!({ "type": "get_conversations" }));
        client.send(json!({ "type": "check_user", "payload": { "username": "ana" } }));
        assert!(client.is_quiet().await);
        assert_eq!(fixture.hub.connection_count().await, 0);

        let reply = client.auth("ana", "register").await;
        assert_eq!(reply["type"], "auth_success");
    }

    #[tokio::test]
    async fn test_malformed_envelope_keeps_connection() {
        let fixture = Fixture::new(5);
        let mut client = fixture.connect("10.0.0.1");

        client.send_raw(Message::Text("{not json".to_string()));
        client.send(json!({ "payload": {} }));
        assert!(client.is_quiet().await);

        let reply = client.auth("ana", "register").await;
        assert_eq!(reply["type"], "auth_success");
    }

    #[tokio::test]
    async fn test_auth_failures_then_rate_limit() {
        let fixture = Fixture::new(2);
        let mut client = fixture.connect("10.0.0.9");

        let reply = client.auth("ghost", "login").await;
        assert_eq!(reply["type"], "auth_error");
        assert_eq!(reply["message"], "invalid username or password");

        let reply = client.auth("ghost", "login").await;
        assert_eq!(reply["type"], "auth_error");

        let reply = client.auth("ghost", "register").await;
        assert_eq!(reply["type"], "auth_error");
        assert_eq!(reply["message"], RATE_LIMITED);

        // Rejected attempts leave the connection open and unregistered
        assert!(!client.task.is_finished());
        assert_eq!(fixture.hub.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_second_auth_is_an_error() {
        let fixture = Fixture::new(5);
        let mut client = fixture.connect("10.0.0.1");
        client.auth("ana", "register").await;

        let reply = client.auth("ana", "login").await;
        assert_eq!(reply["type"], "error");
        assert_eq!(fixture.hub.connection_count().await, 1);
    }

    #[tokio::test]
    async fn test_binary_frame_gets_error() {
        let fixture = Fixture::new(5);
        let mut client = fixture.connect("10.0.0.1");

        client.send_raw(Message::Binary(vec![1, 2, 3]));
        let reply = client.next().await;
        assert_eq!(reply["type"], "error");
    }

    #[tokio::test]
    async fn test_close_unregisters() {
        let fixture = Fixture::new(5);
        let mut client = fixture.connect("10.0.0.1");
        client.auth("ana", "register").await;
        assert_eq!(fixture.hub.connection_count().await, 1);

        client.send_raw(Message::Close(None));
        timeout(Duration::from_secs(1), &mut client.task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fixture.hub.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_stream_end_unregisters() {
        let fixture = Fixture::new(5);
        let mut client = fixture.connect("10.0.0.1");
        client.auth("ana", "register").await;

        client.tx.close_channel();
        timeout(Duration::from_secs(1), &mut client.task)
            .await
            .unwrap()
            .unwrap();
        assert!(!fixture.hub.is_registered(client.id).await);
    }

    #[tokio::test]
    async fn test_message_reaches_conversation_members() {
        let fixture = Fixture::new(5);
        let mut ana = fixture.connect("10.0.0.1");
        let mut bob = fixture.connect("10.0.0.2");
        let mut eve = fixture.connect("10.0.0.3");
        ana.auth("ana", "register").await;
        bob.auth("bob", "register").await;
        eve.auth("eve", "register").await;

        ana.send(json!({
            "type": "create_conversation",
            "payload": { "usernames": ["bob"] }
        }));
        let created = ana.next().await;
        assert_eq!(created["type"], "conversation_created");
        let conversation_id = created["conversation"]["id"].as_i64().unwrap();

        ana.send(json!({
            "type": "send_message",
            "payload": { "conversation_id": conversation_id, "content": "hi bob" }
        }));

        let at_bob = bob.next().await;
        assert_eq!(at_bob["type"], "new_message");
        assert_eq!(at_bob["message"]["content"], "hi bob");

        let at_ana = ana.next().await;
        assert_eq!(at_ana, at_bob);

        assert!(eve.is_quiet().await);
    }

    #[tokio::test]
    async fn test_handler_error_is_reported() {
        let fixture = Fixture::new(5);
        let mut client = fixture.connect("10.0.0.1");
        client.auth("ana", "register").await;

        client.send(json!({
            "type": "send_message",
            "payload": { "conversation_id": 404, "content": "anyone?" }
        }));
        let reply = client.next().await;
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["message"], "conversation not found");
    }

    #[tokio::test]
    async fn test_slow_consumer_is_dropped_and_releases_its_slot() {
        let fixture = Fixture::with_queue_capacity(2);
        let client = fixture.connect_stalled("10.0.0.7");
        assert_eq!(fixture.governor.open_connections("10.0.0.7"), 1);

        client.auth("ana");
        fixture.wait_registered(client.id).await;

        for n in 0..4 {
            fixture
                .hub
                .broadcast(&Frame::from_text(format!(r#"{{"type":"tick","n":{}}}"#, n)))
                .await;
        }
        assert!(!fixture.hub.is_registered(client.id).await);

        client.transport_dropped().await;
        timeout(Duration::from_secs(2), client.task)
            .await
            .expect("actor kept running after eviction")
            .unwrap();
        assert_eq!(fixture.governor.open_connections("10.0.0.7"), 0);
    }

    #[tokio::test]
    async fn test_reply_to_full_queue_ends_connection() {
        let fixture = Fixture::with_queue_capacity(1);
        let client = fixture.connect_stalled("10.0.0.8");

        client.auth("ana");
        fixture.wait_registered(client.id).await;

        for _ in 0..3 {
            client.send(json!({ "type": "check_user", "payload": { "username": "ana" } }));
        }

        client.transport_dropped().await;
        timeout(Duration::from_secs(2), client.task)
            .await
            .expect("actor kept running with a full queue")
            .unwrap();
        assert!(!fixture.hub.is_registered(client.id).await);
        assert_eq!(fixture.governor.open_connections("10.0.0.8"), 0);
    }
}
