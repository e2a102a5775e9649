//! End-to-end tests against a relay bound to a real socket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parley::client::{ClientEvent, ConnectionState, Credentials, ReconnectController, ReconnectPolicy, WsConnector};
use parley::config::Config;
use parley::server::{serve_with_shutdown, AppState};
use parley::store::MemoryStore;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

const TIMEOUT: Duration = Duration::from_secs(5);

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Start a relay on a random port and return its WebSocket URL
async fn start_relay(config: Config) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    let state = AppState::with_store(config, Arc::new(MemoryStore::new()));

    tokio::spawn(async move {
        serve_with_shutdown(listener, state, std::future::pending())
            .await
            .unwrap();
    });

    format!("ws://{}/ws", addr)
}

async fn connect(url: &str) -> Ws {
    let (ws, _) = timeout(TIMEOUT, connect_async(url))
        .await
        .expect("connect timed out")
        .expect("connect failed");
    ws
}

async fn send(ws: &mut Ws, kind: &str, payload: Value) {
    let text = json!({ "type": kind, "payload": payload }).to_string();
    ws.send(Message::Text(text)).await.unwrap();
}

/// Next text frame as JSON
async fn next_json(ws: &mut Ws) -> Value {
    loop {
        let message = timeout(TIMEOUT, ws.next())
            .await
            .expect("no frame before timeout")
            .expect("stream ended")
            .expect("read failed");
        if let Message::Text(text) = message {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

/// Assert that nothing arrives for a short while
async fn expect_silence(ws: &mut Ws) {
    match timeout(Duration::from_millis(300), ws.next()).await {
        Err(_) => {}
        Ok(Some(Ok(Message::Text(text)))) => panic!("unexpected frame: {}", text),
        Ok(other) => panic!("unexpected stream event: {:?}", other),
    }
}

async fn auth(ws: &mut Ws, action: &str, username: &str, password: &str) -> Value {
    send(
        ws,
        "auth",
        json!({ "username": username, "password": password, "action": action }),
    )
    .await;
    next_json(ws).await
}

async fn signed_up(url: &str, username: &str) -> Ws {
    let mut ws = connect(url).await;
    let reply = auth(&mut ws, "register", username, "hunter22").await;
    assert_eq!(reply["type"], "auth_success", "{}", reply);
    ws
}

#[tokio::test]
async fn test_register_then_login() {
    let url = start_relay(Config::default()).await;

    let mut first = connect(&url).await;
    let reply = auth(&mut first, "register", "ana", "hunter22").await;
    assert_eq!(reply["type"], "auth_success");
    assert_eq!(reply["username"], "ana");
    assert_eq!(reply["conversations"], json!([]));
    let user_id = reply["user_id"].clone();

    let mut second = connect(&url).await;
    let reply = auth(&mut second, "login", "ana", "wrong").await;
    assert_eq!(reply["type"], "auth_error");
    assert_eq!(reply["message"], "invalid username or password");

    let reply = auth(&mut second, "login", "ana", "hunter22").await;
    assert_eq!(reply["type"], "auth_success");
    assert_eq!(reply["user_id"], user_id);

    let reply = auth(&mut second, "login", "ana", "hunter22").await;
    assert_eq!(reply["type"], "error");
}

#[tokio::test]
async fn test_traffic_before_auth_is_ignored() {
    let url = start_relay(Config::default()).await;

    let mut ws = connect(&url).await;
    send(&mut ws, "check_user", json!({ "username": "ana" })).await;
    send(&mut ws, "get_conversations", json!({})).await;
    expect_silence(&mut ws).await;

    let reply = auth(&mut ws, "register", "ana", "hunter22").await;
    assert_eq!(reply["type"], "auth_success");

    send(&mut ws, "check_user", json!({ "username": "ana" })).await;
    let reply = next_json(&mut ws).await;
    assert_eq!(reply["type"], "user_check_result");
    assert_eq!(reply["exists"], true);
}

#[tokio::test]
async fn test_messages_reach_only_participants() {
    let url = start_relay(Config::default()).await;

    let mut ana = signed_up(&url, "ana").await;
    let mut bob = signed_up(&url, "bob").await;
    let mut cara = signed_up(&url, "cara").await;

    send(
        &mut ana,
        "create_conversation",
        json!({ "usernames": ["bob"] }),
    )
    .await;
    let created = next_json(&mut ana).await;
    assert_eq!(created["type"], "conversation_created");
    let conversation_id = created["conversation"]["id"].clone();

    send(
        &mut ana,
        "send_message",
        json!({ "conversation_id": conversation_id, "content": "hi bob" }),
    )
    .await;

    for ws in [&mut ana, &mut bob] {
        let frame = next_json(ws).await;
        assert_eq!(frame["type"], "new_message");
        assert_eq!(frame["message"]["content"], "hi bob");
        assert_eq!(frame["message"]["sender_username"], "ana");
    }
    expect_silence(&mut cara).await;

    // Outsiders cannot post into the conversation
    send(
        &mut cara,
        "send_message",
        json!({ "conversation_id": conversation_id, "content": "let me in" }),
    )
    .await;
    let reply = next_json(&mut cara).await;
    assert_eq!(reply["type"], "error");
    expect_silence(&mut bob).await;
}

#[tokio::test]
async fn test_history_after_reconnect() {
    let url = start_relay(Config::default()).await;

    let mut ana = signed_up(&url, "ana").await;
    let _bob = signed_up(&url, "bob").await;

    send(&mut ana, "create_conversation", json!({ "usernames": ["bob"] })).await;
    let conversation_id = next_json(&mut ana).await["conversation"]["id"].clone();
    send(
        &mut ana,
        "send_message",
        json!({ "conversation_id": conversation_id, "content": "are you there?" }),
    )
    .await;
    assert_eq!(next_json(&mut ana).await["type"], "new_message");

    let mut bob = connect(&url).await;
    let reply = auth(&mut bob, "login", "bob", "hunter22").await;
    assert_eq!(reply["conversations"][0]["unread_count"], 1);

    send(&mut bob, "get_messages", json!({ "conversation_id": conversation_id })).await;
    let history = next_json(&mut bob).await;
    assert_eq!(history["type"], "messages");
    assert_eq!(history["messages"][0]["content"], "are you there?");

    send(&mut bob, "get_conversations", json!({})).await;
    let listing = next_json(&mut bob).await;
    assert_eq!(listing["conversations"][0]["unread_count"], 0);
}

#[tokio::test]
async fn test_connection_ceiling() {
    let mut config = Config::default();
    config.governor.max_connections_per_ip = 1;
    let url = start_relay(config).await;

    let mut first = connect(&url).await;

    match connect_async(url.as_str()).await {
        Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), 429),
        Err(e) => panic!("unexpected error: {}", e),
        Ok(_) => panic!("second connection should be rejected"),
    }

    let _ = first.close(None).await;
    drop(first);

    // The slot frees up once the server notices the close
    let reopened = timeout(TIMEOUT, async {
        loop {
            if let Ok((ws, _)) = connect_async(url.as_str()).await {
                return ws;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    assert!(reopened.is_ok());
}

#[tokio::test]
async fn test_login_attempts_are_rate_limited() {
    let mut config = Config::default();
    config.governor.auth_attempts_per_minute = 2;
    let url = start_relay(config).await;

    let mut ws = connect(&url).await;
    for _ in 0..2 {
        let reply = auth(&mut ws, "login", "nobody", "nothing").await;
        assert_eq!(reply["type"], "auth_error");
        assert_eq!(reply["message"], "invalid username or password");
    }

    let reply = auth(&mut ws, "register", "ana", "hunter22").await;
    assert_eq!(reply["type"], "auth_error");
    assert_eq!(reply["message"], "Too many login attempts. Please wait a minute.");

    // The limit is per address, not per connection
    let mut other = connect(&url).await;
    let reply = auth(&mut other, "register", "ana", "hunter22").await;
    assert_eq!(reply["type"], "auth_error");
}

#[tokio::test]
async fn test_controller_against_live_relay() {
    let url = start_relay(Config::default()).await;

    let controller = ReconnectController::start(WsConnector::new(url.as_str()), ReconnectPolicy::default());
    let mut state = controller.watch_state();
    timeout(TIMEOUT, state.wait_for(|s| *s == ConnectionState::Connected))
        .await
        .expect("never connected")
        .unwrap();

    controller.login(Credentials::register("dana", "hunter22")).unwrap();

    let success = timeout(TIMEOUT, async {
        loop {
            match controller.recv().await {
                Some(ClientEvent::Frame(frame)) if frame.kind == "auth_success" => return frame,
                Some(_) => continue,
                None => panic!("controller closed"),
            }
        }
    })
    .await
    .expect("no auth_success");
    assert_eq!(success.body["username"], "dana");

    controller.send("check_user", &json!({ "username": "dana" })).unwrap();
    let check = timeout(TIMEOUT, async {
        loop {
            match controller.recv().await {
                Some(ClientEvent::Frame(frame)) => return frame,
                Some(_) => continue,
                None => panic!("controller closed"),
            }
        }
    })
    .await
    .expect("no reply");
    assert_eq!(check.kind, "user_check_result");
    assert_eq!(check.body["exists"], true);

    controller.close();
}
