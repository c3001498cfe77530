// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::manual_let_else,
    clippy::future_not_send,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::missing_docs_in_private_items
)]

//! Protocol sequencing over a real relay server: greeting, liveness,
//! authentication gating, malformed input, presence, and what happens when
//! one identity connects twice.

use std::sync::Arc;
use std::time::Duration;

use chatline_proto::codec;
use chatline_proto::event::ServerEvent;
use chatline_relay::conversation::deterministic_id;
use chatline_relay::registry::SUPERSEDED_MESSAGE;
use chatline_relay::relay::{self, RelayState};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio_tungstenite::tungstenite;

type Ws =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn start_relay() -> (
    std::net::SocketAddr,
    Arc<RelayState>,
    tokio::task::JoinHandle<()>,
) {
    let state = Arc::new(RelayState::new());
    let (addr, handle) = relay::start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .expect("failed to start relay server");
    (addr, state, handle)
}

async fn connect(addr: std::net::SocketAddr) -> Ws {
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .unwrap();
    assert_eq!(
        recv(&mut ws).await,
        ServerEvent::Welcome {
            message: "Connected to chat relay".to_string()
        }
    );
    ws
}

async fn send_text(ws: &mut Ws, text: &str) {
    ws.send(tungstenite::Message::Text(text.into())).await.unwrap();
}

async fn send(ws: &mut Ws, value: serde_json::Value) {
    send_text(ws, &value.to_string()).await;
}

async fn recv(ws: &mut Ws) -> ServerEvent {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("recv timed out")
            .unwrap()
            .unwrap();
        if let tungstenite::Message::Text(text) = msg {
            return codec::decode_event(text.as_str()).unwrap();
        }
    }
}

/// Authenticate and return `(user_id, token)`, consuming auth-ok and users-list.
async fn auth(ws: &mut Ws, name: &str, token: Option<&str>) -> (String, String) {
    send(
        ws,
        json!({
            "action": "auth",
            "data": {"username": name, "avatar_url": format!("{name}.png"), "token": token}
        }),
    )
    .await;
    let ServerEvent::AuthOk { token, user_id, .. } = recv(ws).await else {
        panic!("expected auth-ok");
    };
    assert!(matches!(recv(ws).await, ServerEvent::UsersList { .. }));
    (user_id, token)
}

#[tokio::test]
async fn ping_is_answered_before_authentication() {
    let (addr, _state, _handle) = start_relay().await;
    let mut ws = connect(addr).await;

    send(&mut ws, json!({"action": "ping", "data": {"timestamp": 1_700_000_000_000_i64}})).await;
    assert_eq!(
        recv(&mut ws).await,
        ServerEvent::Pong {
            timestamp: 1_700_000_000_000
        }
    );

    send_text(&mut ws, r#"{"action":"ping","timestamp":5}"#).await;
    assert_eq!(recv(&mut ws).await, ServerEvent::Pong { timestamp: 5 });
}

#[tokio::test]
async fn actions_require_authentication() {
    let (addr, _state, _handle) = start_relay().await;
    let mut ws = connect(addr).await;
    let chat = deterministic_id("user_a", "user_b");

    send(
        &mut ws,
        json!({"action": "send-message", "data": {"chatId": chat, "content": "hi"}}),
    )
    .await;
    assert_eq!(recv(&mut ws).await, ServerEvent::error("Not authenticated"));

    send(&mut ws, json!({"action": "get-messages", "data": {"chatId": chat}})).await;
    assert_eq!(recv(&mut ws).await, ServerEvent::error("Not authenticated"));
}

#[tokio::test]
async fn malformed_input_gets_error_and_connection_survives() {
    let (addr, _state, _handle) = start_relay().await;
    let mut ws = connect(addr).await;

    send_text(&mut ws, "{{{ nope").await;
    assert_eq!(
        recv(&mut ws).await,
        ServerEvent::error("Invalid message format")
    );
    send_text(&mut ws, r#"{"data":{"x":1}}"#).await;
    assert_eq!(
        recv(&mut ws).await,
        ServerEvent::error("Invalid message format")
    );
    send(&mut ws, json!({"action": "join-group", "data": {}})).await;
    assert_eq!(
        recv(&mut ws).await,
        ServerEvent::error("Unknown action: join-group")
    );

    send(&mut ws, json!({"action": "ping", "data": {"timestamp": 3}})).await;
    assert_eq!(recv(&mut ws).await, ServerEvent::Pong { timestamp: 3 });
}

#[tokio::test]
async fn auth_failure_leaves_connection_usable() {
    let (addr, _state, _handle) = start_relay().await;
    let mut ws = connect(addr).await;

    send(
        &mut ws,
        json!({"action": "auth", "data": {"username": "", "avatar_url": ""}}),
    )
    .await;
    assert_eq!(
        recv(&mut ws).await,
        ServerEvent::AuthError {
            message: "Username is required".to_string()
        }
    );

    let (user_id, token) = auth(&mut ws, "dora", None).await;
    assert!(user_id.starts_with("user_"));
    assert_eq!(token.len(), 64);
}

#[tokio::test]
async fn presence_is_broadcast_on_join_and_leave() {
    let (addr, state, _handle) = start_relay().await;
    let mut alice = connect(addr).await;
    let (alice_id, _) = auth(&mut alice, "alice", None).await;

    let mut bob = connect(addr).await;
    send(
        &mut bob,
        json!({"action": "auth", "data": {"username": "bob", "avatar_url": "bob.png"}}),
    )
    .await;
    let ServerEvent::AuthOk { user_id: bob_id, .. } = recv(&mut bob).await else {
        panic!("expected auth-ok");
    };
    let ServerEvent::UsersList { users } = recv(&mut bob).await else {
        panic!("expected users-list");
    };
    let mut ids: Vec<_> = users.iter().map(|u| u.id.clone()).collect();
    ids.sort();
    let mut expected = vec![alice_id.clone(), bob_id.clone()];
    expected.sort();
    assert_eq!(ids, expected);

    let ServerEvent::UserJoined { user } = recv(&mut alice).await else {
        panic!("expected user-joined");
    };
    assert_eq!(user.id, bob_id);
    assert_eq!(user.username, "bob");
    assert_eq!(user.avatar_url, "bob.png");

    bob.close(None).await.unwrap();
    let ServerEvent::UserLeft { user } = recv(&mut alice).await else {
        panic!("expected user-left");
    };
    assert_eq!(user.id, bob_id);
    assert_eq!(state.registry.online_count().await, 1);
}

#[tokio::test]
async fn second_connection_takes_over_the_identity() {
    let (addr, state, _handle) = start_relay().await;
    let mut first = connect(addr).await;
    let (alice_id, token) = auth(&mut first, "alice", None).await;

    let mut second = connect(addr).await;
    let (again_id, _) = auth(&mut second, "", Some(&token)).await;
    assert_eq!(again_id, alice_id);
    assert_eq!(recv(&mut first).await, ServerEvent::error(SUPERSEDED_MESSAGE));

    let chat = deterministic_id(&alice_id, "user_zed");
    send(
        &mut first,
        json!({"action": "send-message", "data": {"chatId": chat, "content": "old"}}),
    )
    .await;
    assert_eq!(recv(&mut first).await, ServerEvent::error("Not authenticated"));

    first.close(None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(state.registry.online_count().await, 1);

    send(&mut second, json!({"action": "get-messages", "data": {"chatId": chat}})).await;
    assert!(matches!(
        recv(&mut second).await,
        ServerEvent::ChatMessages { ref messages, .. } if messages.is_empty()
    ));
}
