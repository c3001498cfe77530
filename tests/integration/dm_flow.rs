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

//! End-to-end direct messaging over a real relay server.
//!
//! Covers the two-user exchange, offline recipients recovering through
//! history, token reconnects listing existing conversations, and the
//! per-conversation history cap.

use std::time::Duration;

use chatline_proto::codec;
use chatline_proto::event::ServerEvent;
use chatline_relay::conversation::deterministic_id;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio_tungstenite::tungstenite;

type Ws =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// A connected, authenticated test client.
struct Client {
    ws: Ws,
    user_id: String,
    token: String,
}

/// Start the relay server in-process and return its address.
async fn start_relay() -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
    chatline_relay::relay::start_server("127.0.0.1:0")
        .await
        .expect("failed to start relay server")
}

async fn connect(addr: std::net::SocketAddr) -> Ws {
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .unwrap();
    assert!(matches!(recv(&mut ws).await, ServerEvent::Welcome { .. }));
    ws
}

async fn send(ws: &mut Ws, value: serde_json::Value) {
    ws.send(tungstenite::Message::Text(value.to_string().into()))
        .await
        .unwrap();
}

/// Receive the next event, skipping control frames.
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

/// Receive events until one matches, returning it.
async fn recv_until(ws: &mut Ws, pred: impl Fn(&ServerEvent) -> bool) -> ServerEvent {
    loop {
        let event = recv(ws).await;
        if pred(&event) {
            return event;
        }
    }
}

/// Connect and authenticate, returning the client and the chats listed in auth-ok.
async fn login(
    addr: std::net::SocketAddr,
    name: &str,
    token: Option<&str>,
) -> (Client, Vec<chatline_proto::event::ChatSummary>) {
    let mut ws = connect(addr).await;
    send(
        &mut ws,
        json!({"action": "auth", "data": {"username": name, "avatar_url": "", "token": token}}),
    )
    .await;
    let ServerEvent::AuthOk {
        token,
        user_id,
        chats,
    } = recv(&mut ws).await
    else {
        panic!("expected auth-ok for {name}");
    };
    assert!(matches!(recv(&mut ws).await, ServerEvent::UsersList { .. }));
    (Client { ws, user_id, token }, chats)
}

async fn send_message(client: &mut Client, chat_id: &str, content: &str) {
    send(
        &mut client.ws,
        json!({"action": "send-message", "data": {"chatId": chat_id, "content": content}}),
    )
    .await;
}

async fn history(client: &mut Client, chat_id: &str) -> Vec<chatline_proto::event::MessageView> {
    send(
        &mut client.ws,
        json!({"action": "get-messages", "data": {"chatId": chat_id}}),
    )
    .await;
    let ServerEvent::ChatMessages { messages, .. } = recv_until(&mut client.ws, |e| {
        matches!(e, ServerEvent::ChatMessages { .. } | ServerEvent::Error { .. })
    })
    .await
    else {
        panic!("expected chat-messages");
    };
    messages
}

#[tokio::test]
async fn alice_and_bob_exchange_messages() {
    let (addr, _handle) = start_relay().await;
    let (mut alice, _) = login(addr, "alice", None).await;
    let (mut bob, _) = login(addr, "bob", None).await;
    let chat = deterministic_id(&alice.user_id, &bob.user_id);

    send_message(&mut alice, &chat, "hi bob").await;
    let event = recv_until(&mut bob.ws, |e| {
        matches!(e, ServerEvent::ReceiveMessage { .. })
    })
    .await;
    let ServerEvent::ReceiveMessage {
        sender_id,
        chat_id,
        message,
        timestamp,
        ..
    } = event
    else {
        unreachable!();
    };
    assert_eq!(sender_id, alice.user_id);
    assert_eq!(chat_id, chat);
    assert_eq!(message, "hi bob");
    assert!(timestamp > 0);

    send_message(&mut bob, &chat, "hi alice").await;
    let event = recv_until(&mut alice.ws, |e| {
        matches!(e, ServerEvent::ReceiveMessage { .. })
    })
    .await;
    assert!(matches!(
        event,
        ServerEvent::ReceiveMessage { ref message, .. } if message == "hi alice"
    ));

    let contents: Vec<_> = history(&mut alice, &chat)
        .await
        .into_iter()
        .map(|m| m.content)
        .collect();
    assert_eq!(contents, vec!["hi bob", "hi alice"]);
}

#[tokio::test]
async fn offline_recipient_recovers_through_history() {
    let (addr, _handle) = start_relay().await;
    let (bob, _) = login(addr, "bob", None).await;
    let (bob_id, bob_token) = (bob.user_id.clone(), bob.token.clone());
    drop(bob);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (mut alice, _) = login(addr, "alice", None).await;
    let chat = deterministic_id(&alice.user_id, &bob_id);
    send_message(&mut alice, &chat, "you were away").await;
    // A ping round-trip orders the send before the reconnect below.
    send(&mut alice.ws, json!({"action": "ping", "data": {"timestamp": 1}})).await;
    recv_until(&mut alice.ws, |e| matches!(e, ServerEvent::Pong { .. })).await;

    let (mut bob, chats) = login(addr, "", Some(&bob_token)).await;
    assert_eq!(bob.user_id, bob_id);
    assert_eq!(bob.token, bob_token);
    assert_eq!(chats.len(), 1);
    assert_eq!(chats[0].id, chat);
    assert_eq!(chats[0].last_message, "you were away");

    let messages = history(&mut bob, &chat).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].sender_id, alice.user_id);
    assert_eq!(messages[0].kind, "text");
}

#[tokio::test]
async fn history_keeps_newest_hundred() {
    let (addr, _handle) = start_relay().await;
    let (mut alice, _) = login(addr, "alice", None).await;
    let chat = deterministic_id(&alice.user_id, "user_nobody");

    for i in 1..=105 {
        send_message(&mut alice, &chat, &format!("m{i}")).await;
    }
    let messages = history(&mut alice, &chat).await;
    assert_eq!(messages.len(), 100);
    assert_eq!(messages.first().unwrap().content, "m6");
    assert_eq!(messages.last().unwrap().content, "m105");
}

#[tokio::test]
async fn third_party_cannot_read_or_post() {
    let (addr, _handle) = start_relay().await;
    let (mut alice, _) = login(addr, "alice", None).await;
    let (bob, _) = login(addr, "bob", None).await;
    let (mut carol, _) = login(addr, "carol", None).await;
    let chat = deterministic_id(&alice.user_id, &bob.user_id);
    send_message(&mut alice, &chat, "private").await;

    send_message(&mut carol, &chat, "let me in").await;
    let err = recv_until(&mut carol.ws, |e| matches!(e, ServerEvent::Error { .. })).await;
    assert_eq!(err, ServerEvent::error("Access denied to this chat"));

    send(
        &mut carol.ws,
        json!({"action": "get-messages", "data": {"chatId": chat}}),
    )
    .await;
    let err = recv_until(&mut carol.ws, |e| matches!(e, ServerEvent::Error { .. })).await;
    assert_eq!(err, ServerEvent::error("Access denied to this chat"));

    let contents: Vec<_> = history(&mut alice, &chat)
        .await
        .into_iter()
        .map(|m| m.content)
        .collect();
    assert_eq!(contents, vec!["private"]);
}
