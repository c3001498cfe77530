//! Relay server core: shared state, WebSocket handler, and server startup.
//!
//! Each WebSocket connection is attached to the [`ConnectionRegistry`], gets
//! a writer task fed by an unbounded channel, and is driven by a
//! [`Session`] until the transport closes. The connection loop also runs the
//! server-side ping/pong heartbeat.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

use crate::conversation::ConversationStore;
use crate::heartbeat::{self, Heartbeat, HeartbeatAction};
use crate::identity::{self, IdentityService};
use crate::registry::ConnectionRegistry;
use crate::router::{self, MessageRouter};
use crate::session::Session;
use crate::store::{MemoryStore, Store};

/// Default maximum allowed frame size in bytes (64 KB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 64 * 1024;

/// Runtime knobs shared by every connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelaySettings {
    /// Largest accepted WebSocket message, in bytes.
    pub max_payload_size: usize,
    /// Sliding lifetime of auth tokens.
    pub token_ttl: Duration,
    /// Messages retained per conversation.
    pub history_limit: usize,
    /// Pause between server pings.
    pub ping_interval: Duration,
    /// Time allowed for a pong.
    pub pong_timeout: Duration,
    /// Close connections that miss a pong instead of only logging it.
    pub reap_unresponsive: bool,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            token_ttl: identity::DEFAULT_TOKEN_TTL,
            history_limit: router::DEFAULT_HISTORY_LIMIT,
            ping_interval: heartbeat::DEFAULT_PING_INTERVAL,
            pong_timeout: heartbeat::DEFAULT_PONG_TIMEOUT,
            reap_unresponsive: false,
        }
    }
}

/// Shared relay state: the connection registry and the services behind it.
pub struct RelayState<S = MemoryStore> {
    /// Live connections and their identities.
    pub registry: ConnectionRegistry<S>,
    /// Token issuing and presence lookups.
    pub identities: IdentityService<S>,
    /// Conversation records.
    pub conversations: ConversationStore<S>,
    /// Message persistence and recipient resolution.
    pub router: MessageRouter<S>,
    settings: RelaySettings,
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayState {
    /// Creates a relay backed by a fresh [`MemoryStore`] with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::with_settings(Arc::new(MemoryStore::new()), RelaySettings::default())
    }
}

impl<S: Store> RelayState<S> {
    /// Creates a relay over `store` with the given settings.
    #[must_use]
    pub fn with_settings(store: Arc<S>, settings: RelaySettings) -> Self {
        Self {
            registry: ConnectionRegistry::new(Arc::clone(&store)),
            identities: IdentityService::new(Arc::clone(&store), settings.token_ttl),
            conversations: ConversationStore::new(Arc::clone(&store)),
            router: MessageRouter::new(store, settings.history_limit),
            settings,
        }
    }

    /// Settings this relay was built with.
    #[must_use]
    pub const fn settings(&self) -> &RelaySettings {
        &self.settings
    }
}

/// Handles an upgraded WebSocket connection until it closes.
///
/// The connection lifecycle:
/// 1. Attach to the registry and send `welcome`.
/// 2. Feed text frames to the [`Session`], answer binary frames with an error.
/// 3. Ping on every heartbeat interval and watch for the pong.
/// 4. On close, error, writer failure, or (if enabled) a missed pong,
///    close the session, which unregisters and detaches the connection.
pub async fn handle_socket<S: Store>(socket: WebSocket, state: Arc<RelayState<S>>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let handle = state.registry.attach(tx).await;

    // Writer task: forwards queued frames to the socket.
    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if ws_sender.send(msg).await.is_err() {
                tracing::warn!(connection = %handle, "WebSocket write failed");
                break;
            }
            if closing {
                break;
            }
        }
    });

    let mut session = Session::new(handle, Arc::clone(&state));
    session.open().await;

    let settings = *state.settings();
    let mut heartbeat = Heartbeat::new(
        settings.ping_interval,
        settings.pong_timeout,
        Instant::now(),
    );
    let mut ticker = tokio::time::interval(heartbeat.poll_period());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            frame = ws_receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => session.handle_text(text.as_str()).await,
                Some(Ok(Message::Binary(_))) => session.reject_binary().await,
                Some(Ok(Message::Pong(_))) => heartbeat.on_pong(),
                Some(Ok(Message::Ping(_))) => {}
                Some(Ok(Message::Close(_))) | None => {
                    tracing::info!(connection = %handle, "peer closed the connection");
                    break;
                }
                Some(Err(e)) => {
                    tracing::warn!(connection = %handle, error = %e, "WebSocket read failed");
                    break;
                }
            },
            _ = ticker.tick() => match heartbeat.poll(Instant::now()) {
                HeartbeatAction::SendPing => {
                    if state
                        .registry
                        .send_frame(handle, Message::Ping(Bytes::new()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                HeartbeatAction::TimedOut => {
                    tracing::warn!(
                        connection = %handle,
                        timeout_secs = settings.pong_timeout.as_secs(),
                        "no pong received, connection looks dead"
                    );
                    if settings.reap_unresponsive {
                        break;
                    }
                }
                HeartbeatAction::Wait => {}
            },
            _ = &mut write_task => {
                tracing::debug!(connection = %handle, "writer finished");
                break;
            }
        }
    }

    session.close().await;
    write_task.abort();
}

/// Starts the relay server on the given address and returns the bound address
/// and a join handle.
///
/// This is the primary entry point used by both `main.rs` and test code.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    start_server_with_state(addr, Arc::new(RelayState::new())).await
}

/// Starts the relay server with a pre-configured [`RelayState`].
///
/// Use [`RelayState::with_settings`] to build a state from the resolved
/// [`crate::config::RelayConfig`].
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state<S: Store>(
    addr: &str,
    state: Arc<RelayState<S>>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let app = axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler::<S>))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "relay server error");
        }
    });

    Ok((bound_addr, handle))
}

/// Starts the relay server in-process for testing.
///
/// Binds to `127.0.0.1:0` (OS-assigned port) and returns the bound address
/// and a [`tokio::task::JoinHandle`] for cleanup.
#[cfg(test)]
pub async fn start_test_server() -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
    start_server("127.0.0.1:0")
        .await
        .expect("failed to start test server")
}

/// axum handler that upgrades an HTTP request to a WebSocket connection.
async fn ws_handler<S: Store>(
    ws: axum::extract::ws::WebSocketUpgrade,
    axum::extract::State(state): axum::extract::State<Arc<RelayState<S>>>,
) -> impl axum::response::IntoResponse {
    let max = state.settings().max_payload_size;
    ws.max_message_size(max)
        .on_upgrade(move |socket| handle_socket(socket, state))
}
