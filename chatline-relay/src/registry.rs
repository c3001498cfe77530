//! Live connection registry and presence broadcast.
//!
//! The registry is the single owner of the connection map. Every connection
//! gets an unbounded channel feeding its WebSocket writer task; pushes go
//! through that channel and never wait on the transport. Identity binding is
//! last-register-wins: binding an identity that is already bound elsewhere
//! demotes the older connection to unauthenticated.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::ws::Message;
use chatline_proto::codec;
use chatline_proto::event::{ServerEvent, UserProfile};
use tokio::sync::{Mutex, RwLock, mpsc};

use crate::error::ChatError;
use crate::keys;
use crate::store::Store;
use crate::unix_now;

/// Pushed to a connection whose identity was bound by a newer connection.
pub const SUPERSEDED_MESSAGE: &str = "Session moved to another connection";

/// Opaque id of one live transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionHandle(u64);

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

struct Connection {
    sender: mpsc::UnboundedSender<Message>,
    identity: Option<UserProfile>,
}

/// Maps connections to identities and pushes events to them.
pub struct ConnectionRegistry<S> {
    connections: RwLock<HashMap<ConnectionHandle, Connection>>,
    /// Serializes register/unregister, including their store writes.
    presence: Mutex<()>,
    next_handle: AtomicU64,
    store: Arc<S>,
}

impl<S: Store> ConnectionRegistry<S> {
    /// Creates an empty registry writing presence through `store`.
    #[must_use]
    pub fn new(store: Arc<S>) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            presence: Mutex::new(()),
            next_handle: AtomicU64::new(1),
            store,
        }
    }

    /// Adds a new, unauthenticated connection.
    pub async fn attach(&self, sender: mpsc::UnboundedSender<Message>) -> ConnectionHandle {
        let handle = ConnectionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.connections.write().await.insert(
            handle,
            Connection {
                sender,
                identity: None,
            },
        );
        tracing::debug!(connection = %handle, "connection attached");
        handle
    }

    /// Removes a connection. Callers unregister it first.
    ///
    /// Returns whether the connection was attached.
    pub async fn detach(&self, handle: ConnectionHandle) -> bool {
        let removed = self.connections.write().await.remove(&handle).is_some();
        if removed {
            tracing::debug!(connection = %handle, "connection detached");
        }
        removed
    }

    /// Binds `profile` to a connection and announces it.
    ///
    /// Presence is written first; if that fails nothing is bound. Another
    /// connection already bound to the same identity is unbound and told so;
    /// its handle is returned. If this connection was bound to a different
    /// identity, that identity leaves.
    ///
    /// Store writes happen outside the connection map lock, so pushes to
    /// other connections never wait on storage.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Transport`] if the connection is not attached, or
    /// [`ChatError::Store`] if presence cannot be written.
    pub async fn register(
        &self,
        handle: ConnectionHandle,
        profile: UserProfile,
    ) -> Result<Option<ConnectionHandle>, ChatError> {
        let _presence = self.presence.lock().await;
        if !self.connections.read().await.contains_key(&handle) {
            return Err(ChatError::Transport(handle.to_string()));
        }

        self.mark_online(&profile).await?;

        let mut connections = self.connections.write().await;
        if !connections.contains_key(&handle) {
            // Detached while presence was being written.
            let bound_elsewhere = connections
                .values()
                .any(|c| c.identity.as_ref().is_some_and(|p| p.id == profile.id));
            drop(connections);
            if !bound_elsewhere {
                self.mark_offline(&profile).await;
            }
            return Err(ChatError::Transport(handle.to_string()));
        }
        let previous = connections
            .get_mut(&handle)
            .and_then(|conn| conn.identity.replace(profile.clone()))
            .filter(|p| p.id != profile.id);

        let superseded = connections
            .iter()
            .find(|(other, conn)| {
                **other != handle && conn.identity.as_ref().is_some_and(|p| p.id == profile.id)
            })
            .map(|(other, _)| *other);
        if let Some(old) = superseded
            && let Some(conn) = connections.get_mut(&old)
        {
            conn.identity = None;
            push(old, &conn.sender, &ServerEvent::error(SUPERSEDED_MESSAGE));
            tracing::info!(
                connection = %old,
                identity = %profile.id,
                replaced_by = %handle,
                "connection superseded"
            );
        }

        if let Some(prev) = &previous {
            broadcast(
                &connections,
                &prev.id,
                &ServerEvent::UserLeft { user: prev.clone() },
            );
        }
        tracing::info!(connection = %handle, identity = %profile.id, "identity registered");
        broadcast(
            &connections,
            &profile.id,
            &ServerEvent::UserJoined {
                user: profile.clone(),
            },
        );
        drop(connections);

        if let Some(prev) = previous {
            self.mark_offline(&prev).await;
        }
        Ok(superseded)
    }

    /// Unbinds a connection's identity and announces that it left.
    ///
    /// Returns the freed identity, or `None` if the connection was never
    /// bound (or was superseded). Presence write failures are logged.
    pub async fn unregister(&self, handle: ConnectionHandle) -> Option<UserProfile> {
        let _presence = self.presence.lock().await;
        let profile = {
            let mut connections = self.connections.write().await;
            let profile = connections.get_mut(&handle)?.identity.take()?;
            tracing::info!(connection = %handle, identity = %profile.id, "identity unregistered");
            broadcast(
                &connections,
                &profile.id,
                &ServerEvent::UserLeft {
                    user: profile.clone(),
                },
            );
            profile
        };

        self.mark_offline(&profile).await;
        Some(profile)
    }

    /// Identity currently bound to a connection.
    pub async fn identity_of(&self, handle: ConnectionHandle) -> Option<UserProfile> {
        self.connections
            .read()
            .await
            .get(&handle)
            .and_then(|c| c.identity.clone())
    }

    /// Pushes `event` to every connection bound to one of `identity_ids`.
    ///
    /// Returns how many connections accepted the push. Offline identities
    /// are skipped.
    pub async fn send_to(&self, identity_ids: &[String], event: &ServerEvent) -> usize {
        let Some(frame) = encode(event) else {
            return 0;
        };
        let connections = self.connections.read().await;
        connections
            .iter()
            .filter(|(_, conn)| {
                conn.identity
                    .as_ref()
                    .is_some_and(|p| identity_ids.contains(&p.id))
            })
            .filter(|(handle, conn)| push_frame(**handle, &conn.sender, frame.clone()))
            .count()
    }

    /// Pushes `event` to every authenticated connection not bound to `identity_id`.
    pub async fn broadcast_except(&self, identity_id: &str, event: &ServerEvent) -> usize {
        broadcast(&*self.connections.read().await, identity_id, event)
    }

    /// Pushes `event` to one connection, authenticated or not.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Transport`] if the connection is gone.
    pub async fn send_to_connection(
        &self,
        handle: ConnectionHandle,
        event: &ServerEvent,
    ) -> Result<(), ChatError> {
        let frame = encode(event).ok_or_else(|| ChatError::Transport(handle.to_string()))?;
        self.send_frame(handle, frame).await
    }

    /// Pushes a raw WebSocket frame to one connection.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Transport`] if the connection is gone.
    pub async fn send_frame(
        &self,
        handle: ConnectionHandle,
        frame: Message,
    ) -> Result<(), ChatError> {
        let connections = self.connections.read().await;
        let conn = connections
            .get(&handle)
            .ok_or_else(|| ChatError::Transport(handle.to_string()))?;
        conn.sender
            .send(frame)
            .map_err(|_| ChatError::Transport(handle.to_string()))
    }

    /// Sends a Close frame to every connection.
    pub async fn close_all(&self) {
        let connections = self.connections.read().await;
        for (handle, conn) in connections.iter() {
            tracing::info!(connection = %handle, "sending close frame");
            let _ = conn.sender.send(Message::Close(None));
        }
    }

    /// Number of attached connections.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Number of distinct identities bound to a connection.
    pub async fn online_count(&self) -> usize {
        self.connections
            .read()
            .await
            .values()
            .filter_map(|c| c.identity.as_ref().map(|p| p.id.as_str()))
            .collect::<BTreeSet<_>>()
            .len()
    }

    async fn mark_online(&self, profile: &UserProfile) -> Result<(), ChatError> {
        self.store
            .set_add(keys::ONLINE_IDENTITIES, &profile.id)
            .await?;
        self.store
            .set(&keys::last_seen(&profile.id), unix_now().to_string())
            .await?;
        self.publish(&ServerEvent::UserJoined {
            user: profile.clone(),
        })
        .await;
        Ok(())
    }

    async fn mark_offline(&self, profile: &UserProfile) {
        if let Err(e) = self
            .store
            .set_remove(keys::ONLINE_IDENTITIES, &profile.id)
            .await
        {
            tracing::error!(identity = %profile.id, error = %e, "failed to clear presence");
        }
        if let Err(e) = self
            .store
            .set(&keys::last_seen(&profile.id), unix_now().to_string())
            .await
        {
            tracing::warn!(identity = %profile.id, error = %e, "failed to record last seen");
        }
        self.publish(&ServerEvent::UserLeft {
            user: profile.clone(),
        })
        .await;
    }

    async fn publish(&self, event: &ServerEvent) {
        let Ok(payload) = codec::encode_event(event) else {
            return;
        };
        if let Err(e) = self.store.publish(keys::PRESENCE_CHANNEL, payload).await {
            tracing::warn!(event = event.kind(), error = %e, "failed to publish presence event");
        }
    }
}

fn encode(event: &ServerEvent) -> Option<Message> {
    match codec::encode_event(event) {
        Ok(text) => Some(Message::Text(text.into())),
        Err(e) => {
            tracing::error!(event = event.kind(), error = %e, "failed to encode event");
            None
        }
    }
}

fn push(handle: ConnectionHandle, sender: &mpsc::UnboundedSender<Message>, event: &ServerEvent) {
    if let Some(frame) = encode(event) {
        push_frame(handle, sender, frame);
    }
}

fn push_frame(
    handle: ConnectionHandle,
    sender: &mpsc::UnboundedSender<Message>,
    frame: Message,
) -> bool {
    let sent = sender.send(frame).is_ok();
    if !sent {
        tracing::warn!(connection = %handle, "push failed, writer is gone");
    }
    sent
}

fn broadcast(
    connections: &HashMap<ConnectionHandle, Connection>,
    except_identity: &str,
    event: &ServerEvent,
) -> usize {
    let Some(frame) = encode(event) else {
        return 0;
    };
    connections
        .iter()
        .filter(|(_, conn)| {
            conn.identity
                .as_ref()
                .is_some_and(|p| p.id != except_identity)
        })
        .filter(|(handle, conn)| push_frame(**handle, &conn.sender, frame.clone()))
        .count()
}
