//! Per-connection protocol state machine.
//!
//! A [`Session`] starts `Connected`, becomes `Authenticated` after a
//! successful `auth`, and ends `Closed` when the transport goes away. Every
//! request gets at most one direct reply on the same connection; failures are
//! turned into `error` or `auth-error` replies and never end the session.

use std::sync::Arc;

use chatline_proto::codec;
use chatline_proto::event::ServerEvent;
use chatline_proto::request::{
    AuthRequest, ClientRequest, GetMessagesRequest, SendMessageRequest,
};

use crate::conversation;
use crate::error::ChatError;
use crate::registry::ConnectionHandle;
use crate::relay::RelayState;
use crate::store::Store;
use crate::unix_now;

/// Greeting pushed when a connection opens.
pub const WELCOME_MESSAGE: &str = "Connected to chat relay";

/// Reply to frames that are not a JSON request envelope.
pub const INVALID_FORMAT_MESSAGE: &str = "Invalid message format";

/// Lifecycle of one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Transport is open, no identity bound.
    Connected,
    /// An identity is bound to this connection.
    Authenticated {
        /// The bound identity.
        identity_id: String,
    },
    /// Transport closed; cleanup done.
    Closed,
}

/// Protocol handler for one connection.
pub struct Session<S: Store> {
    handle: ConnectionHandle,
    state: SessionState,
    relay: Arc<RelayState<S>>,
}

impl<S: Store> Session<S> {
    /// Creates a session for an attached connection.
    #[must_use]
    pub const fn new(handle: ConnectionHandle, relay: Arc<RelayState<S>>) -> Self {
        Self {
            handle,
            state: SessionState::Connected,
            relay,
        }
    }

    /// The connection this session drives.
    #[must_use]
    pub const fn handle(&self) -> ConnectionHandle {
        self.handle
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> &SessionState {
        &self.state
    }

    /// Sends the welcome greeting.
    pub async fn open(&self) {
        tracing::info!(connection = %self.handle, "connection opened");
        self.reply(ServerEvent::Welcome {
            message: WELCOME_MESSAGE.to_string(),
        })
        .await;
    }

    /// Decodes and handles one text frame.
    pub async fn handle_text(&mut self, text: &str) {
        if self.state == SessionState::Closed {
            return;
        }
        match codec::decode_request(text) {
            Ok(request) => self.handle_request(request).await,
            Err(e) => {
                tracing::warn!(connection = %self.handle, error = %e, "undecodable frame");
                self.reply(ServerEvent::error(INVALID_FORMAT_MESSAGE)).await;
            }
        }
    }

    /// Rejects a binary frame; the protocol is text-only.
    pub async fn reject_binary(&self) {
        tracing::warn!(connection = %self.handle, "binary frame rejected");
        self.reply(ServerEvent::error(INVALID_FORMAT_MESSAGE)).await;
    }

    /// Dispatches one decoded request.
    pub async fn handle_request(&mut self, request: ClientRequest) {
        if self.state == SessionState::Closed {
            return;
        }
        tracing::debug!(connection = %self.handle, action = request.action(), "request");

        let result = match request {
            ClientRequest::Ping { timestamp } => {
                self.reply(ServerEvent::Pong {
                    timestamp: timestamp.unwrap_or_else(unix_now),
                })
                .await;
                Ok(())
            }
            ClientRequest::Auth(auth) => {
                self.on_auth(auth).await;
                Ok(())
            }
            ClientRequest::SendMessage(send) => self.on_send_message(send).await,
            ClientRequest::GetMessages(get) => self.on_get_messages(get).await,
            ClientRequest::Unknown { action } => {
                tracing::warn!(connection = %self.handle, action = %action, "unknown action");
                Err(ChatError::Validation(format!("Unknown action: {action}")))
            }
        };

        if let Err(e) = result {
            self.reply_error(&e).await;
        }
    }

    /// Unbinds and detaches the connection. Safe to call more than once.
    pub async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        if let Some(profile) = self.relay.registry.unregister(self.handle).await {
            tracing::info!(
                connection = %self.handle,
                identity = %profile.id,
                "identity went offline"
            );
        }
        self.relay.registry.detach(self.handle).await;
        self.state = SessionState::Closed;
        tracing::info!(connection = %self.handle, "connection closed");
    }

    async fn on_auth(&mut self, request: AuthRequest) {
        if let Err(e) = self.authenticate(&request).await {
            if matches!(e, ChatError::Store(_)) {
                tracing::error!(connection = %self.handle, error = %e, "authentication failed");
            } else {
                tracing::warn!(connection = %self.handle, error = %e, "authentication rejected");
            }
            self.reply(ServerEvent::AuthError {
                message: e.client_message(),
            })
            .await;
        }
    }

    async fn authenticate(&mut self, request: &AuthRequest) -> Result<(), ChatError> {
        let auth = self
            .relay
            .identities
            .authenticate(&request.username, &request.avatar_url, request.token())
            .await?;
        if !auth.created {
            match self.relay.identities.last_seen(auth.identity_id()).await {
                Ok(Some(at)) => tracing::info!(
                    connection = %self.handle,
                    identity = %auth.identity_id(),
                    last_seen = at,
                    "returning identity"
                ),
                Ok(None) => {}
                Err(e) => tracing::warn!(
                    identity = %auth.identity_id(),
                    error = %e,
                    "failed to read last seen"
                ),
            }
        }
        let chats = self
            .relay
            .conversations
            .list_for(auth.identity_id())
            .await?;
        self.relay
            .registry
            .register(self.handle, auth.identity.profile())
            .await?;
        self.state = SessionState::Authenticated {
            identity_id: auth.identity_id().to_string(),
        };

        self.reply(ServerEvent::AuthOk {
            token: auth.token().to_string(),
            user_id: auth.identity_id().to_string(),
            chats: chats.iter().map(conversation::Conversation::summary).collect(),
        })
        .await;

        let users = self
            .relay
            .identities
            .online_identities()
            .await
            .iter()
            .map(crate::identity::Identity::profile)
            .collect();
        self.reply(ServerEvent::UsersList { users }).await;
        Ok(())
    }

    async fn on_send_message(&mut self, request: SendMessageRequest) -> Result<(), ChatError> {
        let sender_id = self.bound_identity().await?;
        let delivery = self
            .relay
            .router
            .send(
                &sender_id,
                &request.chat_id,
                &request.content,
                request.kind.as_deref(),
            )
            .await?;

        let event = ServerEvent::ReceiveMessage {
            sender_id,
            chat_id: delivery.conversation_id.clone(),
            message_id: delivery.message.id.clone(),
            message: delivery.message.content.clone(),
            timestamp: delivery.message.sent_at,
        };
        let delivered = self
            .relay
            .registry
            .send_to(&delivery.recipient_ids, &event)
            .await;
        tracing::debug!(
            connection = %self.handle,
            chat_id = %delivery.conversation_id,
            delivered,
            "message routed"
        );
        Ok(())
    }

    async fn on_get_messages(&mut self, request: GetMessagesRequest) -> Result<(), ChatError> {
        let identity_id = self.bound_identity().await?;
        if request.chat_id.trim().is_empty() {
            return Err(ChatError::Validation("chatId is required".to_string()));
        }
        if !conversation::user_belongs(&request.chat_id, &identity_id) {
            return Err(ChatError::Authorization(
                "Access denied to this chat".to_string(),
            ));
        }

        let router = &self.relay.router;
        let messages = router
            .history(&request.chat_id, router.history_limit())
            .await?;
        self.reply(ServerEvent::ChatMessages {
            chat_id: request.chat_id,
            messages: messages.iter().map(crate::router::Message::view).collect(),
        })
        .await;
        Ok(())
    }

    /// Returns the identity bound to this connection.
    ///
    /// A session whose binding was taken over by a newer connection drops
    /// back to `Connected`.
    async fn bound_identity(&mut self) -> Result<String, ChatError> {
        let SessionState::Authenticated { identity_id } = &self.state else {
            return Err(ChatError::Authentication);
        };
        let expected = identity_id.clone();
        match self.relay.registry.identity_of(self.handle).await {
            Some(profile) if profile.id == expected => Ok(expected),
            _ => {
                tracing::info!(
                    connection = %self.handle,
                    identity = %expected,
                    "binding lost, session demoted"
                );
                self.state = SessionState::Connected;
                Err(ChatError::Authentication)
            }
        }
    }

    async fn reply_error(&self, error: &ChatError) {
        if matches!(error, ChatError::Store(_)) {
            tracing::error!(connection = %self.handle, error = %error, "request failed");
        } else {
            tracing::debug!(connection = %self.handle, error = %error, "request rejected");
        }
        self.reply(ServerEvent::error(error.client_message())).await;
    }

    async fn reply(&self, event: ServerEvent) {
        if let Err(e) = self
            .relay
            .registry
            .send_to_connection(self.handle, &event)
            .await
        {
            tracing::warn!(
                connection = %self.handle,
                event = event.kind(),
                error = %e,
                "reply dropped"
            );
        }
    }
}
