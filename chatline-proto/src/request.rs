//! Client-to-relay requests.
//!
//! [`ClientRequest`] is the closed set of actions the relay understands.
//! Frames naming any other action decode to [`ClientRequest::Unknown`] so the
//! session can answer with an error rather than silently dropping them.

use serde::{Deserialize, Serialize};

/// Payload of the `auth` action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthRequest {
    /// Display name to register under when no valid token is presented.
    pub username: String,
    /// Avatar reference shown to other users.
    pub avatar_url: String,
    /// Bearer token from a previous `auth-ok`, if the client has one.
    pub token: Option<String>,
}

impl AuthRequest {
    /// Returns the presented token, treating an empty string as absent.
    #[must_use]
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref().filter(|t| !t.is_empty())
    }
}

/// Payload of the `send-message` action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SendMessageRequest {
    /// Target conversation (`chat-{a}-dm-{b}`).
    pub chat_id: String,
    /// Message body.
    pub content: String,
    /// Optional message kind (`text`, `image`, `file`, `audio`).
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

/// Payload of the `get-messages` action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GetMessagesRequest {
    /// Conversation whose history is requested.
    pub chat_id: String,
}

/// A decoded client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientRequest {
    /// Authenticate by token or register a fresh identity.
    Auth(AuthRequest),
    /// Send a direct message.
    SendMessage(SendMessageRequest),
    /// Fetch the capped history of a conversation.
    GetMessages(GetMessagesRequest),
    /// Liveness probe; answered with `pong` regardless of session state.
    Ping {
        /// Client timestamp to echo back.
        timestamp: Option<i64>,
    },
    /// An action the relay does not know.
    Unknown {
        /// The action string as sent by the client.
        action: String,
    },
}

impl ClientRequest {
    /// Returns the wire action name of this request.
    #[must_use]
    pub fn action(&self) -> &str {
        match self {
            Self::Auth(_) => "auth",
            Self::SendMessage(_) => "send-message",
            Self::GetMessages(_) => "get-messages",
            Self::Ping { .. } => "ping",
            Self::Unknown { action } => action,
        }
    }
}
