//! Relay-to-client events.
//!
//! Every frame the relay pushes is a JSON object tagged by `type`. The public
//! view types embedded in events ([`UserProfile`], [`ChatSummary`],
//! [`MessageView`]) never carry bearer tokens.

use serde::{Deserialize, Serialize};

/// Public fields of an identity, safe to show to other users.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserProfile {
    /// Opaque identity id.
    pub id: String,
    /// Display name.
    pub username: String,
    /// Avatar reference.
    pub avatar_url: String,
}

/// Summary of a two-party conversation as listed in `auth-ok`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSummary {
    /// Deterministic conversation id.
    pub id: String,
    /// Conversation kind; always `dm` for now.
    #[serde(rename = "type")]
    pub kind: String,
    /// Lexicographically smaller participant.
    pub user_a: String,
    /// Lexicographically larger participant.
    pub user_b: String,
    /// Creation time, unix seconds.
    pub created_at: i64,
    /// Text of the most recent message.
    pub last_message: String,
    /// Time of the most recent message, unix seconds.
    pub last_timestamp: i64,
}

/// A persisted message as returned by `chat-messages`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageView {
    /// Opaque message id.
    pub id: String,
    /// Identity that sent the message.
    pub sender_id: String,
    /// Conversation the message belongs to.
    pub chat_id: String,
    /// Message body.
    pub content: String,
    /// Message kind (`text`, `image`, `file`, `audio`).
    #[serde(rename = "type")]
    pub kind: String,
    /// Send time, unix seconds.
    pub timestamp: i64,
}

/// Events pushed from the relay to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// Sent once when the transport connection opens.
    Welcome {
        /// Greeting text.
        message: String,
    },
    /// Authentication succeeded.
    AuthOk {
        /// Bearer token to present on reconnect.
        token: String,
        /// Identity id bound to this connection.
        user_id: String,
        /// The identity's existing conversations.
        chats: Vec<ChatSummary>,
    },
    /// Authentication failed; the connection stays unauthenticated.
    AuthError {
        /// Human-readable reason.
        message: String,
    },
    /// Identities currently online.
    UsersList {
        /// Online users in id order.
        users: Vec<UserProfile>,
    },
    /// Another identity came online.
    UserJoined {
        /// The identity that joined.
        user: UserProfile,
    },
    /// Another identity went offline.
    UserLeft {
        /// The identity that left.
        user: UserProfile,
    },
    /// A direct message addressed to this connection's identity.
    #[serde(rename_all = "camelCase")]
    ReceiveMessage {
        /// Identity that sent the message.
        sender_id: String,
        /// Conversation the message was filed under.
        chat_id: String,
        /// Id of the persisted message.
        message_id: String,
        /// Message body.
        message: String,
        /// Send time, unix seconds.
        timestamp: i64,
    },
    /// History of one conversation, oldest first.
    #[serde(rename_all = "camelCase")]
    ChatMessages {
        /// Conversation the history belongs to.
        chat_id: String,
        /// Messages in arrival order.
        messages: Vec<MessageView>,
    },
    /// Answer to a `ping` request.
    Pong {
        /// The timestamp carried by the ping, or the relay's clock.
        timestamp: i64,
    },
    /// A request was rejected.
    Error {
        /// Human-readable reason.
        message: String,
    },
}

impl ServerEvent {
    /// Shorthand for an [`ServerEvent::Error`] event.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Returns the wire `type` tag, useful for log fields.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Welcome { .. } => "welcome",
            Self::AuthOk { .. } => "auth-ok",
            Self::AuthError { .. } => "auth-error",
            Self::UsersList { .. } => "users-list",
            Self::UserJoined { .. } => "user-joined",
            Self::UserLeft { .. } => "user-left",
            Self::ReceiveMessage { .. } => "receive-message",
            Self::ChatMessages { .. } => "chat-messages",
            Self::Pong { .. } => "pong",
            Self::Error { .. } => "error",
        }
    }
}
