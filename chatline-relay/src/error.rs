//! Business-rule error taxonomy shared by the relay services.
//!
//! Every failure here is terminal for a single request: the session turns it
//! into exactly one `error` (or `auth-error`) response on the same
//! connection and carries on.

use crate::store::StoreError;

/// Errors returned by identity, conversation, routing, and registry operations.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// Malformed or empty input.
    #[error("{0}")]
    Validation(String),

    /// The action needs a bound identity and the connection has none.
    #[error("Not authenticated")]
    Authentication,

    /// The identity is not a participant of the target conversation.
    #[error("{0}")]
    Authorization(String),

    /// The conversation id does not parse to two participants.
    #[error("Invalid conversation id: {0}")]
    InvalidConversation(String),

    /// A referenced entity does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// A push targeted a connection that is gone.
    #[error("connection {0} is not live")]
    Transport(String),

    /// The storage layer failed.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}

impl ChatError {
    /// Message safe to show to the client.
    ///
    /// Storage failures are reported generically; their detail only goes to
    /// the log.
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            Self::Store(_) => "Server error".to_string(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_detail_is_hidden_from_clients() {
        let err = ChatError::from(StoreError::Unavailable("redis:6379 refused".into()));
        assert_eq!(err.client_message(), "Server error");
        assert!(err.to_string().contains("redis:6379"));
    }

    #[test]
    fn business_errors_are_shown_verbatim() {
        assert_eq!(
            ChatError::Validation("Username is required".into()).client_message(),
            "Username is required"
        );
        assert_eq!(ChatError::Authentication.client_message(), "Not authenticated");
        assert_eq!(
            ChatError::InvalidConversation("general".into()).client_message(),
            "Invalid conversation id: general"
        );
    }
}
