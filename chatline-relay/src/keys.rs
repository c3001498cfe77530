//! Logical key layout of everything the relay persists.

/// Set of identity ids currently bound to a live connection.
pub const ONLINE_IDENTITIES: &str = "presence:onlineIdentities";

/// Pub/sub channel carrying presence events.
pub const PRESENCE_CHANNEL: &str = "presence:events";

/// Hash holding an identity record.
#[must_use]
pub fn identity(id: &str) -> String {
    format!("identity:{id}")
}

/// Unix-seconds time an identity was last seen connecting or disconnecting.
#[must_use]
pub fn last_seen(id: &str) -> String {
    format!("identity:{id}:lastSeen")
}

/// Set of conversation ids an identity participates in.
#[must_use]
pub fn identity_conversations(id: &str) -> String {
    format!("identity:{id}:conversations")
}

/// Token index entry resolving to an identity id. Carries the session TTL.
#[must_use]
pub fn token(token: &str) -> String {
    format!("token:{token}")
}

/// Hash holding conversation metadata.
#[must_use]
pub fn conversation_meta(id: &str) -> String {
    format!("conversation:{id}:meta")
}

/// Capped list of message ids in a conversation, oldest first.
#[must_use]
pub fn conversation_messages(id: &str) -> String {
    format!("conversation:{id}:messages")
}

/// Hash holding a single message.
#[must_use]
pub fn message(id: &str) -> String {
    format!("message:{id}")
}
