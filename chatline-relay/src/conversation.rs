//! Two-party conversations.
//!
//! A conversation id is a pure function of the unordered participant pair:
//! `chat-{lower}-dm-{upper}` with the two identity ids sorted
//! lexicographically. Both participants compute the same id on their own,
//! so records are created lazily on the first message and the only race is
//! two creations of the same key, settled by the store's create-if-absent.

use std::sync::Arc;

use chatline_proto::event::ChatSummary;

use crate::error::ChatError;
use crate::keys;
use crate::store::{Fields, Store};
use crate::unix_now;

const ID_PREFIX: &str = "chat";
const DM_MARKER: &str = "dm";

/// Conversation kind recorded in metadata.
pub const KIND_DM: &str = "dm";

/// Builds the deterministic id of the conversation between `a` and `b`.
///
/// Symmetric: `deterministic_id(a, b) == deterministic_id(b, a)`.
#[must_use]
pub fn deterministic_id(a: &str, b: &str) -> String {
    let (lower, upper) = if a <= b { (a, b) } else { (b, a) };
    format!("{ID_PREFIX}-{lower}-{DM_MARKER}-{upper}")
}

/// Splits a conversation id back into its sorted participant pair.
///
/// Returns `None` for anything that is not exactly `chat-X-dm-Y` with
/// non-empty, sorted `X <= Y`. Such ids are ordinary input (other
/// conversation kinds), not protocol violations.
#[must_use]
pub fn parse_participants(conversation_id: &str) -> Option<(&str, &str)> {
    let mut parts = conversation_id.split('-');
    let (Some(ID_PREFIX), Some(lower), Some(DM_MARKER), Some(upper), None) = (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) else {
        return None;
    };
    if lower.is_empty() || upper.is_empty() || lower > upper {
        return None;
    }
    Some((lower, upper))
}

/// Whether `identity_id` is one of the two participants of `conversation_id`.
#[must_use]
pub fn user_belongs(conversation_id: &str, identity_id: &str) -> bool {
    parse_participants(conversation_id)
        .is_some_and(|(lower, upper)| lower == identity_id || upper == identity_id)
}

/// A persisted two-party conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    /// Deterministic id.
    pub id: String,
    /// Lexicographically smaller participant.
    pub participant_a: String,
    /// Lexicographically larger participant.
    pub participant_b: String,
    /// Creation time, unix seconds.
    pub created_at: i64,
    /// Text of the most recent message.
    pub last_message_text: String,
    /// Time of the most recent message, unix seconds.
    pub last_message_at: i64,
}

impl Conversation {
    fn new(id: &str, participant_a: &str, participant_b: &str) -> Self {
        let now = unix_now();
        Self {
            id: id.to_string(),
            participant_a: participant_a.to_string(),
            participant_b: participant_b.to_string(),
            created_at: now,
            last_message_text: String::new(),
            last_message_at: now,
        }
    }

    /// Both participants, sorted.
    #[must_use]
    pub fn participants(&self) -> [&str; 2] {
        [&self.participant_a, &self.participant_b]
    }

    /// Wire summary listed in `auth-ok`.
    #[must_use]
    pub fn summary(&self) -> ChatSummary {
        ChatSummary {
            id: self.id.clone(),
            kind: KIND_DM.to_string(),
            user_a: self.participant_a.clone(),
            user_b: self.participant_b.clone(),
            created_at: self.created_at,
            last_message: self.last_message_text.clone(),
            last_timestamp: self.last_message_at,
        }
    }

    fn to_fields(&self) -> Fields {
        Fields::from([
            ("type".to_string(), KIND_DM.to_string()),
            ("user_a".to_string(), self.participant_a.clone()),
            ("user_b".to_string(), self.participant_b.clone()),
            ("created_at".to_string(), self.created_at.to_string()),
            ("last_message".to_string(), self.last_message_text.clone()),
            ("last_timestamp".to_string(), self.last_message_at.to_string()),
        ])
    }

    fn from_fields(id: &str, fields: &Fields) -> Option<Self> {
        let participant_a = fields.get("user_a").filter(|v| !v.is_empty())?;
        let participant_b = fields.get("user_b").filter(|v| !v.is_empty())?;
        let int = |name: &str| {
            fields
                .get(name)
                .and_then(|v| v.parse().ok())
                .unwrap_or_default()
        };
        Some(Self {
            id: id.to_string(),
            participant_a: participant_a.clone(),
            participant_b: participant_b.clone(),
            created_at: int("created_at"),
            last_message_text: fields.get("last_message").cloned().unwrap_or_default(),
            last_message_at: int("last_timestamp"),
        })
    }
}

/// Creates, loads, and summarises conversations.
pub struct ConversationStore<S> {
    store: Arc<S>,
}

impl<S> Clone for ConversationStore<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: Store> ConversationStore<S> {
    /// Creates a conversation store persisting through `store`.
    #[must_use]
    pub const fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Loads the conversation, creating it on first use.
    ///
    /// An existing record is returned as is. Concurrent first calls from both
    /// participants converge on one record; every call (re)links both
    /// participants' conversation indices, which is idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::InvalidConversation`] if the id does not parse,
    /// or [`ChatError::Store`] on storage failure or an unreadable record.
    pub async fn ensure(&self, conversation_id: &str) -> Result<Conversation, ChatError> {
        let (lower, upper) = parse_participants(conversation_id)
            .ok_or_else(|| ChatError::InvalidConversation(conversation_id.to_string()))?;
        let meta_key = keys::conversation_meta(conversation_id);

        let fresh = Conversation::new(conversation_id, lower, upper);
        let created = self
            .store
            .hash_set_if_absent(&meta_key, fresh.to_fields())
            .await?;

        let conversation = if created {
            tracing::info!(chat_id = %conversation_id, "conversation created");
            fresh
        } else {
            self.get(conversation_id).await?.ok_or_else(|| {
                ChatError::NotFound(format!("conversation metadata for {conversation_id}"))
            })?
        };

        for participant in [lower, upper] {
            self.store
                .set_add(&keys::identity_conversations(participant), conversation_id)
                .await?;
        }
        Ok(conversation)
    }

    /// Loads a conversation record without creating it.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Store`] on storage failure.
    pub async fn get(&self, conversation_id: &str) -> Result<Option<Conversation>, ChatError> {
        let fields = self
            .store
            .hash_get_all(&keys::conversation_meta(conversation_id))
            .await?;
        Ok(Conversation::from_fields(conversation_id, &fields))
    }

    /// Overwrites the last-message summary of an existing conversation.
    ///
    /// Returns `false` without writing if the conversation does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Store`] on storage failure.
    pub async fn record_activity(
        &self,
        conversation_id: &str,
        last_message_text: &str,
        last_message_at: i64,
    ) -> Result<bool, ChatError> {
        let meta_key = keys::conversation_meta(conversation_id);
        if !self.store.exists(&meta_key).await? {
            return Ok(false);
        }
        self.store
            .hash_set(
                &meta_key,
                Fields::from([
                    ("last_message".to_string(), last_message_text.to_string()),
                    ("last_timestamp".to_string(), last_message_at.to_string()),
                ]),
            )
            .await?;
        Ok(true)
    }

    /// Returns an identity's conversations, most recent activity first.
    ///
    /// Index entries without a readable record are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Store`] on storage failure.
    pub async fn list_for(&self, identity_id: &str) -> Result<Vec<Conversation>, ChatError> {
        let ids = self
            .store
            .set_members(&keys::identity_conversations(identity_id))
            .await?;
        let mut conversations = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(conversation) = self.get(&id).await? {
                conversations.push(conversation);
            }
        }
        conversations.sort_by(|a, b| {
            b.last_message_at
                .cmp(&a.last_message_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(conversations)
    }
}
