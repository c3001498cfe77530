//! Message routing: validate, persist, index, and resolve recipients.
//!
//! The router never touches connections. [`MessageRouter::send`] returns a
//! [`Delivery`] naming the recipient identities; fanning out to their live
//! connections is the session layer's job.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chatline_proto::event::MessageView;
use uuid::Uuid;

use crate::conversation::{self, ConversationStore};
use crate::error::ChatError;
use crate::keys;
use crate::store::{Fields, Store};
use crate::unix_now;

/// Default number of messages retained per conversation.
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

/// Kind of a message body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Plain text.
    #[default]
    Text,
    /// Image reference.
    Image,
    /// File reference.
    File,
    /// Audio reference.
    Audio,
}

impl MessageKind {
    /// Wire name of the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::File => "file",
            Self::Audio => "audio",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = ChatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "image" => Ok(Self::Image),
            "file" => Ok(Self::File),
            "audio" => Ok(Self::Audio),
            _ => Err(ChatError::Validation("Invalid message type".to_string())),
        }
    }
}

/// A persisted message. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Opaque unique id.
    pub id: String,
    /// Identity that sent the message.
    pub sender_id: String,
    /// Conversation the message belongs to.
    pub conversation_id: String,
    /// Message body.
    pub content: String,
    /// Body kind.
    pub kind: MessageKind,
    /// Send time, unix seconds.
    pub sent_at: i64,
}

impl Message {
    fn new(sender_id: &str, conversation_id: &str, content: &str, kind: MessageKind) -> Self {
        Self {
            id: format!("msg_{}", Uuid::now_v7().simple()),
            sender_id: sender_id.to_string(),
            conversation_id: conversation_id.to_string(),
            content: content.to_string(),
            kind,
            sent_at: unix_now(),
        }
    }

    /// Wire view returned in `chat-messages`.
    #[must_use]
    pub fn view(&self) -> MessageView {
        MessageView {
            id: self.id.clone(),
            sender_id: self.sender_id.clone(),
            chat_id: self.conversation_id.clone(),
            content: self.content.clone(),
            kind: self.kind.to_string(),
            timestamp: self.sent_at,
        }
    }

    fn to_fields(&self) -> Fields {
        Fields::from([
            ("sender_id".to_string(), self.sender_id.clone()),
            ("chat_id".to_string(), self.conversation_id.clone()),
            ("content".to_string(), self.content.clone()),
            ("type".to_string(), self.kind.to_string()),
            ("timestamp".to_string(), self.sent_at.to_string()),
        ])
    }

    fn from_fields(id: &str, fields: &Fields) -> Option<Self> {
        Some(Self {
            id: id.to_string(),
            sender_id: fields.get("sender_id")?.clone(),
            conversation_id: fields.get("chat_id")?.clone(),
            content: fields.get("content").cloned().unwrap_or_default(),
            kind: fields
                .get("type")
                .and_then(|k| k.parse().ok())
                .unwrap_or_default(),
            sent_at: fields
                .get("timestamp")
                .and_then(|t| t.parse().ok())
                .unwrap_or_default(),
        })
    }
}

/// Result of a successful send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Conversation the message was filed under.
    pub conversation_id: String,
    /// The stored message.
    pub message: Message,
    /// Participants to notify; never includes the sender.
    pub recipient_ids: Vec<String>,
}

/// Persists messages into conversations and reads history back.
pub struct MessageRouter<S> {
    store: Arc<S>,
    conversations: ConversationStore<S>,
    history_limit: usize,
}

impl<S> Clone for MessageRouter<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            conversations: self.conversations.clone(),
            history_limit: self.history_limit,
        }
    }
}

impl<S: Store> MessageRouter<S> {
    /// Creates a router retaining at most `history_limit` messages per conversation.
    #[must_use]
    pub fn new(store: Arc<S>, history_limit: usize) -> Self {
        Self {
            conversations: ConversationStore::new(Arc::clone(&store)),
            store,
            history_limit: history_limit.max(1),
        }
    }

    /// Maximum retained messages per conversation.
    #[must_use]
    pub const fn history_limit(&self) -> usize {
        self.history_limit
    }

    /// Stores a message from `sender_id` and returns who must receive it.
    ///
    /// Content, membership, and kind are checked in that order before any
    /// write, so a rejected send leaves the store untouched. The conversation
    /// is created on first use; its history is trimmed to the newest
    /// [`history_limit`](Self::history_limit) messages.
    ///
    /// # Errors
    ///
    /// - [`ChatError::Validation`] for blank content or an unknown kind.
    /// - [`ChatError::Authorization`] if the sender is not a participant,
    ///   including when the id does not parse as a conversation.
    /// - [`ChatError::Store`] on storage failure.
    pub async fn send(
        &self,
        sender_id: &str,
        conversation_id: &str,
        content: &str,
        kind: Option<&str>,
    ) -> Result<Delivery, ChatError> {
        if content.trim().is_empty() {
            return Err(ChatError::Validation(
                "Message content is required".to_string(),
            ));
        }
        if !conversation::user_belongs(conversation_id, sender_id) {
            tracing::warn!(
                identity = %sender_id,
                chat_id = %conversation_id,
                "send rejected: not a participant"
            );
            return Err(ChatError::Authorization(
                "Access denied to this chat".to_string(),
            ));
        }

        let kind = kind.map_or(Ok(MessageKind::Text), str::parse::<MessageKind>)?;

        let conversation = self.conversations.ensure(conversation_id).await?;
        let message = Message::new(sender_id, conversation_id, content, kind);

        self.store
            .hash_set(&keys::message(&message.id), message.to_fields())
            .await?;
        let history_key = keys::conversation_messages(conversation_id);
        self.store
            .list_push(&history_key, message.id.clone())
            .await?;
        let keep = i64::try_from(self.history_limit).unwrap_or(i64::MAX);
        self.store.list_trim(&history_key, -keep, -1).await?;
        self.conversations
            .record_activity(conversation_id, &message.content, message.sent_at)
            .await?;

        let mut recipient_ids: Vec<String> = conversation
            .participants()
            .into_iter()
            .filter(|p| *p != sender_id)
            .map(str::to_string)
            .collect();
        recipient_ids.dedup();

        tracing::debug!(
            identity = %sender_id,
            chat_id = %conversation_id,
            message_id = %message.id,
            recipients = recipient_ids.len(),
            "message stored"
        );

        Ok(Delivery {
            conversation_id: conversation_id.to_string(),
            message,
            recipient_ids,
        })
    }

    /// Returns up to `limit` newest messages of a conversation, oldest first.
    ///
    /// `limit` is clamped to [`history_limit`](Self::history_limit). Index
    /// entries whose record is missing are skipped. Membership is checked by
    /// the caller.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Store`] on storage failure.
    pub async fn history(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>, ChatError> {
        let limit = limit.min(self.history_limit);
        if limit == 0 {
            return Ok(Vec::new());
        }
        let start = -i64::try_from(limit).unwrap_or(i64::MAX);
        let ids = self
            .store
            .list_range(&keys::conversation_messages(conversation_id), start, -1)
            .await?;

        let mut messages = Vec::with_capacity(ids.len());
        for id in ids {
            let fields = self.store.hash_get_all(&keys::message(&id)).await?;
            match Message::from_fields(&id, &fields) {
                Some(message) => messages.push(message),
                None => tracing::debug!(message_id = %id, "skipping missing message record"),
            }
        }
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::deterministic_id;
    use crate::store::{MemoryStore, PausingStore};

    fn router() -> (Arc<MemoryStore>, MessageRouter<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let router = MessageRouter::new(Arc::clone(&store), DEFAULT_HISTORY_LIMIT);
        (store, router)
    }

    #[tokio::test]
    async fn send_persists_and_names_other_participant() {
        let (_store, router) = router();
        let chat = deterministic_id("u1", "u2");

        let delivery = router.send("u1", &chat, "hello", None).await.unwrap();
        assert_eq!(delivery.conversation_id, chat);
        assert_eq!(delivery.recipient_ids, vec!["u2".to_string()]);
        assert_eq!(delivery.message.kind, MessageKind::Text);
        assert!(delivery.message.id.starts_with("msg_"));

        let history = router.history(&chat, 50).await.unwrap();
        assert_eq!(history, vec![delivery.message]);
    }

    #[tokio::test]
    async fn send_updates_conversation_summary() {
        let (store, router) = router();
        let chat = deterministic_id("u1", "u2");
        router.send("u2", &chat, "first", None).await.unwrap();
        let last = router.send("u1", &chat, "second", None).await.unwrap();

        let conversations = ConversationStore::new(store);
        let conversation = conversations.get(&chat).await.unwrap().unwrap();
        assert_eq!(conversation.last_message_text, "second");
        assert_eq!(conversation.last_message_at, last.message.sent_at);
    }

    #[tokio::test]
    async fn first_messages_from_both_sides_share_one_conversation() {
        let store = Arc::new(PausingStore::new());
        let router = MessageRouter::new(Arc::clone(&store), DEFAULT_HISTORY_LIMIT);
        let chat = deterministic_id("u1", "u2");

        let (a, b) = tokio::join!(
            router.send("u1", &chat, "from u1", None),
            router.send("u2", &chat, "from u2", None),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.recipient_ids, vec!["u2".to_string()]);
        assert_eq!(b.recipient_ids, vec!["u1".to_string()]);

        // One creation plus one activity update per message.
        assert_eq!(store.hash_writes(&keys::conversation_meta(&chat)), 3);
        for user in ["u1", "u2"] {
            let members = store
                .set_members(&keys::identity_conversations(user))
                .await
                .unwrap();
            assert_eq!(members, vec![chat.clone()]);
        }
        let mut contents: Vec<_> = router
            .history(&chat, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        contents.sort();
        assert_eq!(contents, vec!["from u1", "from u2"]);
    }

    #[tokio::test]
    async fn history_is_capped_at_limit() {
        let (store, router) = router();
        let chat = deterministic_id("u1", "u2");
        for i in 1..=105 {
            router
                .send("u1", &chat, &format!("m{i}"), None)
                .await
                .unwrap();
        }

        assert_eq!(
            store
                .list_len(&keys::conversation_messages(&chat))
                .await
                .unwrap(),
            DEFAULT_HISTORY_LIMIT
        );
        let history = router.history(&chat, 200).await.unwrap();
        assert_eq!(history.len(), 100);
        assert_eq!(history.first().unwrap().content, "m6");
        assert_eq!(history.last().unwrap().content, "m105");
    }

    #[tokio::test]
    async fn history_returns_newest_slice() {
        let (_store, router) = router();
        let chat = deterministic_id("u1", "u2");
        for i in 1..=5 {
            router
                .send("u2", &chat, &format!("m{i}"), None)
                .await
                .unwrap();
        }
        let contents: Vec<_> = router
            .history(&chat, 2)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, vec!["m4", "m5"]);
        assert!(router.history(&chat, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn non_participant_is_rejected_without_side_effects() {
        let (store, router) = router();
        let chat = deterministic_id("u1", "u2");

        let err = router.send("u3", &chat, "hi", None).await.unwrap_err();
        assert!(matches!(err, ChatError::Authorization(_)));
        assert_eq!(err.client_message(), "Access denied to this chat");
        assert!(!store.exists(&keys::conversation_meta(&chat)).await.unwrap());
        assert!(router.history(&chat, 100).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_conversation_id_is_rejected() {
        let (_store, router) = router();
        for id in ["general", "chat-u1-dm", "chat-u2-dm-u1"] {
            let err = router.send("u1", id, "hi", None).await.unwrap_err();
            assert!(matches!(err, ChatError::Authorization(_)), "id {id}");
        }
    }

    #[tokio::test]
    async fn blank_content_and_unknown_kind_are_rejected() {
        let (store, router) = router();
        let chat = deterministic_id("u1", "u2");

        let err = router.send("u1", &chat, "  \n", None).await.unwrap_err();
        assert_eq!(err.client_message(), "Message content is required");
        let err = router
            .send("u1", &chat, "hi", Some("video"))
            .await
            .unwrap_err();
        assert_eq!(err.client_message(), "Invalid message type");
        assert!(!store.exists(&keys::conversation_meta(&chat)).await.unwrap());
    }

    #[tokio::test]
    async fn explicit_kind_is_stored() {
        let (_store, router) = router();
        let chat = deterministic_id("u1", "u2");
        router
            .send("u1", &chat, "cat.png", Some("image"))
            .await
            .unwrap();
        let history = router.history(&chat, 1).await.unwrap();
        assert_eq!(history[0].kind, MessageKind::Image);
        assert_eq!(history[0].view().kind, "image");
    }

    #[tokio::test]
    async fn self_conversation_has_no_recipients() {
        let (_store, router) = router();
        let chat = deterministic_id("u1", "u1");
        let delivery = router.send("u1", &chat, "note", None).await.unwrap();
        assert!(delivery.recipient_ids.is_empty());
    }

    #[tokio::test]
    async fn history_skips_missing_records() {
        let (store, router) = router();
        let chat = deterministic_id("u1", "u2");
        let kept = router.send("u1", &chat, "kept", None).await.unwrap();
        store
            .list_push(&keys::conversation_messages(&chat), "msg_ghost".into())
            .await
            .unwrap();

        let history = router.history(&chat, 10).await.unwrap();
        assert_eq!(history, vec![kept.message]);
    }

    #[test]
    fn message_kind_parses_known_names() {
        for kind in [
            MessageKind::Text,
            MessageKind::Image,
            MessageKind::File,
            MessageKind::Audio,
        ] {
            assert_eq!(kind.as_str().parse::<MessageKind>().unwrap(), kind);
        }
        assert!("TEXT".parse::<MessageKind>().is_err());
    }
}
