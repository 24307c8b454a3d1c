//! Conversation and Message Model
//!
//! Plain data exchanged with the conversation store and materialized by the
//! registry while streams are in flight.
//!
//! # Design Philosophy
//!
//! Identifiers assigned by the server are plain integers wrapped in newtypes so
//! a conversation id can never be passed where a message id is expected.
//! Messages produced locally before the server confirms them (the optimistic
//! USER message, BOT messages without a server id) draw ids from
//! [`MessageId::local`], which never collides with another local id in the same
//! process.

use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Server-assigned conversation identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub i64);

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Message identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub i64);

impl MessageId {
    /// Generate an id for a message the server has not confirmed yet
    ///
    /// Seeded from the wall clock (milliseconds) on first use and incremented
    /// atomically afterwards, so two sends in the same millisecond still get
    /// distinct ids.
    pub fn local() -> Self {
        static NEXT: AtomicI64 = AtomicI64::new(0);

        let seed = chrono::Utc::now().timestamp_millis();
        let _ = NEXT.compare_exchange(0, seed, Ordering::SeqCst, Ordering::SeqCst);
        Self(NEXT.fetch_add(1, Ordering::SeqCst))
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one in-flight stream session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Create a new unique session ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short form: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Who sent a message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SenderRole {
    /// User input
    User,
    /// Answer produced by the model pipeline
    Bot,
    /// System notice
    System,
}

/// A knowledge-base citation attached to an answer
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SourceDoc {
    /// Source document id
    pub doc_id: Option<i64>,
    /// Document title
    pub title: String,
    /// Quoted excerpt
    pub content: String,
    /// Retrieval similarity score
    pub similarity: f64,
    /// Knowledge-base category
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

/// Token accounting reported with a finished answer
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TokenUsage {
    /// Tokens in the prompt
    pub prompt_tokens: u32,
    /// Tokens generated
    pub completion_tokens: u32,
    /// Sum of both
    pub total_tokens: u32,
}

/// Optional metadata bag carried by BOT messages
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MessageMetadata {
    /// Citations backing the answer
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<SourceDoc>,
    /// Token usage
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    /// End-to-end latency in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
    /// Set on answers flushed by a mid-stream split
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub is_intermediate: bool,
    /// Keys this client does not interpret
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A conversation as listed by the store
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    /// Server-assigned id, immutable once assigned
    pub id: ConversationId,
    /// Owning user
    #[serde(default)]
    pub user_id: Option<i64>,
    /// Display title
    #[serde(default)]
    pub title: String,
    /// Number of messages in the conversation
    #[serde(default)]
    pub message_count: u32,
    /// Lifecycle status (e.g. `ACTIVE`)
    #[serde(default = "default_status")]
    pub status: String,
    /// Creation time (ISO-8601)
    #[serde(default)]
    pub created_at: Option<String>,
    /// Last update time (ISO-8601)
    #[serde(default)]
    pub updated_at: Option<String>,
}

fn default_status() -> String {
    "ACTIVE".to_string()
}

impl Conversation {
    /// Create a conversation record on the client side
    pub fn new(id: ConversationId, title: impl Into<String>) -> Self {
        let now = now_iso();
        Self {
            id,
            user_id: None,
            title: title.into(),
            message_count: 0,
            status: default_status(),
            created_at: Some(now.clone()),
            updated_at: Some(now),
        }
    }
}

/// A single message in a conversation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Message id
    pub id: MessageId,
    /// Owning conversation (0 while the conversation is pending)
    pub conversation_id: ConversationId,
    /// Message this one replies to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_message_id: Option<MessageId>,
    /// Who sent it
    pub sender_type: SenderRole,
    /// Message text, immutable once finalized
    #[serde(default)]
    pub content: String,
    /// Token count, if the server reported one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_count: Option<u32>,
    /// Citations, usage, latency
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
    /// Creation time (ISO-8601)
    #[serde(default)]
    pub created_at: Option<String>,
    /// Id of the USER message that opened this exchange
    #[serde(default)]
    pub round_id: Option<MessageId>,
    /// Whether this is the final BOT message of its round
    #[serde(default)]
    pub is_last_in_round: bool,
    /// Whether the UI should play its reveal animation for this message
    #[serde(skip)]
    pub animate: bool,
}

impl Message {
    /// Create an optimistic USER message that opens a new round
    pub fn user(conversation_id: ConversationId, content: impl Into<String>) -> Self {
        let id = MessageId::local();
        Self {
            id,
            conversation_id,
            parent_message_id: None,
            sender_type: SenderRole::User,
            content: content.into(),
            token_count: None,
            metadata: None,
            created_at: Some(now_iso()),
            round_id: Some(id),
            is_last_in_round: false,
            animate: false,
        }
    }

    /// Create a finalized BOT message answering `round_id`
    pub fn bot(
        id: MessageId,
        conversation_id: ConversationId,
        round_id: MessageId,
        content: impl Into<String>,
        metadata: MessageMetadata,
    ) -> Self {
        Self {
            id,
            conversation_id,
            parent_message_id: Some(round_id),
            sender_type: SenderRole::Bot,
            content: content.into(),
            token_count: metadata.usage.map(|u| u.completion_tokens),
            metadata: Some(metadata),
            created_at: Some(now_iso()),
            round_id: Some(round_id),
            is_last_in_round: true,
            animate: true,
        }
    }

    /// Whether this message was sent by the user
    #[must_use]
    pub fn is_user(&self) -> bool {
        self.sender_type == SenderRole::User
    }

    /// Whether this message was produced by the model pipeline
    #[must_use]
    pub fn is_bot(&self) -> bool {
        self.sender_type == SenderRole::Bot
    }
}

/// Current time as an ISO-8601 string
pub(crate) fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_ids_unique() {
        let a = MessageId::local();
        let b = MessageId::local();
        assert_ne!(a, b);
        assert!(b.0 > a.0);
    }

    #[test]
    fn test_user_message_opens_round() {
        let msg = Message::user(ConversationId(7), "hi");
        assert_eq!(msg.round_id, Some(msg.id));
        assert!(msg.is_user());
        assert!(!msg.is_last_in_round);
    }

    #[test]
    fn test_message_deserializes_server_shape() {
        let json = r#"{
            "id": 12,
            "conversationId": 3,
            "senderType": "BOT",
            "content": "答案",
            "metadata": {"sources": [{"docId": 1, "title": "手册", "content": "...", "similarity": 0.9}], "responseTimeMs": 840, "model": "qwen"},
            "createdAt": "2025-01-01T00:00:00"
        }"#;

        let msg: Message = serde_json::from_str(json).unwrap();
        assert_eq!(msg.id, MessageId(12));
        assert_eq!(msg.sender_type, SenderRole::Bot);
        let meta = msg.metadata.unwrap();
        assert_eq!(meta.sources.len(), 1);
        assert_eq!(meta.response_time_ms, Some(840));
        assert_eq!(meta.extra.get("model").and_then(|v| v.as_str()), Some("qwen"));
        assert!(msg.round_id.is_none());
    }

    #[test]
    fn test_conversation_defaults() {
        let conv: Conversation = serde_json::from_str(r#"{"id": 5, "title": "课表"}"#).unwrap();
        assert_eq!(conv.status, "ACTIVE");
        assert_eq!(conv.message_count, 0);
    }

    #[test]
    fn test_session_id_display_short() {
        let id = SessionId::new();
        assert_eq!(id.to_string().len(), 8);
    }
}
