//! Conversation Store
//!
//! Request/response access to persisted conversations and message history.
//! Nothing here streams; the multiplexer calls these verbs and folds the
//! results into its registry.

mod http;

pub use http::{ApiResponse, HttpChatStore};

use async_trait::async_trait;

use crate::error::StoreError;
use crate::messages::{Conversation, ConversationId, Message};

/// Title used when a conversation is created without one
pub const DEFAULT_TITLE: &str = "新对话";

/// Persistence collaborator
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// One page of the user's conversations, newest first (`page` is 1-based)
    async fn list_conversations(
        &self,
        page: u32,
        size: u32,
    ) -> Result<Vec<Conversation>, StoreError>;

    /// Create an empty conversation
    async fn create_conversation(&self, title: &str) -> Result<Conversation, StoreError>;

    /// Change a conversation's title
    async fn rename_conversation(&self, id: ConversationId, title: &str)
        -> Result<(), StoreError>;

    /// Delete a conversation and its messages
    async fn delete_conversation(&self, id: ConversationId) -> Result<(), StoreError>;

    /// Full message history of a conversation, in arrival order
    async fn fetch_messages(&self, id: ConversationId) -> Result<Vec<Message>, StoreError>;
}
