//! Streaming Transport
//!
//! The collaborator that issues one long-lived request and exposes the response
//! body as an incremental byte stream. Dropping the stream aborts the request,
//! which is how a cancelled session releases its connection.
//!
//! # Design Philosophy
//!
//! The multiplexer never talks HTTP directly. Everything it needs from the
//! network is `open(request) -> byte stream`; timeouts, TLS and headers are
//! the transport's business. Tests substitute a scripted transport.

mod http;

pub use http::HttpTransport;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::Serialize;

use crate::error::TransportError;
use crate::messages::ConversationId;

/// Incremental response body
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, TransportError>> + Send>>;

/// Body of a streaming chat request
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamRequest {
    /// User text
    pub message: String,
    /// Target conversation; `None` asks the server to create one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
}

impl StreamRequest {
    /// Create a request
    pub fn new(message: impl Into<String>, conversation_id: Option<ConversationId>) -> Self {
        Self {
            message: message.into(),
            conversation_id,
        }
    }
}

/// Opens streaming requests
#[async_trait]
pub trait Transport: Send + Sync {
    /// Human-readable name for logging
    fn name(&self) -> &str;

    /// Issue the request and return its response body
    ///
    /// A non-success status is returned as [`TransportError::Status`] before
    /// any body is read.
    async fn open(&self, request: &StreamRequest) -> Result<ByteStream, TransportError>;
}
