//! HTTP Streaming Transport
//!
//! `POST {base_url}/v1/chat/message/stream` with a JSON body, answered with a
//! `text/event-stream` body.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::ACCEPT;

use super::{ByteStream, StreamRequest, Transport};
use crate::config::MuxConfig;
use crate::error::TransportError;

const STREAM_PATH: &str = "/v1/chat/message/stream";

/// reqwest-backed [`Transport`]
#[derive(Clone, Debug)]
pub struct HttpTransport {
    /// API root without trailing slash
    base_url: String,
    /// Value of `X-User-Id`
    user_id: String,
    /// Bearer token
    auth_token: Option<String>,
    /// HTTP client
    http_client: reqwest::Client,
}

impl HttpTransport {
    /// Build a transport with its own client
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn from_config(config: &MuxConfig) -> Result<Self, TransportError> {
        let http_client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self::with_client(config, http_client))
    }

    /// Build a transport sharing an existing client
    #[must_use]
    pub fn with_client(config: &MuxConfig, http_client: reqwest::Client) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            user_id: config.user_id.clone(),
            auth_token: config.auth_token.clone(),
            http_client,
        }
    }

    fn stream_url(&self) -> String {
        format!("{}{}", self.base_url, STREAM_PATH)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn name(&self) -> &str {
        "http"
    }

    async fn open(&self, request: &StreamRequest) -> Result<ByteStream, TransportError> {
        let mut builder = self
            .http_client
            .post(self.stream_url())
            .header(ACCEPT, "text/event-stream")
            .header("X-User-Id", &self.user_id)
            .json(request);
        if let Some(ref token) = self.auth_token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Status { status, body });
        }

        tracing::debug!(
            url = %self.stream_url(),
            conversation_id = ?request.conversation_id,
            "Stream opened"
        );

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(TransportError::from));
        Ok(Box::pin(stream))
    }
}
