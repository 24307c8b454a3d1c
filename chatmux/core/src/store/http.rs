//! HTTP Conversation Store
//!
//! Every endpoint answers with the envelope `{"code", "message", "data"}`;
//! `code` 200 (or 0 from older deployments) means success.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::ChatStore;
use crate::config::MuxConfig;
use crate::error::StoreError;
use crate::messages::{Conversation, ConversationId, Message};

const CONVERSATIONS_PATH: &str = "/v1/chat/conversations";

/// Response envelope used by every store endpoint
#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    /// Business status code
    pub code: i64,
    /// Server message
    #[serde(default)]
    pub message: String,
    /// Payload
    #[serde(default = "Option::default")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    /// Whether `code` signals success
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.code == 200 || self.code == 0
    }

    /// Unwrap the envelope into its payload (which may be absent)
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Api`] for a failure code.
    pub fn into_result(self) -> Result<Option<T>, StoreError> {
        if self.is_success() {
            Ok(self.data)
        } else {
            Err(StoreError::Api {
                code: self.code,
                message: self.message,
            })
        }
    }
}

/// reqwest-backed [`ChatStore`]
#[derive(Clone, Debug)]
pub struct HttpChatStore {
    base_url: String,
    user_id: String,
    auth_token: Option<String>,
    http_client: reqwest::Client,
}

impl HttpChatStore {
    /// Build a store with its own client
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn from_config(config: &MuxConfig) -> Result<Self, StoreError> {
        let http_client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self::with_client(config, http_client))
    }

    /// Build a store sharing an existing client
    #[must_use]
    pub fn with_client(config: &MuxConfig, http_client: reqwest::Client) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            user_id: config.user_id.clone(),
            auth_token: config.auth_token.clone(),
            http_client,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}{}", self.base_url, CONVERSATIONS_PATH, path)
    }

    fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        let builder = self
            .http_client
            .request(method, url)
            .header("X-User-Id", &self.user_id);
        match self.auth_token {
            Some(ref token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send<T: DeserializeOwned>(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<Option<T>, StoreError> {
        let response = builder.send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Status { status, body });
        }
        let envelope: ApiResponse<T> = response.json().await?;
        envelope.into_result()
    }
}

#[async_trait]
impl ChatStore for HttpChatStore {
    async fn list_conversations(
        &self,
        page: u32,
        size: u32,
    ) -> Result<Vec<Conversation>, StoreError> {
        let builder = self
            .request(reqwest::Method::GET, self.url(""))
            .query(&[("page", page), ("size", size)]);
        Ok(self.send(builder).await?.unwrap_or_default())
    }

    async fn create_conversation(&self, title: &str) -> Result<Conversation, StoreError> {
        let builder = self
            .request(reqwest::Method::POST, self.url(""))
            .query(&[("title", title)]);
        self.send(builder)
            .await?
            .ok_or(StoreError::MissingData("create_conversation"))
    }

    async fn rename_conversation(
        &self,
        id: ConversationId,
        title: &str,
    ) -> Result<(), StoreError> {
        let builder = self
            .request(reqwest::Method::PUT, self.url(&format!("/{id}")))
            .query(&[("title", title)]);
        self.send::<serde_json::Value>(builder).await?;
        Ok(())
    }

    async fn delete_conversation(&self, id: ConversationId) -> Result<(), StoreError> {
        let builder = self.request(reqwest::Method::DELETE, self.url(&format!("/{id}")));
        self.send::<serde_json::Value>(builder).await?;
        Ok(())
    }

    async fn fetch_messages(&self, id: ConversationId) -> Result<Vec<Message>, StoreError> {
        let builder = self.request(reqwest::Method::GET, self.url(&format!("/{id}/messages")));
        Ok(self.send(builder).await?.unwrap_or_default())
    }
}
