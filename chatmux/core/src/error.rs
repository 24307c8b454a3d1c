//! Error Types
//!
//! One error enum per layer. Nothing here is fatal to the process: transport
//! and store errors degrade a single conversation, and stream failures are
//! classified into a [`FailureKind`] before they reach the UI.

use thiserror::Error;

use crate::messages::ConversationId;

/// Errors raised by a [`Transport`](crate::transport::Transport)
#[derive(Debug, Error)]
pub enum TransportError {
    /// The HTTP client failed to send or read
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with a non-success status
    #[error("server returned {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body (may be empty)
        body: String,
    },

    /// Reading the response body failed mid-stream
    #[error("stream read failed: {0}")]
    Body(String),
}

impl TransportError {
    /// HTTP status associated with this error, if any
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http(e) => e.status().map(|s| s.as_u16()),
            Self::Status { status, .. } => Some(*status),
            Self::Body(_) => None,
        }
    }
}

/// Errors raised by a [`ChatStore`](crate::store::ChatStore)
#[derive(Debug, Error)]
pub enum StoreError {
    /// The HTTP client failed
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with a non-success status
    #[error("server returned {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body (may be empty)
        body: String,
    },

    /// The API envelope reported a business error
    #[error("API error {code}: {message}")]
    Api {
        /// Business status code
        code: i64,
        /// Server message
        message: String,
    },

    /// The envelope carried no data where data was required
    #[error("API response for {0} carried no data")]
    MissingData(&'static str),
}

/// Errors returned by [`SessionMultiplexer`](crate::multiplexer::SessionMultiplexer) verbs
#[derive(Debug, Error)]
pub enum MuxError {
    /// The conversation store failed
    #[error(transparent)]
    Store(#[from] StoreError),

    /// No conversation with this id is known
    #[error("unknown conversation {0}")]
    UnknownConversation(ConversationId),

    /// The concurrent session cap was reached
    #[error("too many concurrent streams (max {max})")]
    TooManyStreams {
        /// Configured cap
        max: usize,
    },

    /// Refused to send an empty message
    #[error("message is empty")]
    EmptyMessage,
}

/// Classified reason a stream failed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    /// Per-user request rate exceeded
    RateLimited,
    /// The model pipeline or a gateway in front of it is overloaded
    UpstreamOverloaded,
    /// Too many streams open at once for this user or server
    ConcurrentStreamLimit,
    /// The server violated the framing or identity protocol
    Protocol,
    /// Anything else
    Generic,
}

impl FailureKind {
    /// Classify an error from its HTTP status and text
    ///
    /// The server words its refusals in Chinese, so both languages are matched.
    #[must_use]
    pub fn classify(status: Option<u16>, text: &str) -> Self {
        let lower = text.to_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

        if has(&["concurrent", "too many streams", "并发", "系统繁忙"]) {
            Self::ConcurrentStreamLimit
        } else if status == Some(429)
            || has(&["rate limit", "too many requests", "限流", "频繁"])
        {
            Self::RateLimited
        } else if matches!(status, Some(502..=504))
            || has(&["overloaded", "unavailable", "不可用", "繁忙"])
        {
            Self::UpstreamOverloaded
        } else {
            Self::Generic
        }
    }

    /// Whether this is a capacity/backpressure signal rather than a failure
    #[must_use]
    pub fn is_capacity(&self) -> bool {
        matches!(
            self,
            Self::RateLimited | Self::UpstreamOverloaded | Self::ConcurrentStreamLimit
        )
    }

    /// User-facing text for this failure
    #[must_use]
    pub fn user_message(&self, detail: &str) -> String {
        match self {
            Self::RateLimited => "请求过于频繁，请稍后再试".to_string(),
            Self::UpstreamOverloaded => "AI服务繁忙，请稍后再试".to_string(),
            Self::ConcurrentStreamLimit => "同时进行的对话过多，请等待其他回答完成".to_string(),
            Self::Protocol | Self::Generic => format!("发送失败: {detail}"),
        }
    }
}

/// A classified stream failure as seen by the StreamState
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamFailure {
    /// Classification
    pub kind: FailureKind,
    /// Raw detail from the transport or the `error` frame
    pub detail: String,
}

impl StreamFailure {
    /// Classify a failure from status and text
    pub fn new(status: Option<u16>, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        Self {
            kind: FailureKind::classify(status, &detail),
            detail,
        }
    }

    /// A protocol violation by the server
    pub fn protocol(detail: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Protocol,
            detail: detail.into(),
        }
    }

    /// User-facing text
    #[must_use]
    pub fn user_message(&self) -> String {
        self.kind.user_message(&self.detail)
    }
}

impl From<&TransportError> for StreamFailure {
    fn from(err: &TransportError) -> Self {
        let detail = match err {
            TransportError::Status { body, .. } if !body.is_empty() => body.clone(),
            other => other.to_string(),
        };
        Self::new(err.status(), detail)
    }
}

impl std::fmt::Display for StreamFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.detail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_by_status() {
        assert_eq!(FailureKind::classify(Some(429), ""), FailureKind::RateLimited);
        assert_eq!(
            FailureKind::classify(Some(503), "Service Unavailable"),
            FailureKind::UpstreamOverloaded
        );
        assert_eq!(FailureKind::classify(Some(500), "boom"), FailureKind::Generic);
    }

    #[test]
    fn test_classify_by_text() {
        assert_eq!(
            FailureKind::classify(None, "系统繁忙，请稍后再试"),
            FailureKind::ConcurrentStreamLimit
        );
        assert_eq!(
            FailureKind::classify(None, "Rate limit exceeded"),
            FailureKind::RateLimited
        );
        assert_eq!(
            FailureKind::classify(None, "model is overloaded"),
            FailureKind::UpstreamOverloaded
        );
        assert_eq!(
            FailureKind::classify(None, "connection reset"),
            FailureKind::Generic
        );
    }

    #[test]
    fn test_capacity_kinds() {
        assert!(FailureKind::RateLimited.is_capacity());
        assert!(FailureKind::ConcurrentStreamLimit.is_capacity());
        assert!(!FailureKind::Generic.is_capacity());
        assert!(!FailureKind::Protocol.is_capacity());
    }

    #[test]
    fn test_transport_status_body_is_detail() {
        let err = TransportError::Status {
            status: 429,
            body: "slow down".to_string(),
        };
        let failure = StreamFailure::from(&err);
        assert_eq!(failure.kind, FailureKind::RateLimited);
        assert_eq!(failure.detail, "slow down");
    }
}
