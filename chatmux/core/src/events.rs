//! Typed Stream Events
//!
//! Decodes [`RawFrame`]s into protocol events. The server wraps every payload
//! in a JSON envelope:
//!
//! ```json
//! {"type":"CONTENT","conversationId":42,"messageId":97,"content":"Hel"}
//! ```
//!
//! Simpler producers send bare payloads instead (plain-text content, a JSON
//! string for a status label, a bare array of sources); both forms decode to
//! the same event.
//!
//! The mid-stream split signal travels on the wire as a `status` frame whose
//! stage is [`NEW_MESSAGE_SENTINEL`]. It decodes to its own
//! [`StreamEvent::NewMessage`] variant and never reaches a display string.
//!
//! Malformed JSON is logged and the frame dropped; decoding never fails the
//! stream.

use serde::Deserialize;
use tracing::warn;

use crate::frame::RawFrame;
use crate::messages::{ConversationId, MessageId, SourceDoc, TokenUsage};

/// Reserved status label that splits the answer into a new BOT message
pub const NEW_MESSAGE_SENTINEL: &str = "__NEW_MESSAGE__";

/// Fallback text for an `error` frame with no message
const UNKNOWN_ERROR: &str = "未知错误";

/// Identity fields the server attaches to every event
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Envelope {
    /// Conversation the event belongs to
    pub conversation_id: Option<ConversationId>,
    /// Server id of the BOT message being streamed
    pub message_id: Option<MessageId>,
}

/// A decoded protocol event
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    /// Progress label (e.g. "正在检索...")
    Status {
        /// Identity fields
        envelope: Envelope,
        /// Free-text stage hint
        stage: String,
    },
    /// Start a new answer within the same exchange
    NewMessage {
        /// Identity fields
        envelope: Envelope,
    },
    /// Complete current citation set (not a delta)
    Sources {
        /// Identity fields
        envelope: Envelope,
        /// All sources so far
        sources: Vec<SourceDoc>,
    },
    /// Text fragment to append
    Content {
        /// Identity fields
        envelope: Envelope,
        /// Fragment
        text: String,
    },
    /// Answer finished
    Done {
        /// Identity fields
        envelope: Envelope,
        /// Token usage, if reported
        usage: Option<TokenUsage>,
        /// Latency, if reported
        response_time_ms: Option<u64>,
    },
    /// Server-side failure
    Error {
        /// Identity fields
        envelope: Envelope,
        /// Error text
        message: String,
    },
    /// Event type this client does not handle
    Unknown {
        /// Event type
        event: String,
        /// Raw payload
        data: String,
    },
}

impl StreamEvent {
    /// Identity fields, if this event carries any
    #[must_use]
    pub fn envelope(&self) -> Option<&Envelope> {
        match self {
            Self::Status { envelope, .. }
            | Self::NewMessage { envelope }
            | Self::Sources { envelope, .. }
            | Self::Content { envelope, .. }
            | Self::Done { envelope, .. }
            | Self::Error { envelope, .. } => Some(envelope),
            Self::Unknown { .. } => None,
        }
    }

    /// Conversation id carried by this event
    #[must_use]
    pub fn conversation_id(&self) -> Option<ConversationId> {
        self.envelope().and_then(|e| e.conversation_id)
    }

    /// Short name for logging
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Status { .. } => "status",
            Self::NewMessage { .. } => "new_message",
            Self::Sources { .. } => "sources",
            Self::Content { .. } => "content",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
            Self::Unknown { .. } => "unknown",
        }
    }
}

/// The server's JSON envelope
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct WirePayload {
    conversation_id: Option<i64>,
    message_id: Option<i64>,
    content: Option<String>,
    stage: Option<String>,
    sources: Option<Vec<SourceDoc>>,
    usage: Option<TokenUsage>,
    response_time_ms: Option<u64>,
    error: Option<String>,
    message: Option<String>,
}

impl WirePayload {
    fn envelope(&self) -> Envelope {
        Envelope {
            conversation_id: self.conversation_id.map(ConversationId),
            message_id: self.message_id.map(MessageId),
        }
    }
}

/// Payload shapes accepted on the wire
#[derive(Deserialize)]
#[serde(untagged)]
enum Payload {
    Label(String),
    Sources(Vec<SourceDoc>),
    Envelope(WirePayload),
}

/// Decode a raw frame into a typed event
///
/// Returns `None` when the payload is malformed; the reason is logged.
#[must_use]
pub fn decode(frame: &RawFrame) -> Option<StreamEvent> {
    let data = frame.data.as_str();

    match frame.event.as_str() {
        "status" => {
            let (envelope, stage) = if looks_like_json(data) {
                match parse(frame)? {
                    Payload::Label(stage) => (Envelope::default(), stage),
                    Payload::Envelope(p) => (p.envelope(), p.stage.clone().unwrap_or_default()),
                    Payload::Sources(_) => return malformed(frame, "array is not a status"),
                }
            } else {
                (Envelope::default(), data.trim().to_string())
            };

            if stage == NEW_MESSAGE_SENTINEL {
                Some(StreamEvent::NewMessage { envelope })
            } else {
                Some(StreamEvent::Status { envelope, stage })
            }
        }

        "sources" => match parse(frame)? {
            Payload::Sources(sources) => Some(StreamEvent::Sources {
                envelope: Envelope::default(),
                sources,
            }),
            Payload::Envelope(p) => Some(StreamEvent::Sources {
                envelope: p.envelope(),
                sources: p.sources.unwrap_or_default(),
            }),
            Payload::Label(_) => malformed(frame, "string is not a source list"),
        },

        "content" => {
            // Plain text unless it is clearly the server's envelope
            if data.trim_start().starts_with('{') {
                if let Ok(p) = serde_json::from_str::<WirePayload>(data) {
                    if let Some(text) = p.content.clone() {
                        return Some(StreamEvent::Content {
                            envelope: p.envelope(),
                            text,
                        });
                    }
                }
            }
            Some(StreamEvent::Content {
                envelope: Envelope::default(),
                text: data.to_string(),
            })
        }

        "done" => {
            if data.trim().is_empty() || !looks_like_json(data) {
                return Some(StreamEvent::Done {
                    envelope: Envelope::default(),
                    usage: None,
                    response_time_ms: None,
                });
            }
            match parse(frame)? {
                Payload::Envelope(p) => Some(StreamEvent::Done {
                    envelope: p.envelope(),
                    usage: p.usage,
                    response_time_ms: p.response_time_ms,
                }),
                _ => Some(StreamEvent::Done {
                    envelope: Envelope::default(),
                    usage: None,
                    response_time_ms: None,
                }),
            }
        }

        "error" => {
            // A non-JSON error payload is the message itself
            let parsed = if looks_like_json(data) {
                serde_json::from_str::<Payload>(data).ok()
            } else {
                None
            };
            let (envelope, message) = match parsed {
                Some(Payload::Envelope(p)) => {
                    let message = p
                        .error
                        .clone()
                        .or_else(|| p.message.clone())
                        .unwrap_or_else(|| UNKNOWN_ERROR.to_string());
                    (p.envelope(), message)
                }
                Some(Payload::Label(message)) => (Envelope::default(), message),
                _ if data.trim().is_empty() => (Envelope::default(), UNKNOWN_ERROR.to_string()),
                _ => (Envelope::default(), data.to_string()),
            };
            Some(StreamEvent::Error { envelope, message })
        }

        other => Some(StreamEvent::Unknown {
            event: other.to_string(),
            data: frame.data.clone(),
        }),
    }
}

fn looks_like_json(data: &str) -> bool {
    matches!(data.trim_start().chars().next(), Some('{' | '[' | '"'))
}

fn parse(frame: &RawFrame) -> Option<Payload> {
    match serde_json::from_str::<Payload>(&frame.data) {
        Ok(payload) => Some(payload),
        Err(e) => {
            warn!(event = %frame.event, error = %e, "Dropping frame with malformed JSON payload");
            None
        }
    }
}

fn malformed(frame: &RawFrame, reason: &str) -> Option<StreamEvent> {
    warn!(event = %frame.event, reason, "Dropping frame with unexpected payload shape");
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn frame(event: &str, data: &str) -> RawFrame {
        RawFrame::new(event, data)
    }

    #[test]
    fn test_status_json_string() {
        let event = decode(&frame("status", "\"检索中\"")).unwrap();
        assert_eq!(
            event,
            StreamEvent::Status {
                envelope: Envelope::default(),
                stage: "检索中".to_string()
            }
        );
    }

    #[test]
    fn test_status_envelope_carries_ids() {
        let event = decode(&frame(
            "status",
            r#"{"type":"STATUS","conversationId":42,"messageId":97,"stage":"💡 正在生成回答..."}"#,
        ))
        .unwrap();
        assert_eq!(event.conversation_id(), Some(ConversationId(42)));
        assert_eq!(event.envelope().unwrap().message_id, Some(MessageId(97)));
        assert!(matches!(event, StreamEvent::Status { ref stage, .. } if stage.contains("生成")));
    }

    #[test]
    fn test_plain_text_status() {
        let event = decode(&frame("status", "正在处理您的问题...")).unwrap();
        assert!(matches!(event, StreamEvent::Status { ref stage, .. } if stage == "正在处理您的问题..."));
    }

    #[test]
    fn test_sentinel_is_distinct_variant() {
        let bare = decode(&frame("status", "\"__NEW_MESSAGE__\"")).unwrap();
        assert!(matches!(bare, StreamEvent::NewMessage { .. }));

        let wrapped = decode(&frame(
            "status",
            r#"{"conversationId":3,"stage":"__NEW_MESSAGE__"}"#,
        ))
        .unwrap();
        assert_eq!(
            wrapped,
            StreamEvent::NewMessage {
                envelope: Envelope {
                    conversation_id: Some(ConversationId(3)),
                    message_id: None
                }
            }
        );
    }

    #[test]
    fn test_sources_bare_and_wrapped() {
        let bare = decode(&frame("sources", r#"[{"docId":1,"title":"校历","content":"...","similarity":0.8}]"#)).unwrap();
        assert!(matches!(bare, StreamEvent::Sources { ref sources, .. } if sources.len() == 1));

        let wrapped = decode(&frame(
            "sources",
            r#"{"conversationId":9,"sources":[{"title":"a"},{"title":"b"}]}"#,
        ))
        .unwrap();
        assert_eq!(wrapped.conversation_id(), Some(ConversationId(9)));
        assert!(matches!(wrapped, StreamEvent::Sources { ref sources, .. } if sources.len() == 2));
    }

    #[test]
    fn test_content_plain_and_wrapped() {
        let plain = decode(&frame("content", "Hel")).unwrap();
        assert_eq!(
            plain,
            StreamEvent::Content {
                envelope: Envelope::default(),
                text: "Hel".to_string()
            }
        );

        let wrapped = decode(&frame(
            "content",
            r#"{"type":"CONTENT","conversationId":5,"content":" world"}"#,
        ))
        .unwrap();
        assert!(matches!(wrapped, StreamEvent::Content { ref text, .. } if text == " world"));
        assert_eq!(wrapped.conversation_id(), Some(ConversationId(5)));
    }

    #[test]
    fn test_content_that_is_not_envelope_stays_text() {
        let event = decode(&frame("content", "{x}")).unwrap();
        assert!(matches!(event, StreamEvent::Content { ref text, .. } if text == "{x}"));
    }

    #[test]
    fn test_done_with_usage() {
        let event = decode(&frame(
            "done",
            r#"{"type":"DONE","conversationId":1,"usage":{"promptTokens":10,"completionTokens":5,"totalTokens":15},"responseTimeMs":1200}"#,
        ))
        .unwrap();
        match event {
            StreamEvent::Done {
                usage,
                response_time_ms,
                ..
            } => {
                assert_eq!(usage.unwrap().total_tokens, 15);
                assert_eq!(response_time_ms, Some(1200));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_done_empty_object() {
        assert!(matches!(
            decode(&frame("done", "{}")),
            Some(StreamEvent::Done { usage: None, .. })
        ));
    }

    #[test]
    fn test_error_forms() {
        let wrapped = decode(&frame("error", r#"{"type":"ERROR","error":"upstream overloaded"}"#)).unwrap();
        assert!(matches!(wrapped, StreamEvent::Error { ref message, .. } if message == "upstream overloaded"));

        let message_field = decode(&frame("error", r#"{"message":"限流"}"#)).unwrap();
        assert!(matches!(message_field, StreamEvent::Error { ref message, .. } if message == "限流"));

        let raw = decode(&frame("error", "Internal Server Error")).unwrap();
        assert!(matches!(raw, StreamEvent::Error { ref message, .. } if message == "Internal Server Error"));

        let empty = decode(&frame("error", "{}")).unwrap();
        assert!(matches!(empty, StreamEvent::Error { ref message, .. } if message == UNKNOWN_ERROR));
    }

    #[test]
    fn test_malformed_json_dropped() {
        assert_eq!(decode(&frame("status", "{\"stage\": ")), None);
        assert_eq!(decode(&frame("sources", "[{")), None);
        assert_eq!(decode(&frame("done", "{oops}")), None);
    }

    #[test]
    fn test_unknown_forwarded() {
        let event = decode(&frame("heartbeat", "ping")).unwrap();
        assert_eq!(
            event,
            StreamEvent::Unknown {
                event: "heartbeat".to_string(),
                data: "ping".to_string()
            }
        );
        assert!(event.envelope().is_none());
    }
}
