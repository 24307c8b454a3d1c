//! chatmux Core - Streaming Session Multiplexer for Concurrent Chats
//!
//! This crate lets one client hold many chat conversations at once, each
//! answered by a server that streams its reply as `text/event-stream` frames.
//! It is independent of any UI: a terminal front-end, a GUI or a test harness
//! drives the same [`SessionMultiplexer`].
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          UI / CLI                                 │
//! │        start_stream / cancel_stream / next_update / ...          │
//! └───────────────────────────────┬──────────────────────────────────┘
//!                                 │
//! ┌───────────────────────────────┼──────────────────────────────────┐
//! │                      SessionMultiplexer                           │
//! │  ┌───────────────────────────┐   ┌─────────────────────────────┐  │
//! │  │   ConversationRegistry    │   │  StreamSession (per send)   │  │
//! │  │ conversations / messages  │◄──│  AbortHandle, dispatch()    │  │
//! │  │ StreamState / pending     │   └──────────────┬──────────────┘  │
//! │  └───────────────────────────┘                  │ mpsc            │
//! │                                  ┌──────────────┴──────────────┐  │
//! │                                  │ reader task: Transport ->   │  │
//! │                                  │ EventFrameParser -> decode  │  │
//! │                                  └─────────────────────────────┘  │
//! └───────────────────────────────────────────────────────────────────┘
//!            │                                        │
//!      ChatStore (REST)                        Transport (SSE)
//! ```
//!
//! # Key Types
//!
//! - [`SessionMultiplexer`]: composition root and the only mutator of state
//! - [`ConversationRegistry`]: conversations, message lists, stream states,
//!   pending-conversation migration
//! - [`StreamSession`]: one request's lifecycle and its [`AbortHandle`]
//! - [`StreamState`]: what the UI renders for an in-flight answer
//! - [`EventFrameParser`]: bytes to `(event, data)` frames
//! - [`Transport`] / [`ChatStore`]: network collaborators, with reqwest
//!   implementations [`HttpTransport`] and [`HttpChatStore`]
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use chatmux_core::{config, HttpChatStore, HttpTransport, SessionMultiplexer};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = config::load_config()?;
//!     let transport = Arc::new(HttpTransport::from_config(&config)?);
//!     let store = Arc::new(HttpChatStore::from_config(&config)?);
//!     let mut mux = SessionMultiplexer::new(config, transport, store);
//!
//!     mux.start_stream("图书馆几点开门？", None)?;
//!     while mux.active_count() > 0 {
//!         for update in mux.next_update().await {
//!             println!("{update:?}");
//!         }
//!     }
//!     Ok(())
//! }
//! ```

#![deny(missing_docs)]

pub mod cancel;
pub mod config;
pub mod error;
pub mod events;
pub mod frame;
pub mod messages;
pub mod multiplexer;
pub mod registry;
pub mod store;
pub mod streaming;
pub mod transport;

pub use cancel::{AbortHandle, HandleState};
pub use config::{ConfigError, MuxConfig};
pub use error::{FailureKind, MuxError, StoreError, StreamFailure, TransportError};
pub use events::{decode, Envelope, StreamEvent, NEW_MESSAGE_SENTINEL};
pub use frame::{EventFrameParser, RawFrame};
pub use messages::{
    Conversation, ConversationId, Message, MessageId, MessageMetadata, SenderRole, SessionId,
    SourceDoc, TokenUsage,
};
pub use multiplexer::{SessionMultiplexer, StreamUpdate, UpdateKind};
pub use registry::{reconcile_rounds, ConversationRegistry, StateKey};
pub use store::{ChatStore, HttpChatStore};
pub use streaming::{ProcessingStage, StreamHandler, StreamSession, StreamState};
pub use transport::{ByteStream, HttpTransport, StreamRequest, Transport};
