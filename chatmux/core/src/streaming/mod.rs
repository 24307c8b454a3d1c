//! Streaming Infrastructure for Concurrent Conversations
//!
//! Per-session request handling and the per-conversation state it mutates.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                     SessionMultiplexer                         │
//! │                                                                │
//! │  ┌───────────────┐  ┌───────────────┐                          │
//! │  │ StreamSession │  │ StreamSession │  ...   (one per send)    │
//! │  │  (session A)  │  │  (session B)  │                          │
//! │  └───────┬───────┘  └───────┬───────┘                          │
//! │          │ SessionMessage   │                                  │
//! │          └────────┬─────────┘                                  │
//! │                   ▼                                            │
//! │            dispatch() ──► StreamHandler ──► StreamState        │
//! │                                            (per conversation)  │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! - **No cross-talk**: a session only ever touches the state its
//!   [`StateKey`](crate::registry::StateKey) points at
//! - **In-order delivery**: one reader task per session, one channel, one
//!   consumer
//! - **Silent cancellation**: an aborted session resets its state without
//!   reporting an error

mod session;
mod state;

pub use session::{
    SessionEvent, SessionMessage, SessionOutcome, SessionStats, StreamHandler, StreamSession,
    CLOSED_EARLY,
};
pub use state::{ProcessingStage, StreamState, SENDING_STATUS};
