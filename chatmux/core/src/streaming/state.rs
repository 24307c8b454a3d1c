//! Per-Conversation Stream State
//!
//! The mutable projection a UI renders while an answer is in flight: coarse
//! stage, human-readable status, accumulated text and citations.

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::cancel::AbortHandle;
use crate::error::StreamFailure;
use crate::messages::{MessageId, SourceDoc};

/// Status shown while the request is being issued
pub const SENDING_STATUS: &str = "正在发送...";

/// Coarse lifecycle label of an in-progress answer
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStage {
    /// Nothing in flight
    #[default]
    Idle,
    /// Request issued, nothing received yet
    Sending,
    /// Knowledge-base retrieval in progress
    Retrieving,
    /// Answer text is being generated
    Generating,
    /// Answer finished
    Done,
    /// Answer failed; cleared after the display window
    Error,
}

impl ProcessingStage {
    /// Map a free-text stage hint to a coarse stage
    ///
    /// Unmatched hints return `None` and leave the current stage unchanged.
    #[must_use]
    pub fn from_hint(hint: &str) -> Option<Self> {
        let lower = hint.to_lowercase();
        if lower.contains("检索") || lower.contains("retriev") || lower.contains("search") {
            Some(Self::Retrieving)
        } else if lower.contains("生成") || lower.contains("generat") {
            Some(Self::Generating)
        } else {
            None
        }
    }
}

/// Stream state for one conversation (or one pending conversation)
#[derive(Clone, Debug, Default)]
pub struct StreamState {
    /// Coarse stage
    pub processing_stage: ProcessingStage,
    /// Human-readable status line
    pub processing_status: String,
    /// Text accumulated since the last flush
    pub streaming_content: String,
    /// Server id of the BOT message being streamed
    pub streaming_message_id: Option<MessageId>,
    /// Current citation set, replaced wholesale on each update
    pub streaming_sources: Vec<SourceDoc>,
    /// Whether a request is in flight
    pub is_sending: bool,
    /// Whether the last stream delivered `done`
    pub done_received: bool,
    /// Last classified failure, kept for the display window
    pub last_error: Option<StreamFailure>,
    abort_handle: Option<AbortHandle>,
    error_until: Option<Instant>,
}

impl StreamState {
    /// Create an idle state
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter `sending` for a new request owned by `handle`
    pub fn begin_send(&mut self, handle: AbortHandle) {
        self.processing_stage = ProcessingStage::Sending;
        self.processing_status = SENDING_STATUS.to_string();
        self.streaming_content.clear();
        self.streaming_message_id = None;
        self.streaming_sources.clear();
        self.is_sending = true;
        self.done_received = false;
        self.last_error = None;
        self.error_until = None;
        self.abort_handle = Some(handle);
    }

    /// Apply a status label
    pub fn apply_status(&mut self, stage: &str) {
        self.processing_status = stage.to_string();
        if let Some(coarse) = ProcessingStage::from_hint(stage) {
            self.processing_stage = coarse;
        }
    }

    /// Append a content fragment
    pub fn append_content(&mut self, text: &str) {
        self.streaming_content.push_str(text);
        self.processing_stage = ProcessingStage::Generating;
    }

    /// Replace the citation set
    pub fn replace_sources(&mut self, sources: Vec<SourceDoc>) {
        self.streaming_sources = sources;
    }

    /// Take the accumulated text, leaving the accumulator empty
    pub fn take_content(&mut self) -> String {
        std::mem::take(&mut self.streaming_content)
    }

    /// Clear transient fields after `done` and return to idle
    ///
    /// The handle slot is cleared only if it still belongs to `owner`; a newer
    /// session on the same conversation keeps its handle.
    pub fn finish(&mut self, owner: &AbortHandle) {
        self.processing_stage = ProcessingStage::Done;
        self.done_received = true;
        self.clear_transient(owner);
        self.processing_stage = ProcessingStage::Idle;
    }

    /// Enter `error` until `until`, then [`expire_error`](Self::expire_error) resets it
    pub fn fail(&mut self, failure: StreamFailure, owner: &AbortHandle, until: Instant) {
        self.clear_transient(owner);
        self.processing_stage = ProcessingStage::Error;
        self.processing_status = failure.user_message();
        self.last_error = Some(failure);
        self.error_until = Some(until);
    }

    /// Silently return to idle after a cancellation
    pub fn reset(&mut self, owner: &AbortHandle) {
        self.clear_transient(owner);
        self.processing_stage = ProcessingStage::Idle;
        self.error_until = None;
    }

    /// Return to idle if the error display window has passed
    ///
    /// Returns `true` if the state changed.
    pub fn expire_error(&mut self, now: Instant) -> bool {
        match self.error_until {
            Some(until) if now >= until => {
                self.error_until = None;
                self.last_error = None;
                self.processing_stage = ProcessingStage::Idle;
                self.processing_status.clear();
                true
            }
            _ => false,
        }
    }

    /// When the error display window ends, if one is open
    #[must_use]
    pub fn error_deadline(&self) -> Option<Instant> {
        self.error_until
    }

    /// Handle of the newest request targeting this state
    #[must_use]
    pub fn abort_handle(&self) -> Option<&AbortHandle> {
        self.abort_handle.as_ref()
    }

    /// Cancel the newest request targeting this state, if still live
    pub fn cancel(&mut self) -> bool {
        self.abort_handle.as_ref().is_some_and(AbortHandle::cancel)
    }

    /// Whether every transient field is empty
    #[must_use]
    pub fn is_quiescent(&self) -> bool {
        self.processing_stage == ProcessingStage::Idle
            && self.streaming_content.is_empty()
            && self.streaming_sources.is_empty()
            && self.streaming_message_id.is_none()
            && !self.is_sending
            && self.abort_handle.is_none()
    }

    fn clear_transient(&mut self, owner: &AbortHandle) {
        self.processing_status.clear();
        self.streaming_content.clear();
        self.streaming_message_id = None;
        self.streaming_sources.clear();
        if self
            .abort_handle
            .as_ref()
            .is_some_and(|h| h.same_as(owner))
        {
            self.abort_handle = None;
            self.is_sending = false;
        }
    }
}
