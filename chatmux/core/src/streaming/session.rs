//! Stream Sessions
//!
//! One [`StreamSession`] per sent message. The session spawns a reader task
//! that opens the transport, feeds bytes through an [`EventFrameParser`] and
//! forwards decoded events over a shared channel. The reader never touches
//! conversation state: the owner of the channel calls
//! [`StreamSession::dispatch`] for each message, which drives a
//! [`StreamHandler`] in arrival order.
//!
//! ```text
//!  reader task (per session)            owner (single context)
//!  ┌──────────────────────────┐         ┌───────────────────────────┐
//!  │ transport.open()         │         │ rx.recv()                 │
//!  │ bytes -> parser -> decode│──mpsc──►│ sessions[id].dispatch()   │
//!  │ send SessionMessage      │         │   -> StreamHandler        │
//!  └──────────────────────────┘         └───────────────────────────┘
//! ```
//!
//! Once a session is cancelled or has reached a terminal event, every further
//! message for it is dropped.

use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::cancel::AbortHandle;
use crate::error::StreamFailure;
use crate::events::{decode, Envelope, StreamEvent};
use crate::frame::{EventFrameParser, RawFrame};
use crate::messages::{ConversationId, MessageId, SessionId, SourceDoc, TokenUsage};
use crate::registry::StateKey;
use crate::transport::{StreamRequest, Transport};

/// Detail reported when the body ends with nothing to finalize
pub const CLOSED_EARLY: &str = "stream closed before completion";

/// What a reader task reports
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    /// A decoded protocol event
    Frame(StreamEvent),
    /// The transport failed (open, status, or mid-body)
    Failed(StreamFailure),
    /// The body ended cleanly
    Closed,
}

/// A [`SessionEvent`] tagged with the session that produced it
#[derive(Clone, Debug, PartialEq)]
pub struct SessionMessage {
    /// Producing session
    pub session_id: SessionId,
    /// Payload
    pub event: SessionEvent,
}

impl SessionMessage {
    /// Create a message
    #[must_use]
    pub fn new(session_id: SessionId, event: SessionEvent) -> Self {
        Self { session_id, event }
    }
}

/// Whether a session keeps running after a dispatch
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionOutcome {
    /// More events expected
    Continue,
    /// Terminal: done, failed, or cancelled
    Finished,
}

/// Callbacks driven by [`StreamSession::dispatch`]
///
/// Exactly one of `on_done`, `on_error` or `on_cancelled` is called per
/// session, and nothing is called after it.
pub trait StreamHandler {
    /// First server-confirmed conversation id for a session started without one
    fn on_conversation_id(&mut self, id: ConversationId);

    /// Progress label
    fn on_status(&mut self, envelope: &Envelope, stage: &str);

    /// Start a new answer within the same exchange
    fn on_new_message(&mut self, envelope: &Envelope);

    /// Complete current citation set
    fn on_sources(&mut self, envelope: &Envelope, sources: Vec<SourceDoc>);

    /// Text fragment
    fn on_content(&mut self, envelope: &Envelope, text: &str);

    /// Answer finished
    fn on_done(
        &mut self,
        envelope: &Envelope,
        usage: Option<TokenUsage>,
        response_time_ms: Option<u64>,
    );

    /// Reportable failure
    fn on_error(&mut self, failure: StreamFailure);

    /// The session was cancelled; not a failure
    fn on_cancelled(&mut self);

    /// Whether text has accumulated that an unterminated stream should keep
    fn has_partial_content(&self) -> bool;
}

/// Counters for one session
#[derive(Clone, Debug)]
pub struct SessionStats {
    /// When the session was started
    pub started_at: Instant,
    /// Events dispatched so far
    pub events_received: u64,
    /// When the last event was dispatched
    pub last_event_at: Option<Instant>,
}

/// One in-flight request
#[derive(Debug)]
pub struct StreamSession {
    id: SessionId,
    target: StateKey,
    round_id: MessageId,
    conversation_id: Option<ConversationId>,
    handle: AbortHandle,
    stats: SessionStats,
    finished: bool,
}

impl StreamSession {
    /// Start the reader task and return the session record
    ///
    /// `conversation_id` is the id the request targets, if known; a session
    /// started without one binds to the first id the server reports.
    #[must_use]
    pub fn spawn(
        id: SessionId,
        target: StateKey,
        round_id: MessageId,
        handle: AbortHandle,
        transport: Arc<dyn Transport>,
        request: StreamRequest,
        events: mpsc::Sender<SessionMessage>,
    ) -> Self {
        let conversation_id = request.conversation_id;
        let task = tokio::spawn(read_stream(id, transport, request, events));
        handle.attach(task.abort_handle());

        Self {
            id,
            target,
            round_id,
            conversation_id,
            handle,
            stats: SessionStats {
                started_at: Instant::now(),
                events_received: 0,
                last_event_at: None,
            },
            finished: false,
        }
    }

    /// Session id
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Where this session's state and messages live
    #[must_use]
    pub fn target(&self) -> StateKey {
        self.target
    }

    /// Re-point the session after its pending slot migrated
    pub fn set_target(&mut self, target: StateKey) {
        self.target = target;
    }

    /// Id of the USER message that opened this exchange
    #[must_use]
    pub fn round_id(&self) -> MessageId {
        self.round_id
    }

    /// Conversation this session is bound to, once known
    #[must_use]
    pub fn conversation_id(&self) -> Option<ConversationId> {
        self.conversation_id
    }

    /// Cancellation handle
    #[must_use]
    pub fn handle(&self) -> &AbortHandle {
        &self.handle
    }

    /// Counters
    #[must_use]
    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Whether a terminal callback has been delivered
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Deliver one reader message to `handler`
    pub fn dispatch<H: StreamHandler + ?Sized>(
        &mut self,
        event: SessionEvent,
        handler: &mut H,
    ) -> SessionOutcome {
        if self.finished {
            return SessionOutcome::Finished;
        }
        if self.handle.is_cancelled() {
            return self.cancelled(handler);
        }

        self.stats.events_received += 1;
        self.stats.last_event_at = Some(Instant::now());

        match event {
            SessionEvent::Frame(event) => self.dispatch_event(event, handler),
            SessionEvent::Failed(failure) => self.fail(failure, handler),
            SessionEvent::Closed => {
                if handler.has_partial_content() {
                    debug!(session = %self.id, "Stream ended without done, finalizing");
                    self.done(&Envelope::default(), None, None, handler)
                } else {
                    self.fail(StreamFailure::new(None, CLOSED_EARLY), handler)
                }
            }
        }
    }

    /// Deliver the cancellation callback if the handle was cancelled elsewhere
    pub fn reap<H: StreamHandler + ?Sized>(&mut self, handler: &mut H) -> SessionOutcome {
        if !self.finished && self.handle.is_cancelled() {
            self.cancelled(handler)
        } else if self.finished {
            SessionOutcome::Finished
        } else {
            SessionOutcome::Continue
        }
    }

    fn dispatch_event<H: StreamHandler + ?Sized>(
        &mut self,
        event: StreamEvent,
        handler: &mut H,
    ) -> SessionOutcome {
        if let Some(id) = event.conversation_id() {
            match self.conversation_id {
                None => {
                    self.conversation_id = Some(id);
                    handler.on_conversation_id(id);
                }
                Some(bound) if bound != id => {
                    warn!(
                        session = %self.id,
                        bound = %bound,
                        received = %id,
                        "Conversation id changed mid-stream"
                    );
                    return self.fail(
                        StreamFailure::protocol(format!(
                            "conversation id changed from {bound} to {id}"
                        )),
                        handler,
                    );
                }
                Some(_) => {}
            }
        }

        match event {
            StreamEvent::Status { envelope, stage } => handler.on_status(&envelope, &stage),
            StreamEvent::NewMessage { envelope } => handler.on_new_message(&envelope),
            StreamEvent::Sources { envelope, sources } => handler.on_sources(&envelope, sources),
            StreamEvent::Content { envelope, text } => handler.on_content(&envelope, &text),
            StreamEvent::Done {
                envelope,
                usage,
                response_time_ms,
            } => return self.done(&envelope, usage, response_time_ms, handler),
            StreamEvent::Error { message, .. } => {
                return self.fail(StreamFailure::new(None, message), handler)
            }
            StreamEvent::Unknown { event, .. } => {
                debug!(session = %self.id, event = %event, "Ignoring unknown event type");
            }
        }
        SessionOutcome::Continue
    }

    fn done<H: StreamHandler + ?Sized>(
        &mut self,
        envelope: &Envelope,
        usage: Option<TokenUsage>,
        response_time_ms: Option<u64>,
        handler: &mut H,
    ) -> SessionOutcome {
        // A new chat that never learned its id has nowhere to keep the answer
        if self.conversation_id.is_none() {
            return self.fail(
                StreamFailure::protocol("stream finished without a conversation id"),
                handler,
            );
        }
        self.finished = true;
        if self.handle.complete() {
            handler.on_done(envelope, usage, response_time_ms);
        } else {
            handler.on_cancelled();
        }
        SessionOutcome::Finished
    }

    fn fail<H: StreamHandler + ?Sized>(
        &mut self,
        failure: StreamFailure,
        handler: &mut H,
    ) -> SessionOutcome {
        self.finished = true;
        // A failure racing a cancel is the cancel's abort, not an error
        if self.handle.complete() {
            warn!(session = %self.id, kind = ?failure.kind, detail = %failure.detail, "Stream failed");
            handler.on_error(failure);
        } else {
            handler.on_cancelled();
        }
        SessionOutcome::Finished
    }

    fn cancelled<H: StreamHandler + ?Sized>(&mut self, handler: &mut H) -> SessionOutcome {
        self.finished = true;
        debug!(session = %self.id, "Session cancelled");
        handler.on_cancelled();
        SessionOutcome::Finished
    }
}

/// Reader task: transport bytes to decoded events on the channel
async fn read_stream(
    session_id: SessionId,
    transport: Arc<dyn Transport>,
    request: StreamRequest,
    events: mpsc::Sender<SessionMessage>,
) {
    let send = |event| events.send(SessionMessage::new(session_id, event));

    let mut stream = match transport.open(&request).await {
        Ok(stream) => stream,
        Err(e) => {
            let _ = send(SessionEvent::Failed(StreamFailure::from(&e))).await;
            return;
        }
    };

    let mut parser = EventFrameParser::new();
    while let Some(chunk) = stream.next().await {
        let bytes = match chunk {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = send(SessionEvent::Failed(StreamFailure::from(&e))).await;
                return;
            }
        };

        for frame in parser.feed(&bytes) {
            if let Some(event) = decode_frame(session_id, &frame) {
                if send(SessionEvent::Frame(event)).await.is_err() {
                    // Receiver dropped, stop streaming
                    return;
                }
            }
        }
    }

    if let Some(event) = parser.finish().and_then(|f| decode_frame(session_id, &f)) {
        if send(SessionEvent::Frame(event)).await.is_err() {
            return;
        }
    }
    let _ = send(SessionEvent::Closed).await;
}

fn decode_frame(session_id: SessionId, frame: &RawFrame) -> Option<StreamEvent> {
    let event = decode(frame)?;
    debug!(session = %session_id, kind = event.kind(), "Frame decoded");
    Some(event)
}
