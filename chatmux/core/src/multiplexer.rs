//! Session Multiplexer
//!
//! Composition root: owns the [`ConversationRegistry`], the live
//! [`StreamSession`]s and the channel their reader tasks report on.
//!
//! # Concurrency
//!
//! Reader tasks run in parallel but never touch conversation state. Every
//! mutation happens in `&mut self` methods on whichever task owns the
//! multiplexer, one [`SessionMessage`] at a time, so no lock guards any
//! conversation. A UI loop drives it like this:
//!
//! ```ignore
//! let session = mux.start_stream("奖学金怎么申请", None)?;
//! loop {
//!     for update in mux.next_update().await {
//!         render(&mux, &update);
//!     }
//! }
//! ```
//!
//! Cancellation is per conversation (or per session). Only two things cancel
//! implicitly: a new send on a conversation replaces the session already
//! streaming there, and [`SessionMultiplexer::clear_all`] cancels everything.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cancel::AbortHandle;
use crate::config::MuxConfig;
use crate::error::{MuxError, StreamFailure};
use crate::events::Envelope;
use crate::messages::{
    Conversation, ConversationId, Message, MessageId, MessageMetadata, SessionId, SourceDoc,
    TokenUsage,
};
use crate::registry::{ConversationRegistry, StateKey, PENDING_CONVERSATION};
use crate::store::{ChatStore, DEFAULT_TITLE};
use crate::streaming::{
    ProcessingStage, SessionMessage, SessionOutcome, StreamHandler, StreamSession, StreamState,
};
use crate::transport::{StreamRequest, Transport};

// ============================================================================
// Updates
// ============================================================================

/// Something observable changed because of a session
#[derive(Clone, Debug)]
pub struct StreamUpdate {
    /// Session that caused the change
    pub session_id: SessionId,
    /// State and message list that changed
    pub key: StateKey,
    /// What changed
    pub kind: UpdateKind,
    /// When the change was applied
    pub timestamp: Instant,
}

/// Kind of [`StreamUpdate`]
#[derive(Clone, Debug, PartialEq)]
pub enum UpdateKind {
    /// The pending slot moved under a server-assigned id (`key` is the new one)
    Migrated {
        /// Assigned id
        conversation_id: ConversationId,
    },
    /// Stage or status line changed
    Status {
        /// Coarse stage
        stage: ProcessingStage,
        /// Status line
        status: String,
    },
    /// Citation set replaced
    Sources {
        /// Number of sources now attached
        count: usize,
    },
    /// Text fragment appended
    Content {
        /// The fragment
        text: String,
    },
    /// A BOT message was materialized
    MessageFinalized {
        /// Its id
        message_id: MessageId,
        /// Flushed by a mid-stream split rather than by `done`
        intermediate: bool,
    },
    /// The session completed normally
    Finished,
    /// The session failed; the state shows the error until its window passes
    Failed {
        /// Classified failure
        failure: StreamFailure,
    },
    /// The session was cancelled and its state reset
    Cancelled,
}

// ============================================================================
// Dispatch
// ============================================================================

/// Applies one session's callbacks to the registry
struct SessionDispatch<'a> {
    registry: &'a mut ConversationRegistry,
    session_id: SessionId,
    key: StateKey,
    round_id: MessageId,
    handle: AbortHandle,
    error_until: Instant,
    updates: Vec<StreamUpdate>,
}

impl<'a> SessionDispatch<'a> {
    fn new(
        registry: &'a mut ConversationRegistry,
        session: &StreamSession,
        error_display: Duration,
    ) -> Self {
        Self {
            registry,
            session_id: session.id(),
            key: session.target(),
            round_id: session.round_id(),
            handle: session.handle().clone(),
            error_until: Instant::now() + error_display,
            updates: Vec::new(),
        }
    }

    fn emit(&mut self, kind: UpdateKind) {
        self.updates.push(StreamUpdate {
            session_id: self.session_id,
            key: self.key,
            kind,
            timestamp: Instant::now(),
        });
    }

    fn conversation_id(&self) -> ConversationId {
        match self.key {
            StateKey::Conversation(id) => id,
            StateKey::Pending(_) => PENDING_CONVERSATION,
        }
    }

    fn track_message_id(&mut self, envelope: &Envelope) {
        if let (Some(id), Some(state)) = (envelope.message_id, self.registry.state_mut(self.key)) {
            state.streaming_message_id = Some(id);
        }
    }

    fn emit_status(&mut self) {
        if let Some(state) = self.registry.state(self.key) {
            let kind = UpdateKind::Status {
                stage: state.processing_stage,
                status: state.processing_status.clone(),
            };
            self.emit(kind);
        }
    }

    /// Materialize the accumulated text as a BOT message
    fn flush(&mut self, metadata: MessageMetadata, intermediate: bool) -> Option<MessageId> {
        let state = self.registry.state_mut(self.key)?;
        let content = state.take_content();
        if content.is_empty() {
            return None;
        }
        // An intermediate part keeps the id it was streamed under
        let id = state
            .streaming_message_id
            .take()
            .unwrap_or_else(MessageId::local);

        let mut message = Message::bot(id, self.conversation_id(), self.round_id, content, metadata);
        message.animate = !intermediate;
        self.registry.push_bot_message(self.key, message);
        if let StateKey::Conversation(conv) = self.key {
            self.registry.refresh_message_count(conv);
        }

        self.emit(UpdateKind::MessageFinalized {
            message_id: id,
            intermediate,
        });
        Some(id)
    }
}

impl StreamHandler for SessionDispatch<'_> {
    fn on_conversation_id(&mut self, id: ConversationId) {
        if let StateKey::Pending(session) = self.key {
            if self.registry.migrate_pending(session, id) {
                self.key = StateKey::Conversation(id);
                self.emit(UpdateKind::Migrated {
                    conversation_id: id,
                });
            }
        }
    }

    fn on_status(&mut self, envelope: &Envelope, stage: &str) {
        self.track_message_id(envelope);
        if let Some(state) = self.registry.state_mut(self.key) {
            state.apply_status(stage);
        }
        self.emit_status();
    }

    fn on_new_message(&mut self, envelope: &Envelope) {
        debug!(session = %self.session_id, "Splitting answer into a new message");
        let metadata = MessageMetadata {
            is_intermediate: true,
            ..MessageMetadata::default()
        };
        self.flush(metadata, true);
        self.track_message_id(envelope);
    }

    fn on_sources(&mut self, envelope: &Envelope, sources: Vec<SourceDoc>) {
        self.track_message_id(envelope);
        let count = sources.len();
        if let Some(state) = self.registry.state_mut(self.key) {
            state.replace_sources(sources);
        }
        self.emit(UpdateKind::Sources { count });
    }

    fn on_content(&mut self, envelope: &Envelope, text: &str) {
        self.track_message_id(envelope);
        if let Some(state) = self.registry.state_mut(self.key) {
            state.append_content(text);
        }
        self.emit(UpdateKind::Content {
            text: text.to_string(),
        });
    }

    fn on_done(
        &mut self,
        envelope: &Envelope,
        usage: Option<TokenUsage>,
        response_time_ms: Option<u64>,
    ) {
        self.track_message_id(envelope);
        let sources = self
            .registry
            .state(self.key)
            .map(|s| s.streaming_sources.clone())
            .unwrap_or_default();
        let metadata = MessageMetadata {
            sources,
            usage,
            response_time_ms,
            ..MessageMetadata::default()
        };
        self.flush(metadata, false);

        if let Some(state) = self.registry.state_mut(self.key) {
            state.finish(&self.handle);
        }
        info!(session = %self.session_id, key = %self.key, "Stream finished");
        self.emit(UpdateKind::Finished);
    }

    fn on_error(&mut self, failure: StreamFailure) {
        self.registry.rollback_round(self.key, self.round_id);
        if let StateKey::Conversation(conv) = self.key {
            self.registry.refresh_message_count(conv);
        }
        if let Some(state) = self.registry.state_mut(self.key) {
            state.fail(failure.clone(), &self.handle, self.error_until);
        }
        self.emit(UpdateKind::Failed { failure });
    }

    fn on_cancelled(&mut self) {
        if let Some(state) = self.registry.state_mut(self.key) {
            state.reset(&self.handle);
        }
        info!(session = %self.session_id, key = %self.key, "Stream cancelled");
        self.emit(UpdateKind::Cancelled);
    }

    fn has_partial_content(&self) -> bool {
        self.registry
            .state(self.key)
            .is_some_and(|s| !s.streaming_content.is_empty())
    }
}

// ============================================================================
// Multiplexer
// ============================================================================

/// Coordinates concurrent stream sessions over one registry
pub struct SessionMultiplexer {
    config: MuxConfig,
    transport: Arc<dyn Transport>,
    store: Arc<dyn ChatStore>,
    registry: ConversationRegistry,
    sessions: HashMap<SessionId, StreamSession>,
    events_tx: mpsc::Sender<SessionMessage>,
    events_rx: mpsc::Receiver<SessionMessage>,
    /// Updates produced outside a poll, returned by the next one
    deferred: Vec<StreamUpdate>,
    total_sessions_started: u64,
}

impl std::fmt::Debug for SessionMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionMultiplexer")
            .field("transport", &self.transport.name())
            .field("sessions", &self.sessions.len())
            .field("conversations", &self.registry.conversations().len())
            .finish_non_exhaustive()
    }
}

impl SessionMultiplexer {
    /// Create a multiplexer over the given collaborators
    pub fn new(config: MuxConfig, transport: Arc<dyn Transport>, store: Arc<dyn ChatStore>) -> Self {
        let (events_tx, events_rx) = mpsc::channel(config.channel_capacity.max(1));
        Self {
            registry: ConversationRegistry::new(config.title_max_chars),
            config,
            transport,
            store,
            sessions: HashMap::new(),
            events_tx,
            events_rx,
            deferred: Vec::new(),
            total_sessions_started: 0,
        }
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &MuxConfig {
        &self.config
    }

    // ========================================================================
    // Streaming verbs
    // ========================================================================

    /// Send `text` and start streaming the answer
    ///
    /// With `conversation_id = None` the answer opens a new conversation; its
    /// messages and state live in a pending slot until the server reports the
    /// assigned id. The new conversation (or pending slot) becomes current.
    ///
    /// A session already streaming into the same conversation is cancelled
    /// first, so each state has one live handle; its `Cancelled` update is
    /// returned by the next poll.
    ///
    /// Must be called from within a Tokio runtime; the reader task is spawned
    /// on it.
    ///
    /// # Errors
    ///
    /// [`MuxError::EmptyMessage`] for blank text, [`MuxError::TooManyStreams`]
    /// when the session cap is reached.
    pub fn start_stream(
        &mut self,
        text: &str,
        conversation_id: Option<ConversationId>,
    ) -> Result<SessionId, MuxError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(MuxError::EmptyMessage);
        }
        if let Some(id) = conversation_id {
            let displaced = self.displace(StateKey::Conversation(id));
            self.deferred.extend(displaced);
        }

        let max = self.config.max_concurrent_streams;
        if self.sessions.len() >= max {
            warn!(max, "Refusing stream: concurrent session cap reached");
            return Err(MuxError::TooManyStreams { max });
        }

        let session_id = SessionId::new();
        let key = match conversation_id {
            Some(id) => {
                self.registry.get_or_create_messages(id);
                self.registry.get_or_create_state(id);
                StateKey::Conversation(id)
            }
            None => {
                self.registry.open_pending(session_id, text);
                StateKey::Pending(session_id)
            }
        };

        let user = Message::user(conversation_id.unwrap_or(PENDING_CONVERSATION), text);
        let round_id = user.id;
        self.registry.push_message(key, user);

        let handle = AbortHandle::new();
        if let Some(state) = self.registry.state_mut(key) {
            state.begin_send(handle.clone());
        }
        self.registry.set_current(Some(key));

        let session = StreamSession::spawn(
            session_id,
            key,
            round_id,
            handle,
            Arc::clone(&self.transport),
            StreamRequest::new(text, conversation_id),
            self.events_tx.clone(),
        );
        self.sessions.insert(session_id, session);
        self.total_sessions_started += 1;

        info!(
            session = %session_id,
            key = %key,
            transport = self.transport.name(),
            active = self.sessions.len(),
            "Stream started"
        );
        Ok(session_id)
    }

    /// Cancel every live session on a conversation
    ///
    /// `None` targets the current view. Returns the updates for the sessions
    /// that were cancelled (empty if none was live).
    pub fn cancel_stream(&mut self, conversation_id: Option<ConversationId>) -> Vec<StreamUpdate> {
        let key = match conversation_id {
            Some(id) => Some(StateKey::Conversation(id)),
            None => self.registry.current(),
        };
        let Some(key) = key else {
            return Vec::new();
        };

        for session in self.sessions.values().filter(|s| s.target() == key) {
            session.handle().cancel();
        }
        self.reap_cancelled()
    }

    /// Cancel one session
    pub fn cancel_session(&mut self, session_id: SessionId) -> Vec<StreamUpdate> {
        match self.sessions.get(&session_id) {
            Some(session) => {
                session.handle().cancel();
                self.reap_cancelled()
            }
            None => Vec::new(),
        }
    }

    /// Leave the current view
    ///
    /// Sessions keep streaming in the background. A pending slot with no live
    /// session left is dropped.
    pub fn clear_conversation(&mut self) {
        if let Some(StateKey::Pending(session)) = self.registry.current() {
            if !self.sessions.contains_key(&session) {
                self.registry.discard_pending(session);
            }
        }
        self.registry.set_current(None);
    }

    /// Cancel every live session and drop all state (logout)
    pub fn clear_all(&mut self) {
        let cancelled = self
            .sessions
            .values()
            .filter(|s| s.handle().cancel())
            .count();
        self.sessions.clear();
        self.deferred.clear();
        self.registry.clear();
        while self.events_rx.try_recv().is_ok() {}
        info!(cancelled, "Cleared all conversations");
    }

    /// Apply every message already queued, without waiting
    pub fn poll_all(&mut self) -> Vec<StreamUpdate> {
        let mut updates = std::mem::take(&mut self.deferred);
        updates.extend(self.reap_cancelled());
        while let Ok(message) = self.events_rx.try_recv() {
            updates.extend(self.handle_message(message));
        }
        self.expire_error_windows(Instant::now());
        updates
    }

    /// Wait until something changes
    ///
    /// Returns as soon as at least one update was applied or an error window
    /// closed. Returns an empty batch immediately when no session is live and
    /// no error window is open.
    pub async fn next_update(&mut self) -> Vec<StreamUpdate> {
        loop {
            let updates = self.poll_all();
            if !updates.is_empty() {
                return updates;
            }

            let deadline = self.registry.next_error_deadline();
            if self.sessions.is_empty() && deadline.is_none() {
                return Vec::new();
            }

            let sleep = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at.into()).await,
                    None => std::future::pending().await,
                }
            };

            let received = tokio::select! {
                message = self.events_rx.recv() => message,
                () = sleep => None,
            };

            let mut updates = match received {
                Some(message) => self.handle_message(message),
                None => Vec::new(),
            };
            updates.extend(self.poll_all());
            if !updates.is_empty() || deadline.is_some_and(|at| Instant::now() >= at) {
                return updates;
            }
        }
    }

    /// Return every error window that closed by `now` to idle
    pub fn expire_error_windows(&mut self, now: Instant) -> usize {
        let expired = self.registry.expire_error_windows(now);
        if expired > 0 {
            debug!(expired, "Error windows closed");
        }
        expired
    }

    fn handle_message(&mut self, message: SessionMessage) -> Vec<StreamUpdate> {
        let Some(session) = self.sessions.get_mut(&message.session_id) else {
            debug!(session = %message.session_id, "Dropping event for finished session");
            return Vec::new();
        };

        let mut dispatch =
            SessionDispatch::new(&mut self.registry, session, self.config.error_display());
        let outcome = session.dispatch(message.event, &mut dispatch);
        session.set_target(dispatch.key);
        let updates = dispatch.updates;

        if outcome == SessionOutcome::Finished {
            self.sessions.remove(&message.session_id);
        }
        updates
    }

    /// Cancel and reap every live session streaming into `key`
    fn displace(&mut self, key: StateKey) -> Vec<StreamUpdate> {
        let mut displaced = 0;
        for session in self.sessions.values().filter(|s| s.target() == key) {
            session.handle().cancel();
            displaced += 1;
        }
        if displaced == 0 {
            return Vec::new();
        }
        info!(key = %key, displaced, "Replacing live stream with a new send");
        self.reap_cancelled()
    }

    fn reap_cancelled(&mut self) -> Vec<StreamUpdate> {
        let cancelled: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|s| s.handle().is_cancelled())
            .map(StreamSession::id)
            .collect();

        let mut updates = Vec::new();
        for id in cancelled {
            if let Some(mut session) = self.sessions.remove(&id) {
                let mut dispatch =
                    SessionDispatch::new(&mut self.registry, &session, self.config.error_display());
                session.reap(&mut dispatch);
                updates.extend(dispatch.updates);
            }
        }
        updates
    }

    // ========================================================================
    // Store verbs
    // ========================================================================

    /// Replace the conversation list with one page from the store
    ///
    /// # Errors
    ///
    /// The store error; the list is left unchanged.
    pub async fn fetch_conversations(&mut self, page: u32, size: u32) -> Result<(), MuxError> {
        let conversations = self.store.list_conversations(page, size).await?;
        debug!(count = conversations.len(), page, "Fetched conversations");
        self.registry.set_conversations(conversations);
        Ok(())
    }

    /// Create a conversation and make it current
    ///
    /// # Errors
    ///
    /// The store error.
    pub async fn create_conversation(
        &mut self,
        title: Option<&str>,
    ) -> Result<Conversation, MuxError> {
        let conversation = self
            .store
            .create_conversation(title.unwrap_or(DEFAULT_TITLE))
            .await?;
        let id = conversation.id;
        self.registry.insert_front(conversation.clone());
        self.registry.get_or_create_messages(id);
        self.registry.get_or_create_state(id);
        self.registry.set_current(Some(StateKey::Conversation(id)));
        info!(conversation_id = %id, "Created conversation");
        Ok(conversation)
    }

    /// Make a listed conversation current, fetching its history if not cached
    ///
    /// # Errors
    ///
    /// [`MuxError::UnknownConversation`] if it is not listed, or the store
    /// error from the history fetch.
    pub async fn select_conversation(&mut self, id: ConversationId) -> Result<(), MuxError> {
        if self.registry.conversation(id).is_none() {
            return Err(MuxError::UnknownConversation(id));
        }
        self.registry.set_current(Some(StateKey::Conversation(id)));
        self.registry.get_or_create_state(id);
        if !self.registry.has_messages(id) {
            self.fetch_messages(id).await?;
        }
        Ok(())
    }

    /// Refetch a conversation's history and reconcile its rounds
    ///
    /// # Errors
    ///
    /// The store error; the cached history is left unchanged.
    pub async fn fetch_messages(&mut self, id: ConversationId) -> Result<(), MuxError> {
        let messages = self.store.fetch_messages(id).await?;
        debug!(conversation_id = %id, count = messages.len(), "Fetched messages");
        self.registry.set_messages(id, messages);
        Ok(())
    }

    /// Change a conversation's title
    ///
    /// # Errors
    ///
    /// The store error.
    pub async fn rename_conversation(
        &mut self,
        id: ConversationId,
        title: &str,
    ) -> Result<(), MuxError> {
        self.store.rename_conversation(id, title).await?;
        self.registry.rename(id, title);
        Ok(())
    }

    /// Delete a conversation, cancelling its live sessions
    ///
    /// # Errors
    ///
    /// The store error; nothing is cancelled or removed in that case.
    pub async fn delete_conversation(&mut self, id: ConversationId) -> Result<(), MuxError> {
        self.store.delete_conversation(id).await?;
        self.cancel_stream(Some(id));
        self.registry.remove(id);
        info!(conversation_id = %id, "Deleted conversation");
        Ok(())
    }

    // ========================================================================
    // Read-only projections
    // ========================================================================

    /// Conversation list in display order
    #[must_use]
    pub fn conversations(&self) -> &[Conversation] {
        self.registry.conversations()
    }

    /// Message list under `key`
    #[must_use]
    pub fn messages(&self, key: StateKey) -> &[Message] {
        self.registry.messages(key)
    }

    /// Stream state under `key`
    #[must_use]
    pub fn state(&self, key: StateKey) -> Option<&StreamState> {
        self.registry.state(key)
    }

    /// Key of the current view
    #[must_use]
    pub fn current(&self) -> Option<StateKey> {
        self.registry.current()
    }

    /// Messages of the current view
    #[must_use]
    pub fn current_messages(&self) -> &[Message] {
        self.current()
            .map(|key| self.registry.messages(key))
            .unwrap_or_default()
    }

    /// Stream state of the current view
    #[must_use]
    pub fn current_state(&self) -> Option<&StreamState> {
        self.current().and_then(|key| self.registry.state(key))
    }

    /// Registry, for read-only inspection
    #[must_use]
    pub fn registry(&self) -> &ConversationRegistry {
        &self.registry
    }

    /// Live session
    #[must_use]
    pub fn session(&self, session_id: SessionId) -> Option<&StreamSession> {
        self.sessions.get(&session_id)
    }

    /// Number of live sessions
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }

    /// Sessions started over the multiplexer's lifetime
    #[must_use]
    pub fn total_sessions_started(&self) -> u64 {
        self.total_sessions_started
    }
}
