//! Shared test doubles: a scripted transport and an in-memory store

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use chatmux_core::config::MuxConfig;
use chatmux_core::error::{StoreError, TransportError};
use chatmux_core::messages::{Conversation, ConversationId, Message};
use chatmux_core::multiplexer::{SessionMultiplexer, StreamUpdate};
use chatmux_core::store::ChatStore;
use chatmux_core::transport::{ByteStream, StreamRequest, Transport};

// =============================================================================
// Wire helpers
// =============================================================================

/// One SSE frame as bytes
pub fn sse(event: &str, data: &str) -> Vec<u8> {
    format!("event: {event}\ndata: {data}\n\n").into_bytes()
}

/// A JSON-envelope frame for conversation `conv`
pub fn frame(event: &str, conv: i64, body: serde_json::Value) -> Vec<u8> {
    let mut payload = body;
    if let Some(map) = payload.as_object_mut() {
        map.insert("conversationId".into(), conv.into());
    }
    sse(event, &payload.to_string())
}

// =============================================================================
// Scripted transport
// =============================================================================

/// What the transport does for one request
pub enum Script {
    /// Deliver these chunks, then end the body
    Chunks(Vec<Result<Vec<u8>, String>>),
    /// Refuse to open with this status and body
    OpenError { status: u16, body: String },
    /// Deliver these chunks, then stay open forever
    Hang(Vec<Vec<u8>>),
    /// Deliver whatever the test pushes into the paired sender
    Feed(mpsc::UnboundedReceiver<Result<Vec<u8>, TransportError>>),
}

/// Sender paired with a [`Script::Feed`]
pub type Feeder = mpsc::UnboundedSender<Result<Vec<u8>, TransportError>>;

/// Create a test-driven body
pub fn feed() -> (Feeder, Script) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, Script::Feed(rx))
}

/// Transport that answers each request by its message text
#[derive(Default)]
pub struct ScriptedTransport {
    scripts: Mutex<HashMap<String, Script>>,
    requests: Mutex<Vec<StreamRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register the script for requests whose message is `text`
    pub fn script(&self, text: &str, script: Script) {
        self.scripts.lock().insert(text.to_string(), script);
    }

    /// Every request opened so far
    pub fn requests(&self) -> Vec<StreamRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn open(&self, request: &StreamRequest) -> Result<ByteStream, TransportError> {
        self.requests.lock().push(request.clone());
        let script = self.scripts.lock().remove(&request.message);

        match script {
            Some(Script::Chunks(chunks)) => {
                let items = chunks
                    .into_iter()
                    .map(|c| c.map_err(TransportError::Body))
                    .collect::<Vec<_>>();
                Ok(futures::stream::iter(items).boxed())
            }
            Some(Script::OpenError { status, body }) => {
                Err(TransportError::Status { status, body })
            }
            Some(Script::Hang(chunks)) => Ok(futures::stream::iter(chunks.into_iter().map(Ok))
                .chain(futures::stream::pending())
                .boxed()),
            Some(Script::Feed(rx)) => Ok(UnboundedReceiverStream::new(rx).boxed()),
            None => Err(TransportError::Status {
                status: 500,
                body: format!("no script for {:?}", request.message),
            }),
        }
    }
}

// =============================================================================
// In-memory store
// =============================================================================

/// [`ChatStore`] over a map, counting history fetches
pub struct MemoryStore {
    conversations: Mutex<Vec<Conversation>>,
    histories: Mutex<HashMap<ConversationId, Vec<Message>>>,
    next_id: AtomicI64,
    fetches: Mutex<Vec<ConversationId>>,
    fail_next: Mutex<Option<StoreError>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            conversations: Mutex::new(Vec::new()),
            histories: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(100),
            fetches: Mutex::new(Vec::new()),
            fail_next: Mutex::new(None),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Seed a conversation and its history
    pub fn seed(&self, conversation: Conversation, history: Vec<Message>) {
        self.histories.lock().insert(conversation.id, history);
        self.conversations.lock().push(conversation);
    }

    /// Make the next call fail with `error`
    pub fn fail_next(&self, error: StoreError) {
        *self.fail_next.lock() = Some(error);
    }

    /// Conversations whose history was fetched, in call order
    pub fn fetches(&self) -> Vec<ConversationId> {
        self.fetches.lock().clone()
    }

    fn check(&self) -> Result<(), StoreError> {
        match self.fail_next.lock().take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ChatStore for MemoryStore {
    async fn list_conversations(
        &self,
        page: u32,
        size: u32,
    ) -> Result<Vec<Conversation>, StoreError> {
        self.check()?;
        let skip = (page.saturating_sub(1) * size) as usize;
        Ok(self
            .conversations
            .lock()
            .iter()
            .skip(skip)
            .take(size as usize)
            .cloned()
            .collect())
    }

    async fn create_conversation(&self, title: &str) -> Result<Conversation, StoreError> {
        self.check()?;
        let id = ConversationId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let conversation = Conversation::new(id, title);
        self.conversations.lock().insert(0, conversation.clone());
        self.histories.lock().insert(id, Vec::new());
        Ok(conversation)
    }

    async fn rename_conversation(&self, id: ConversationId, title: &str) -> Result<(), StoreError> {
        self.check()?;
        let mut conversations = self.conversations.lock();
        let conv = conversations
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or(StoreError::Api {
                code: 404,
                message: "对话不存在".into(),
            })?;
        conv.title = title.to_string();
        Ok(())
    }

    async fn delete_conversation(&self, id: ConversationId) -> Result<(), StoreError> {
        self.check()?;
        self.conversations.lock().retain(|c| c.id != id);
        self.histories.lock().remove(&id);
        Ok(())
    }

    async fn fetch_messages(&self, id: ConversationId) -> Result<Vec<Message>, StoreError> {
        self.check()?;
        self.fetches.lock().push(id);
        Ok(self.histories.lock().get(&id).cloned().unwrap_or_default())
    }
}

// =============================================================================
// Driving
// =============================================================================

/// Config with an error window long enough to observe
pub fn test_config() -> MuxConfig {
    MuxConfig {
        error_display_ms: 60_000,
        ..MuxConfig::default()
    }
}

pub fn multiplexer(transport: Arc<ScriptedTransport>, store: Arc<MemoryStore>) -> SessionMultiplexer {
    SessionMultiplexer::new(test_config(), transport, store)
}

/// Apply updates until no session is live
pub async fn drain(mux: &mut SessionMultiplexer) -> Vec<StreamUpdate> {
    let mut all = Vec::new();
    while mux.active_count() > 0 {
        let batch = tokio::time::timeout(Duration::from_secs(5), mux.next_update())
            .await
            .expect("sessions did not finish in time");
        all.extend(batch);
    }
    all
}

/// Apply updates until `done` holds
pub async fn drive_until(
    mux: &mut SessionMultiplexer,
    mut done: impl FnMut(&SessionMultiplexer) -> bool,
) -> Vec<StreamUpdate> {
    let mut all = Vec::new();
    while !done(mux) {
        let batch = tokio::time::timeout(Duration::from_secs(5), mux.next_update())
            .await
            .expect("condition not reached in time");
        assert!(
            !batch.is_empty() || mux.active_count() > 0 || done(mux),
            "nothing left to drive"
        );
        all.extend(batch);
    }
    all
}
