//! Conversation Registry
//!
//! Sole owner of every [`Conversation`], [`Message`] and [`StreamState`].
//!
//! # Layout
//!
//! ```text
//! conversations : Vec<Conversation>                  (display order, newest first)
//! messages      : ConversationId -> Vec<Message>     (arrival order)
//! states        : ConversationId -> StreamState
//! pending       : SessionId      -> PendingSlot      (new chats without an id yet)
//! ```
//!
//! A stream started without a conversation id gets its own pending slot, keyed
//! by the session that created it. When that session first sees a
//! server-confirmed id the slot is moved into the main maps (see
//! [`ConversationRegistry::migrate_pending`]); nothing is copied, so there is
//! exactly one live copy of the buffer and state at any time.

use std::collections::HashMap;
use std::time::Instant;

use tracing::{debug, info};

use crate::messages::{now_iso, Conversation, ConversationId, Message, MessageId, SessionId};
use crate::streaming::StreamState;

/// Conversation id carried by messages of a not-yet-identified conversation
pub const PENDING_CONVERSATION: ConversationId = ConversationId(0);

/// Where a StreamState and its message buffer live
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StateKey {
    /// A server-identified conversation
    Conversation(ConversationId),
    /// The pending slot of a new-conversation session
    Pending(SessionId),
}

impl std::fmt::Display for StateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Conversation(id) => write!(f, "conversation:{id}"),
            Self::Pending(session) => write!(f, "pending:{session}"),
        }
    }
}

/// Buffer and state of a conversation the server has not identified yet
#[derive(Debug, Default)]
pub struct PendingSlot {
    /// Messages pushed before the id arrived
    pub messages: Vec<Message>,
    /// Stream state before the id arrived
    pub state: StreamState,
    /// Text of the opening USER message, source of the provisional title
    pub opening_text: String,
}

/// Owns conversations, message lists and stream states
#[derive(Debug)]
pub struct ConversationRegistry {
    conversations: Vec<Conversation>,
    messages: HashMap<ConversationId, Vec<Message>>,
    states: HashMap<ConversationId, StreamState>,
    pending: HashMap<SessionId, PendingSlot>,
    current: Option<StateKey>,
    title_max_chars: usize,
}

impl Default for ConversationRegistry {
    fn default() -> Self {
        Self::new(30)
    }
}

impl ConversationRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new(title_max_chars: usize) -> Self {
        Self {
            conversations: Vec::new(),
            messages: HashMap::new(),
            states: HashMap::new(),
            pending: HashMap::new(),
            current: None,
            title_max_chars,
        }
    }

    // =========================================================================
    // Conversation list
    // =========================================================================

    /// Conversations in display order
    #[must_use]
    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    /// Look up a conversation
    #[must_use]
    pub fn conversation(&self, id: ConversationId) -> Option<&Conversation> {
        self.conversations.iter().find(|c| c.id == id)
    }

    /// Replace the conversation list
    pub fn set_conversations(&mut self, conversations: Vec<Conversation>) {
        self.conversations = conversations;
    }

    /// Insert a conversation at the head of the list, replacing any entry with
    /// the same id
    pub fn insert_front(&mut self, conversation: Conversation) {
        self.conversations.retain(|c| c.id != conversation.id);
        self.conversations.insert(0, conversation);
    }

    /// Change a conversation's title; returns `false` if it is not listed
    pub fn rename(&mut self, id: ConversationId, title: &str) -> bool {
        match self.conversations.iter_mut().find(|c| c.id == id) {
            Some(conv) => {
                conv.title = title.to_string();
                conv.updated_at = Some(now_iso());
                true
            }
            None => false,
        }
    }

    /// Drop a conversation with its messages and state
    ///
    /// Returns the removed state so the caller can cancel its handle.
    pub fn remove(&mut self, id: ConversationId) -> Option<StreamState> {
        self.conversations.retain(|c| c.id != id);
        self.messages.remove(&id);
        if self.current == Some(StateKey::Conversation(id)) {
            self.current = None;
        }
        self.states.remove(&id)
    }

    // =========================================================================
    // Current view
    // =========================================================================

    /// Key of the conversation the UI is viewing
    #[must_use]
    pub fn current(&self) -> Option<StateKey> {
        self.current
    }

    /// Set the viewed conversation
    pub fn set_current(&mut self, key: Option<StateKey>) {
        self.current = key;
    }

    // =========================================================================
    // Messages and states
    // =========================================================================

    /// Message list under `key` (empty if none)
    #[must_use]
    pub fn messages(&self, key: StateKey) -> &[Message] {
        let list = match key {
            StateKey::Conversation(id) => self.messages.get(&id),
            StateKey::Pending(session) => self.pending.get(&session).map(|p| &p.messages),
        };
        list.map(Vec::as_slice).unwrap_or_default()
    }

    /// Whether a message list is cached for `id`
    #[must_use]
    pub fn has_messages(&self, id: ConversationId) -> bool {
        self.messages.contains_key(&id)
    }

    /// Stream state under `key`
    #[must_use]
    pub fn state(&self, key: StateKey) -> Option<&StreamState> {
        match key {
            StateKey::Conversation(id) => self.states.get(&id),
            StateKey::Pending(session) => self.pending.get(&session).map(|p| &p.state),
        }
    }

    /// Mutable stream state under `key`
    pub fn state_mut(&mut self, key: StateKey) -> Option<&mut StreamState> {
        match key {
            StateKey::Conversation(id) => self.states.get_mut(&id),
            StateKey::Pending(session) => self.pending.get_mut(&session).map(|p| &mut p.state),
        }
    }

    /// Stream state for `id`, created idle if absent
    pub fn get_or_create_state(&mut self, id: ConversationId) -> &mut StreamState {
        self.states.entry(id).or_default()
    }

    /// Message list for `id`, created empty if absent
    pub fn get_or_create_messages(&mut self, id: ConversationId) -> &mut Vec<Message> {
        self.messages.entry(id).or_default()
    }

    /// Mutable message list under `key`, created empty for a known conversation
    pub fn messages_mut(&mut self, key: StateKey) -> Option<&mut Vec<Message>> {
        match key {
            StateKey::Conversation(id) => Some(self.get_or_create_messages(id)),
            StateKey::Pending(session) => self.pending.get_mut(&session).map(|p| &mut p.messages),
        }
    }

    /// Replace a conversation's history with a freshly fetched one
    pub fn set_messages(&mut self, id: ConversationId, mut messages: Vec<Message>) {
        reconcile_rounds(&mut messages);
        self.messages.insert(id, messages);
    }

    /// Append a message under `key`
    pub fn push_message(&mut self, key: StateKey, message: Message) {
        if let Some(list) = self.messages_mut(key) {
            list.push(message);
        }
    }

    /// Append a finalized BOT message as the last of its round
    ///
    /// Earlier BOT messages of the same round lose their `is_last_in_round`
    /// flag, so the round invariant holds after every push.
    pub fn push_bot_message(&mut self, key: StateKey, message: Message) {
        let Some(list) = self.messages_mut(key) else {
            return;
        };
        let round = message.round_id;
        for earlier in list.iter_mut().rev().take_while(|m| !m.is_user()) {
            if earlier.is_bot() && earlier.round_id == round {
                earlier.is_last_in_round = false;
            }
        }
        list.push(message);
    }

    /// Roll back a failed exchange
    ///
    /// Removes the optimistic USER message `round_id` together with any BOT
    /// message already flushed into its round. Only the most recent round is
    /// eligible: if a later USER message exists nothing is removed. Returns the
    /// number of messages removed.
    pub fn rollback_round(&mut self, key: StateKey, round_id: MessageId) -> usize {
        let Some(list) = self.messages_mut(key) else {
            return 0;
        };
        match list.iter().rposition(Message::is_user) {
            Some(pos) if list[pos].id == round_id => {
                let before = list.len();
                let kept: Vec<Message> = list
                    .drain(pos..)
                    .filter(|m| m.id != round_id && m.round_id != Some(round_id))
                    .collect();
                list.extend(kept);
                before - list.len()
            }
            _ => 0,
        }
    }

    /// Recompute the message count of `id` from its materialized list
    pub fn refresh_message_count(&mut self, id: ConversationId) {
        let count = self.messages.get(&id).map_or(0, Vec::len);
        if let Some(conv) = self.conversations.iter_mut().find(|c| c.id == id) {
            conv.message_count = u32::try_from(count).unwrap_or(u32::MAX);
            conv.updated_at = Some(now_iso());
        }
    }

    // =========================================================================
    // Pending slots
    // =========================================================================

    /// Create the pending slot for a new-conversation session
    pub fn open_pending(&mut self, session: SessionId, opening_text: &str) -> &mut PendingSlot {
        self.pending.entry(session).or_insert_with(|| PendingSlot {
            opening_text: opening_text.to_string(),
            ..PendingSlot::default()
        })
    }

    /// Whether `session` still has a pending slot
    #[must_use]
    pub fn is_pending(&self, session: SessionId) -> bool {
        self.pending.contains_key(&session)
    }

    /// Number of pending slots
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Move a pending slot under its server-assigned id
    ///
    /// Synthesizes the conversation record (provisional title from the opening
    /// text), puts it at the head of the list, re-keys the buffer and state,
    /// stamps the buffered messages with the id and clears the slot. Returns
    /// `false` (and changes nothing) if the slot was already migrated.
    pub fn migrate_pending(&mut self, session: SessionId, id: ConversationId) -> bool {
        let Some(slot) = self.pending.remove(&session) else {
            return false;
        };

        let title = truncate_title(&slot.opening_text, self.title_max_chars);
        if self.conversation(id).is_none() {
            self.insert_front(Conversation::new(id, title));
        }

        let mut buffered = slot.messages;
        for msg in &mut buffered {
            if msg.conversation_id == PENDING_CONVERSATION {
                msg.conversation_id = id;
            }
        }
        self.messages.entry(id).or_default().extend(buffered);
        self.states.insert(id, slot.state);
        self.refresh_message_count(id);

        if self.current == Some(StateKey::Pending(session)) {
            self.current = Some(StateKey::Conversation(id));
        }

        info!(session = %session, conversation_id = %id, "Migrated pending conversation");
        true
    }

    /// Drop a pending slot without migrating it
    pub fn discard_pending(&mut self, session: SessionId) -> Option<PendingSlot> {
        let slot = self.pending.remove(&session);
        if slot.is_some() && self.current == Some(StateKey::Pending(session)) {
            self.current = None;
        }
        slot
    }

    // =========================================================================
    // Housekeeping
    // =========================================================================

    /// Return every expired error window to idle; returns how many changed
    ///
    /// A pending slot left empty by a failed first send is dropped once its
    /// window passes; it can never be migrated.
    pub fn expire_error_windows(&mut self, now: Instant) -> usize {
        let mut changed = self
            .states
            .values_mut()
            .map(|state| state.expire_error(now))
            .filter(|expired| *expired)
            .count();

        let expired: Vec<SessionId> = self
            .pending
            .iter_mut()
            .filter_map(|(session, slot)| slot.state.expire_error(now).then_some(*session))
            .collect();
        changed += expired.len();

        for session in expired {
            if self.messages(StateKey::Pending(session)).is_empty() {
                self.discard_pending(session);
            }
        }
        changed
    }

    /// Earliest open error window
    #[must_use]
    pub fn next_error_deadline(&self) -> Option<Instant> {
        self.states
            .values()
            .chain(self.pending.values().map(|p| &p.state))
            .filter_map(StreamState::error_deadline)
            .min()
    }

    /// Drop everything
    pub fn clear(&mut self) {
        debug!(
            conversations = self.conversations.len(),
            pending = self.pending.len(),
            "Clearing registry"
        );
        self.conversations.clear();
        self.messages.clear();
        self.states.clear();
        self.pending.clear();
        self.current = None;
    }
}

/// Assign `round_id` / `is_last_in_round` over a history in arrival order
///
/// Each USER message opens a round; each following BOT message inherits that
/// round; a BOT message is last in its round iff the next message is absent or
/// is a USER message. BOT messages before the first USER message belong to no
/// round.
pub fn reconcile_rounds(messages: &mut [Message]) {
    let mut round = None;
    let len = messages.len();

    for i in 0..len {
        let next_is_user_or_end = messages.get(i + 1).map_or(true, Message::is_user);
        let msg = &mut messages[i];

        if msg.is_user() {
            round = Some(msg.id);
            msg.round_id = Some(msg.id);
            msg.is_last_in_round = false;
        } else if msg.is_bot() {
            msg.round_id = round;
            msg.is_last_in_round = round.is_some() && next_is_user_or_end;
        } else {
            msg.round_id = round;
            msg.is_last_in_round = false;
        }
    }
}

fn truncate_title(text: &str, max_chars: usize) -> String {
    text.trim().chars().take(max_chars).collect()
}
