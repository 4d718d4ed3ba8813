//! Conversation ledger: the ordered, persisted history of one session.
//!
//! The engine is the only writer during a turn; the summary supervisor reads
//! concurrently. State lives behind an `RwLock`, so a reader sees a message
//! either fully appended or not at all. Every mutation is followed by a
//! synchronous save through the injected [`LedgerStore`].

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chat_provider::{Message, RequestMessage, Role};
use ledger_store::{new_session_id, LedgerSnapshot, LedgerStore, LedgerStoreError, MemoryStore, SessionMetadata};
use time::OffsetDateTime;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("message index {index} is out of range (ledger has {len} messages)")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("{role} message at index {index} cannot be edited")]
    NotEditable { index: usize, role: Role },
    #[error("tool result for '{tool_name}' does not follow an assistant call requesting it")]
    OrphanToolResult { tool_name: String },
    #[error("failed to persist ledger: {0}")]
    Store(#[from] LedgerStoreError),
}

/// One user message as offered for editing: `(display_number, absolute_index, message)`.
pub type NumberedMessage = (usize, usize, Message);

pub struct Ledger {
    store: Arc<dyn LedgerStore>,
    state: RwLock<LedgerSnapshot>,
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.read();
        f.debug_struct("Ledger")
            .field("session_id", &state.metadata.session_id)
            .field("messages", &state.messages.len())
            .finish_non_exhaustive()
    }
}

impl Ledger {
    /// Starts a new session with a fresh id. Nothing is saved until the
    /// first mutation.
    pub fn create(store: Arc<dyn LedgerStore>, model: impl Into<String>) -> Self {
        Self::from_snapshot(store, LedgerSnapshot::empty(new_session_id(), model))
    }

    /// Loads a saved session; `Ok(None)` when the store has no such id.
    pub fn open(store: Arc<dyn LedgerStore>, session_id: &str) -> Result<Option<Self>, LedgerError> {
        let Some(snapshot) = store.load(session_id)? else {
            return Ok(None);
        };
        debug!(
            session_id,
            messages = snapshot.messages.len(),
            "opened saved ledger"
        );
        Ok(Some(Self::from_snapshot(store, snapshot)))
    }

    /// A ledger backed by a private [`MemoryStore`].
    pub fn in_memory(model: impl Into<String>) -> Self {
        Self::create(Arc::new(MemoryStore::new()), model)
    }

    pub fn from_snapshot(store: Arc<dyn LedgerStore>, snapshot: LedgerSnapshot) -> Self {
        Self {
            store,
            state: RwLock::new(snapshot),
        }
    }

    pub fn session_id(&self) -> String {
        self.read().metadata.session_id.clone()
    }

    pub fn model(&self) -> String {
        self.read().metadata.model.clone()
    }

    pub fn metadata(&self) -> SessionMetadata {
        self.read().metadata.clone()
    }

    pub fn len(&self) -> usize {
        self.read().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().messages.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Message> {
        self.read().messages.get(index).cloned()
    }

    pub fn last(&self) -> Option<Message> {
        self.read().messages.last().cloned()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.read().messages.clone()
    }

    /// Consistent copy of metadata and messages.
    pub fn snapshot(&self) -> LedgerSnapshot {
        self.read().clone()
    }

    pub fn has_system_message(&self) -> bool {
        self.read()
            .messages
            .iter()
            .any(|message| message.role() == Role::System)
    }

    /// Appends `message` and returns its index.
    ///
    /// A `tool` message must follow an assistant message (possibly with other
    /// tool results in between) whose tool calls name the same tool.
    pub fn append(&self, message: Message) -> Result<usize, LedgerError> {
        let mut state = self.write();

        if let Some(tool_name) = message.tool_name() {
            if !answers_pending_call(&state.messages, tool_name) {
                return Err(LedgerError::OrphanToolResult {
                    tool_name: tool_name.to_string(),
                });
            }
        }

        let index = state.messages.len();
        debug!(index, role = %message.role(), "ledger append");
        state.messages.push(message);
        self.persist(&mut state)?;
        Ok(index)
    }

    /// Keeps messages `0..=index` and discards the rest.
    pub fn truncate_after(&self, index: usize) -> Result<(), LedgerError> {
        let mut state = self.write();
        let len = state.messages.len();
        if index >= len {
            return Err(LedgerError::IndexOutOfRange { index, len });
        }

        state.messages.truncate(index + 1);
        debug!(index, discarded = len - index - 1, "ledger truncated");
        self.persist(&mut state)
    }

    /// Replaces the content at `index` and discards every later message.
    ///
    /// Any tool exchange after the edit point goes with the tail, so the
    /// result never holds an orphaned call or result.
    pub fn edit_and_truncate(
        &self,
        index: usize,
        new_content: impl Into<String>,
    ) -> Result<(), LedgerError> {
        let mut state = self.write();
        let len = state.messages.len();
        let Some(message) = state.messages.get_mut(index) else {
            return Err(LedgerError::IndexOutOfRange { index, len });
        };

        if message.role() == Role::Tool {
            return Err(LedgerError::NotEditable {
                index,
                role: Role::Tool,
            });
        }

        message.set_content(new_content);
        state.messages.truncate(index + 1);
        debug!(index, discarded = len - index - 1, "ledger edited");
        self.persist(&mut state)
    }

    /// Request view in append order.
    pub fn messages_as_request(&self) -> Vec<RequestMessage> {
        self.read()
            .messages
            .iter()
            .map(RequestMessage::from)
            .collect()
    }

    /// User messages numbered from 1, with their absolute ledger index.
    pub fn user_messages_with_indices(&self) -> Vec<NumberedMessage> {
        self.read()
            .messages
            .iter()
            .enumerate()
            .filter(|(_, message)| message.role() == Role::User)
            .enumerate()
            .map(|(position, (index, message))| (position + 1, index, message.clone()))
            .collect()
    }

    pub fn set_model(&self, model: impl Into<String>) -> Result<(), LedgerError> {
        let mut state = self.write();
        state.metadata.model = model.into();
        self.persist(&mut state)
    }

    pub fn preview(&self) -> String {
        self.read().preview()
    }

    /// Saves the current state without mutating messages.
    pub fn save(&self) -> Result<(), LedgerError> {
        let mut state = self.write();
        self.persist(&mut state)
    }

    fn persist(&self, state: &mut LedgerSnapshot) -> Result<(), LedgerError> {
        state.metadata.message_count = state.messages.len();
        state.metadata.updated_at = OffsetDateTime::now_utc();

        self.store.save(state).map_err(|error| {
            warn!(
                session_id = %state.metadata.session_id,
                %error,
                "ledger save failed; in-memory state kept"
            );
            LedgerError::Store(error)
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, LedgerSnapshot> {
        match self.state.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, LedgerSnapshot> {
        match self.state.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn answers_pending_call(messages: &[Message], tool_name: &str) -> bool {
    messages
        .iter()
        .rev()
        .find(|message| message.role() != Role::Tool)
        .is_some_and(|message| message.role() == Role::Assistant && message.requests_tool(tool_name))
}

#[cfg(test)]
mod tests {
    use chat_provider::ToolCall;
    use serde_json::Map;

    use super::*;

    #[test]
    fn tool_result_may_follow_sibling_results_of_the_same_call_message() {
        let messages = vec![
            Message::user("go"),
            Message::assistant_tool_calls(
                "",
                None,
                vec![ToolCall::new("a", Map::new()), ToolCall::new("b", Map::new())],
            ),
            Message::tool("a", "1"),
        ];

        assert!(answers_pending_call(&messages, "b"));
        assert!(!answers_pending_call(&messages, "c"));
        assert!(!answers_pending_call(&messages[..1], "a"));
    }

    #[test]
    fn save_refreshes_count_and_timestamp() {
        let ledger = Ledger::in_memory("m");
        let before = ledger.metadata().updated_at;

        ledger.append(Message::user("hi")).expect("append");

        let metadata = ledger.metadata();
        assert_eq!(metadata.message_count, 1);
        assert!(metadata.updated_at >= before);
    }
}
