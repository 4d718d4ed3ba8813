use chat_provider::{Message, Role};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const PREVIEW_CHARS: usize = 50;

/// Bookkeeping stored next to the messages of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionMetadata {
    pub session_id: String,
    pub model: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    pub message_count: usize,
}

impl SessionMetadata {
    #[must_use]
    pub fn new(session_id: impl Into<String>, model: impl Into<String>) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            session_id: session_id.into(),
            model: model.into(),
            created_at: now,
            updated_at: now,
            message_count: 0,
        }
    }
}

/// Everything the store persists for one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LedgerSnapshot {
    pub metadata: SessionMetadata,
    pub messages: Vec<Message>,
}

impl LedgerSnapshot {
    #[must_use]
    pub fn empty(session_id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            metadata: SessionMetadata::new(session_id, model),
            messages: Vec::new(),
        }
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.metadata.session_id
    }

    /// One-line listing entry: `<id>: <first user message>... (<n> messages)`.
    #[must_use]
    pub fn preview(&self) -> String {
        let first_user = self
            .messages
            .iter()
            .find(|message| message.role() == Role::User)
            .map_or("", Message::content);

        let mut preview: String = first_user.chars().take(PREVIEW_CHARS).collect();
        if first_user.chars().count() > PREVIEW_CHARS {
            preview.push_str("...");
        }
        if preview.is_empty() {
            preview.push_str("(empty)");
        }

        format!(
            "{}: {} ({} messages)",
            self.metadata.session_id,
            preview.replace('\n', " "),
            self.messages.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_truncates_first_user_message() {
        let mut snapshot = LedgerSnapshot::empty("abc123", "llama3.1");
        snapshot.messages.push(Message::system("be brief"));
        snapshot.messages.push(Message::user("x".repeat(60)));
        snapshot
            .messages
            .push(Message::assistant("ok", None, None));

        assert_eq!(
            snapshot.preview(),
            format!("abc123: {}... (3 messages)", "x".repeat(50))
        );
    }

    #[test]
    fn preview_marks_sessions_without_user_text() {
        let snapshot = LedgerSnapshot::empty("s1", "m");
        assert_eq!(snapshot.preview(), "s1: (empty) (0 messages)");
    }
}
