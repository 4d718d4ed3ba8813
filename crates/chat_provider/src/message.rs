//! Conversation message model shared by the ledger, the store and providers.
//!
//! [`Message`] is a tagged union: fields that only make sense for one role
//! (tool calls, token accounting, the answered tool name) live on that role's
//! variant. The flat on-disk shape is produced through [`RawMessage`], which
//! re-validates every invariant when a message is loaded.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

/// Author role of a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    Tool,
    System,
}

impl Role {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
            Self::System => "system",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One tool invocation requested by an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool_name: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

impl ToolCall {
    #[must_use]
    pub fn new(tool_name: impl Into<String>, arguments: Map<String, Value>) -> Self {
        Self {
            tool_name: tool_name.into(),
            arguments,
        }
    }

    /// Builds a call from any JSON value; non-object arguments become an empty map.
    #[must_use]
    pub fn from_value(tool_name: impl Into<String>, arguments: Value) -> Self {
        let arguments = match arguments {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self::new(tool_name, arguments)
    }
}

/// Backend-reported token accounting for a conversational assistant turn.
///
/// Both counts are always positive; there is no way to hold one without the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenUsage {
    eval_count: u64,
    prompt_eval_count: u64,
}

impl TokenUsage {
    /// Returns `None` unless both counts are positive.
    #[must_use]
    pub fn new(eval_count: u64, prompt_eval_count: u64) -> Option<Self> {
        (eval_count > 0 && prompt_eval_count > 0).then_some(Self {
            eval_count,
            prompt_eval_count,
        })
    }

    #[must_use]
    pub fn from_counts(eval_count: Option<u64>, prompt_eval_count: Option<u64>) -> Option<Self> {
        Self::new(eval_count?, prompt_eval_count?)
    }

    #[must_use]
    pub fn eval_count(&self) -> u64 {
        self.eval_count
    }

    #[must_use]
    pub fn prompt_eval_count(&self) -> u64 {
        self.prompt_eval_count
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.eval_count.saturating_add(self.prompt_eval_count)
    }
}

/// Role-specific payload of a [`Message`].
#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    User {
        content: String,
    },
    System {
        content: String,
    },
    Assistant {
        content: String,
        model: Option<String>,
        tool_calls: Option<Vec<ToolCall>>,
        usage: Option<TokenUsage>,
    },
    Tool {
        tool_name: String,
        content: String,
    },
}

/// One ledger entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawMessage", into = "RawMessage")]
pub struct Message {
    timestamp: OffsetDateTime,
    body: MessageBody,
}

impl Message {
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::now(MessageBody::User {
            content: content.into(),
        })
    }

    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::now(MessageBody::System {
            content: content.into(),
        })
    }

    /// Terminal assistant turn, optionally carrying token accounting.
    #[must_use]
    pub fn assistant(
        content: impl Into<String>,
        model: Option<String>,
        usage: Option<TokenUsage>,
    ) -> Self {
        Self::now(MessageBody::Assistant {
            content: content.into(),
            model,
            tool_calls: None,
            usage,
        })
    }

    /// Assistant message that requests tools. Never carries token accounting.
    #[must_use]
    pub fn assistant_tool_calls(
        content: impl Into<String>,
        model: Option<String>,
        tool_calls: Vec<ToolCall>,
    ) -> Self {
        Self::now(MessageBody::Assistant {
            content: content.into(),
            model,
            tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            usage: None,
        })
    }

    #[must_use]
    pub fn tool(tool_name: impl Into<String>, content: impl Into<String>) -> Self {
        Self::now(MessageBody::Tool {
            tool_name: tool_name.into(),
            content: content.into(),
        })
    }

    fn now(body: MessageBody) -> Self {
        Self {
            timestamp: OffsetDateTime::now_utc(),
            body,
        }
    }

    #[must_use]
    pub fn with_timestamp(mut self, timestamp: OffsetDateTime) -> Self {
        self.timestamp = timestamp;
        self
    }

    #[must_use]
    pub fn body(&self) -> &MessageBody {
        &self.body
    }

    #[must_use]
    pub fn timestamp(&self) -> OffsetDateTime {
        self.timestamp
    }

    #[must_use]
    pub fn role(&self) -> Role {
        match self.body {
            MessageBody::User { .. } => Role::User,
            MessageBody::System { .. } => Role::System,
            MessageBody::Assistant { .. } => Role::Assistant,
            MessageBody::Tool { .. } => Role::Tool,
        }
    }

    #[must_use]
    pub fn content(&self) -> &str {
        match &self.body {
            MessageBody::User { content }
            | MessageBody::System { content }
            | MessageBody::Assistant { content, .. }
            | MessageBody::Tool { content, .. } => content,
        }
    }

    /// Replaces the text content while keeping every role-specific field.
    pub fn set_content(&mut self, new_content: impl Into<String>) {
        match &mut self.body {
            MessageBody::User { content }
            | MessageBody::System { content }
            | MessageBody::Assistant { content, .. }
            | MessageBody::Tool { content, .. } => *content = new_content.into(),
        }
    }

    #[must_use]
    pub fn producing_model(&self) -> Option<&str> {
        match &self.body {
            MessageBody::Assistant { model, .. } => model.as_deref(),
            _ => None,
        }
    }

    #[must_use]
    pub fn tool_calls(&self) -> Option<&[ToolCall]> {
        match &self.body {
            MessageBody::Assistant { tool_calls, .. } => tool_calls.as_deref(),
            _ => None,
        }
    }

    #[must_use]
    pub fn tool_name(&self) -> Option<&str> {
        match &self.body {
            MessageBody::Tool { tool_name, .. } => Some(tool_name),
            _ => None,
        }
    }

    #[must_use]
    pub fn usage(&self) -> Option<TokenUsage> {
        match &self.body {
            MessageBody::Assistant { usage, .. } => *usage,
            _ => None,
        }
    }

    #[must_use]
    pub fn eval_count(&self) -> Option<u64> {
        self.usage().map(|usage| usage.eval_count())
    }

    #[must_use]
    pub fn prompt_eval_count(&self) -> Option<u64> {
        self.usage().map(|usage| usage.prompt_eval_count())
    }

    /// True when this assistant message requested a tool with `tool_name`.
    #[must_use]
    pub fn requests_tool(&self, tool_name: &str) -> bool {
        self.tool_calls()
            .is_some_and(|calls| calls.iter().any(|call| call.tool_name == tool_name))
    }
}

/// Flat serialized form of a [`Message`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawMessage {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eval_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_eval_count: Option<u64>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// Reason a [`RawMessage`] could not become a [`Message`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidMessage {
    #[error("{role} message must not carry '{field}'")]
    UnexpectedField { role: Role, field: &'static str },
    #[error("tool message is missing 'tool_name'")]
    MissingToolName,
    #[error("eval_count and prompt_eval_count must both be present and positive")]
    PartialUsage,
    #[error("assistant message with tool_calls must not carry token accounting")]
    UsageOnToolCall,
}

impl TryFrom<RawMessage> for Message {
    type Error = InvalidMessage;

    fn try_from(raw: RawMessage) -> Result<Self, Self::Error> {
        let RawMessage {
            role,
            content,
            model,
            tool_calls,
            tool_name,
            eval_count,
            prompt_eval_count,
            timestamp,
        } = raw;

        let has_counts = eval_count.is_some() || prompt_eval_count.is_some();
        let usage = TokenUsage::from_counts(eval_count, prompt_eval_count);
        if has_counts && usage.is_none() {
            return Err(InvalidMessage::PartialUsage);
        }

        if role != Role::Assistant {
            if model.is_some() {
                return Err(InvalidMessage::UnexpectedField { role, field: "model" });
            }
            if tool_calls.is_some() {
                return Err(InvalidMessage::UnexpectedField {
                    role,
                    field: "tool_calls",
                });
            }
            if usage.is_some() {
                return Err(InvalidMessage::UnexpectedField {
                    role,
                    field: "eval_count",
                });
            }
        }
        if role != Role::Tool && tool_name.is_some() {
            return Err(InvalidMessage::UnexpectedField {
                role,
                field: "tool_name",
            });
        }

        let body = match role {
            Role::User => MessageBody::User { content },
            Role::System => MessageBody::System { content },
            Role::Tool => MessageBody::Tool {
                tool_name: tool_name.ok_or(InvalidMessage::MissingToolName)?,
                content,
            },
            Role::Assistant => {
                let tool_calls = tool_calls.filter(|calls| !calls.is_empty());
                if tool_calls.is_some() && usage.is_some() {
                    return Err(InvalidMessage::UsageOnToolCall);
                }
                MessageBody::Assistant {
                    content,
                    model,
                    tool_calls,
                    usage,
                }
            }
        };

        Ok(Self { timestamp, body })
    }
}

impl From<Message> for RawMessage {
    fn from(message: Message) -> Self {
        let role = message.role();
        let timestamp = message.timestamp;
        match message.body {
            MessageBody::User { content } | MessageBody::System { content } => Self {
                role,
                content,
                model: None,
                tool_calls: None,
                tool_name: None,
                eval_count: None,
                prompt_eval_count: None,
                timestamp,
            },
            MessageBody::Assistant {
                content,
                model,
                tool_calls,
                usage,
            } => Self {
                role,
                content,
                model,
                tool_calls,
                tool_name: None,
                eval_count: usage.map(|usage| usage.eval_count()),
                prompt_eval_count: usage.map(|usage| usage.prompt_eval_count()),
                timestamp,
            },
            MessageBody::Tool { tool_name, content } => Self {
                role,
                content,
                model: None,
                tool_calls: None,
                tool_name: Some(tool_name),
                eval_count: None,
                prompt_eval_count: None,
                timestamp,
            },
        }
    }
}

/// Model-facing view of one ledger message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestMessage {
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
}

impl RequestMessage {
    #[must_use]
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: None,
            tool_name: None,
        }
    }
}

impl From<&Message> for RequestMessage {
    fn from(message: &Message) -> Self {
        Self {
            role: message.role(),
            content: message.content().to_string(),
            tool_calls: message.tool_calls().map(<[ToolCall]>::to_vec),
            tool_name: message.tool_name().map(ToString::to_string),
        }
    }
}
