//! Minimal provider-agnostic contract for streaming one chat request.
//!
//! This crate defines the conversation message model, the streaming event
//! shape consumed by the conversation engine, and the model catalog lookup.
//! It excludes provider transport details and multi-request orchestration.

use std::fmt;
use std::sync::{atomic::AtomicBool, Arc};

use serde::Serialize;
use serde_json::Value;

mod message;

pub use message::{
    InvalidMessage, Message, MessageBody, RawMessage, RequestMessage, Role, TokenUsage, ToolCall,
};

/// Shared cancellation flag for a stream.
pub type CancelSignal = Arc<AtomicBool>;

/// Error returned while constructing/configuring a provider before any request starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderInitError {
    message: String,
}

impl ProviderInitError {
    /// Creates a new provider initialization error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Returns the underlying error message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for ProviderInitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ProviderInitError {}

impl From<String> for ProviderInitError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for ProviderInitError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Failure while talking to a backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("backend returned HTTP {status}: {message}")]
    Status { status: u16, message: String },
    #[error("stream failed: {0}")]
    StreamFailed(String),
    #[error("stream ended before the backend reported completion")]
    IncompleteStream,
    #[error("request was cancelled")]
    Cancelled,
    #[error("model catalog unavailable: {0}")]
    Catalog(String),
}

/// Generic host-mediated tool definition advertised to the backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: Value,
}

/// Input required to start one streaming request.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<RequestMessage>,
    pub tools: Vec<ToolDefinition>,
}

/// One incremental item of a streaming response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamEvent {
    pub content_delta: String,
    pub thinking_delta: String,
    pub tool_calls: Option<Vec<ToolCall>>,
    pub done: bool,
    pub eval_count: Option<u64>,
    pub prompt_eval_count: Option<u64>,
}

impl StreamEvent {
    /// Text-only delta.
    #[must_use]
    pub fn content(text: impl Into<String>) -> Self {
        Self {
            content_delta: text.into(),
            ..Self::default()
        }
    }

    /// Tool-call batch without text.
    #[must_use]
    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: Some(calls),
            ..Self::default()
        }
    }

    /// Final event without accounting.
    #[must_use]
    pub fn done() -> Self {
        Self {
            done: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_usage(mut self, eval_count: u64, prompt_eval_count: u64) -> Self {
        self.eval_count = Some(eval_count);
        self.prompt_eval_count = Some(prompt_eval_count);
        self
    }

    /// Tool calls carried by this event; empty when there are none.
    #[must_use]
    pub fn pending_tool_calls(&self) -> &[ToolCall] {
        self.tool_calls.as_deref().unwrap_or(&[])
    }

    /// Accounting for this event when both counts are present and positive.
    #[must_use]
    pub fn usage(&self) -> Option<TokenUsage> {
        TokenUsage::from_counts(self.eval_count, self.prompt_eval_count)
    }
}

/// Blocking iterator over a live response.
pub type EventStream = Box<dyn Iterator<Item = Result<StreamEvent, ProviderError>> + Send>;

/// Immutable metadata describing a chat provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderProfile {
    pub provider_id: String,
    pub model_id: String,
}

/// Provider interface for streaming chat requests.
pub trait ChatProvider: Send + Sync + 'static {
    /// Returns provider/model identity metadata.
    fn profile(&self) -> ProviderProfile;

    /// Opens a fresh response stream for `request`.
    ///
    /// Every continuation must call this again; streams are consumed once.
    fn stream_chat(
        &self,
        request: ChatRequest,
        cancel: CancelSignal,
    ) -> Result<EventStream, ProviderError>;
}

/// Catalog entry describing one installed model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelInfo {
    pub name: String,
    pub context_length: Option<u64>,
}

/// Lookup of the models a backend can serve.
pub trait ModelCatalog: Send + Sync {
    fn list_models(&self) -> Result<Vec<ModelInfo>, ProviderError>;

    /// Context length for `model_name`, `None` when unknown or unreported.
    fn context_length(&self, model_name: &str) -> Result<Option<u64>, ProviderError> {
        Ok(self
            .list_models()?
            .into_iter()
            .find(|model| model.name == model_name)
            .and_then(|model| model.context_length))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    struct FixedCatalog(Vec<ModelInfo>);

    impl ModelCatalog for FixedCatalog {
        fn list_models(&self) -> Result<Vec<ModelInfo>, ProviderError> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn provider_init_error_preserves_message() {
        let error = ProviderInitError::new("missing host");
        assert_eq!(error.message(), "missing host");
        assert_eq!(error.to_string(), "missing host");
    }

    #[test]
    fn stream_event_helpers_describe_pending_work() {
        let text = StreamEvent::content("partial");
        assert!(text.pending_tool_calls().is_empty());
        assert!(!text.done);

        let calls = StreamEvent::tool_calls(vec![
            ToolCall::from_value("a", json!({})),
            ToolCall::from_value("b", json!({"x": 1})),
        ]);
        assert_eq!(calls.pending_tool_calls().len(), 2);

        let done = StreamEvent::done().with_usage(150, 50);
        assert!(done.done);
        assert_eq!(done.usage().map(|usage| usage.total()), Some(200));
        assert_eq!(StreamEvent::done().usage(), None);
    }

    #[test]
    fn chat_request_carries_message_history_and_tools() {
        let request = ChatRequest {
            model: "llama3.1".to_string(),
            messages: vec![RequestMessage::new(Role::User, "list files")],
            tools: vec![ToolDefinition {
                name: "list_directory".to_string(),
                description: Some("Lists a directory".to_string()),
                input_schema: json!({
                    "type": "object",
                    "properties": { "path": { "type": "string" } }
                }),
            }],
        };

        assert_eq!(request.messages[0].content, "list files");
        assert_eq!(request.tools[0].input_schema["type"], "object");
    }

    #[test]
    fn default_context_length_lookup_matches_exact_name() {
        let catalog = FixedCatalog(vec![
            ModelInfo {
                name: "llama3.1:8b".to_string(),
                context_length: Some(4096),
            },
            ModelInfo {
                name: "qwen3".to_string(),
                context_length: None,
            },
        ]);

        assert_eq!(catalog.context_length("llama3.1:8b"), Ok(Some(4096)));
        assert_eq!(catalog.context_length("qwen3"), Ok(None));
        assert_eq!(catalog.context_length("llama3.1"), Ok(None));
    }

    #[test]
    fn provider_errors_render_readable_messages() {
        let status = ProviderError::Status {
            status: 503,
            message: "overloaded".to_string(),
        };
        assert_eq!(status.to_string(), "backend returned HTTP 503: overloaded");
        assert_eq!(
            ProviderError::IncompleteStream.to_string(),
            "stream ended before the backend reported completion"
        );
    }
}
