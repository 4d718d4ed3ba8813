//! On-demand context window accounting.
//!
//! Usage is read from the most recent terminal assistant message that carries
//! token counts; the window size comes from the model catalog. Nothing is
//! cached, so two calls without a ledger or catalog change agree exactly.

use std::fmt;
use std::sync::Arc;

use chat_provider::{Message, ModelCatalog, Role};
use tracing::{debug, warn};

use crate::ledger::Ledger;

pub const NO_MODEL_SPECIFIED: &str = "No model specified";
pub const CONTEXT_LENGTH_UNAVAILABLE: &str = "Model context length unavailable";
pub const NO_VALID_CONTEXT_DATA: &str = "No valid context data in session";

#[derive(Debug, Clone, PartialEq)]
pub struct ContextWindowInfo {
    pub current_usage: u64,
    pub max_context: u64,
    pub percentage: f64,
    pub has_valid_data: bool,
    pub error_message: Option<String>,
}

impl ContextWindowInfo {
    fn unavailable(error_message: &str, max_context: u64) -> Self {
        Self {
            current_usage: 0,
            max_context,
            percentage: 0.0,
            has_valid_data: false,
            error_message: Some(error_message.to_string()),
        }
    }

    fn measured(current_usage: u64, max_context: u64) -> Self {
        let percentage = if max_context == 0 {
            0.0
        } else {
            current_usage as f64 / max_context as f64 * 100.0
        };

        Self {
            current_usage,
            max_context,
            percentage,
            has_valid_data: true,
            error_message: None,
        }
    }

    /// Single line for `/status`.
    pub fn status_line(&self) -> String {
        if self.has_valid_data {
            return format!(
                "Context window: {}/{} tokens ({:.1}%)",
                self.current_usage, self.max_context, self.percentage
            );
        }

        let reason = self.error_message.as_deref().unwrap_or("unknown");
        if self.max_context > 0 {
            format!("Context window: {} tokens max ({reason})", self.max_context)
        } else {
            format!("Context window: unavailable ({reason})")
        }
    }
}

impl fmt::Display for ContextWindowInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.status_line())
    }
}

#[derive(Clone)]
pub struct ContextWindowAccountant {
    catalog: Arc<dyn ModelCatalog>,
}

impl fmt::Debug for ContextWindowAccountant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextWindowAccountant").finish_non_exhaustive()
    }
}

impl ContextWindowAccountant {
    pub fn new(catalog: Arc<dyn ModelCatalog>) -> Self {
        Self { catalog }
    }

    pub fn compute(&self, ledger: &Ledger, model_name: &str) -> ContextWindowInfo {
        self.compute_for_messages(&ledger.messages(), model_name)
    }

    pub fn compute_for_messages(&self, messages: &[Message], model_name: &str) -> ContextWindowInfo {
        if model_name.trim().is_empty() {
            return ContextWindowInfo::unavailable(NO_MODEL_SPECIFIED, 0);
        }

        let max_context = match self.catalog.context_length(model_name) {
            Ok(Some(length)) if length > 0 => length,
            Ok(_) => {
                debug!(model = model_name, "catalog has no context length for model");
                return ContextWindowInfo::unavailable(CONTEXT_LENGTH_UNAVAILABLE, 0);
            }
            Err(error) => {
                warn!(model = model_name, %error, "model catalog lookup failed");
                return ContextWindowInfo::unavailable(CONTEXT_LENGTH_UNAVAILABLE, 0);
            }
        };

        match latest_usage(messages) {
            Some(usage) => ContextWindowInfo::measured(usage, max_context),
            None => ContextWindowInfo::unavailable(NO_VALID_CONTEXT_DATA, max_context),
        }
    }
}

/// Total tokens of the most recent terminal assistant turn with accounting.
/// Tool-call messages are skipped, not treated as the end of the scan.
pub fn latest_usage(messages: &[Message]) -> Option<u64> {
    messages
        .iter()
        .rev()
        .filter(|message| message.role() == Role::Assistant && message.tool_calls().is_none())
        .find_map(Message::usage)
        .map(|usage| usage.total())
}
