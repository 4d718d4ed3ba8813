//! Tool execution gateway.
//!
//! The gateway is the only path from a model-requested tool call to a tool
//! implementation. It enforces the enabled set, applies the confirmation
//! policy and converts every failure mode (declared errors, denials, panics)
//! into a uniform [`ToolExecutionResult`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::Arc;

use chat_provider::ToolDefinition;
use serde_json::{Map, Value};
use tracing::{debug, warn};

pub const DENIED_BY_USER: &str = "Tool execution denied by user";

/// Synchronous yes/no decision for one tool call.
pub type ConfirmFn<'a> = dyn FnMut(&str, &Map<String, Value>) -> bool + 'a;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ToolExecutionPolicy {
    NeverConfirm,
    #[default]
    AlwaysConfirm,
    ConfirmDestructive,
}

impl ToolExecutionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NeverConfirm => "never",
            Self::AlwaysConfirm => "always",
            Self::ConfirmDestructive => "destructive",
        }
    }

    fn requires_confirmation(&self, tool: &dyn Tool) -> bool {
        match self {
            Self::NeverConfirm => false,
            Self::AlwaysConfirm => true,
            Self::ConfirmDestructive => tool.is_destructive(),
        }
    }
}

impl fmt::Display for ToolExecutionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolExecutionPolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "never" | "never_confirm" => Ok(Self::NeverConfirm),
            "always" | "always_confirm" => Ok(Self::AlwaysConfirm),
            "destructive" | "confirm_destructive" => Ok(Self::ConfirmDestructive),
            other => Err(format!(
                "unknown tool policy '{other}' (expected never, always or destructive)"
            )),
        }
    }
}

/// Which tools the model may use and how calls are confirmed.
///
/// Shared by reference for the duration of a turn.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ToolSettings {
    pub tools: BTreeSet<String>,
    pub execution_policy: ToolExecutionPolicy,
}

impl ToolSettings {
    pub fn new<I, S>(tools: I, execution_policy: ToolExecutionPolicy) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tools: tools.into_iter().map(Into::into).collect(),
            execution_policy,
        }
    }

    pub fn is_enabled(&self, tool_name: &str) -> bool {
        self.tools.contains(tool_name)
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolExecutionResult {
    pub tool_name: String,
    pub success: bool,
    pub result: Option<String>,
    pub error_message: Option<String>,
}

impl ToolExecutionResult {
    pub fn success(tool_name: impl Into<String>, result: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            success: true,
            result: Some(result.into()),
            error_message: None,
        }
    }

    pub fn failure(tool_name: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            success: false,
            result: None,
            error_message: Some(non_empty_error(error_message.into())),
        }
    }

    /// A failed call that still produced output worth showing to the model.
    pub fn partial_failure(
        tool_name: impl Into<String>,
        result: impl Into<String>,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            tool_name: tool_name.into(),
            success: false,
            result: Some(result.into()),
            error_message: Some(non_empty_error(error_message.into())),
        }
    }

    /// True when the model has something to continue from.
    pub fn is_productive(&self) -> bool {
        self.success || self.result.as_deref().is_some_and(|text| !text.is_empty())
    }

    /// Content recorded in the `tool` message for this call.
    pub fn ledger_content(&self) -> String {
        if self.success {
            return self.result.clone().unwrap_or_default();
        }

        format!("Error: {}", self.error_message.as_deref().unwrap_or_default())
    }
}

fn non_empty_error(message: String) -> String {
    if message.trim().is_empty() {
        "Unknown error".to_string()
    } else {
        message
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolError {
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("{0}")]
    Failed(String),
}

impl ToolError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    pub fn invalid_arguments(message: impl Into<String>) -> Self {
        Self::InvalidArguments(message.into())
    }
}

/// A named, callable tool the model can request.
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema for the arguments object.
    fn parameters_schema(&self) -> Value;

    /// Whether `ConfirmDestructive` asks before running this tool.
    ///
    /// Tools that do not classify themselves are treated as destructive.
    fn is_destructive(&self) -> bool {
        true
    }

    fn call(&self, arguments: &Map<String, Value>) -> Result<String, ToolError>;
}

type ToolBody = dyn Fn(&Map<String, Value>) -> Result<String, ToolError> + Send + Sync;

/// Wraps a plain closure as a [`Tool`].
pub struct FnTool {
    name: String,
    description: String,
    schema: Value,
    destructive: bool,
    body: Box<ToolBody>,
}

impl FnTool {
    pub fn new<F>(
        name: impl Into<String>,
        description: impl Into<String>,
        schema: Value,
        body: F,
    ) -> Self
    where
        F: Fn(&Map<String, Value>) -> Result<String, ToolError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            schema,
            destructive: true,
            body: Box::new(body),
        }
    }

    pub fn read_only(mut self) -> Self {
        self.destructive = false;
        self
    }
}

impl fmt::Debug for FnTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTool")
            .field("name", &self.name)
            .field("destructive", &self.destructive)
            .finish_non_exhaustive()
    }
}

impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        self.schema.clone()
    }

    fn is_destructive(&self) -> bool {
        self.destructive
    }

    fn call(&self, arguments: &Map<String, Value>) -> Result<String, ToolError> {
        (self.body)(arguments)
    }
}

/// Tools keyed by name, iterated in name order.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `tool`, returning the tool it replaced, if any.
    pub fn register(&mut self, tool: impl Tool + 'static) -> Option<Arc<dyn Tool>> {
        self.register_arc(Arc::new(tool))
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) -> Option<Arc<dyn Tool>> {
        let name = tool.name().to_string();
        let replaced = self.tools.insert(name.clone(), tool);
        if replaced.is_some() {
            warn!(tool = %name, "replaced previously registered tool");
        }
        replaced
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Tool>> {
        self.tools.values()
    }
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ToolGateway {
    registry: ToolRegistry,
}

impl ToolGateway {
    pub fn new(registry: ToolRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Definitions advertised to the model: enabled and registered, by name.
    pub fn definitions(&self, settings: &ToolSettings) -> Vec<ToolDefinition> {
        self.registry
            .iter()
            .filter(|tool| settings.is_enabled(tool.name()))
            .map(|tool| ToolDefinition {
                name: tool.name().to_string(),
                description: Some(tool.description().to_string()),
                input_schema: tool.parameters_schema(),
            })
            .collect()
    }

    /// Runs one tool call under `settings`.
    ///
    /// Never returns an error; every outcome is folded into the result.
    pub fn execute(
        &self,
        tool_name: &str,
        arguments: &Map<String, Value>,
        settings: &ToolSettings,
        confirm: &mut ConfirmFn<'_>,
    ) -> ToolExecutionResult {
        if !settings.is_enabled(tool_name) {
            warn!(tool = tool_name, "rejected call to disabled tool");
            return ToolExecutionResult::failure(
                tool_name,
                format!("Tool '{tool_name}' is not enabled"),
            );
        }

        let Some(tool) = self.registry.get(tool_name) else {
            warn!(tool = tool_name, "enabled tool has no implementation");
            return ToolExecutionResult::failure(
                tool_name,
                format!("Tool '{tool_name}' is not available"),
            );
        };

        if settings
            .execution_policy
            .requires_confirmation(tool.as_ref())
        {
            let approved = confirm(tool_name, arguments);
            debug!(tool = tool_name, approved, "tool confirmation decided");
            if !approved {
                return ToolExecutionResult::failure(tool_name, DENIED_BY_USER);
            }
        }

        match catch_unwind(AssertUnwindSafe(|| tool.call(arguments))) {
            Ok(Ok(output)) => {
                debug!(tool = tool_name, bytes = output.len(), "tool succeeded");
                ToolExecutionResult::success(tool_name, output)
            }
            Ok(Err(error)) => {
                debug!(tool = tool_name, %error, "tool failed");
                ToolExecutionResult::failure(tool_name, error.to_string())
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!(tool = tool_name, panic = %message, "tool panicked");
                ToolExecutionResult::failure(
                    tool_name,
                    format!("Tool '{tool_name}' panicked: {message}"),
                )
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Reads a required string argument.
pub fn required_str<'a>(arguments: &'a Map<String, Value>, key: &str) -> Result<&'a str, ToolError> {
    match arguments.get(key) {
        Some(Value::String(value)) => Ok(value),
        Some(_) => Err(ToolError::invalid_arguments(format!("'{key}' must be a string"))),
        None => Err(ToolError::invalid_arguments(format!("missing '{key}'"))),
    }
}

pub fn optional_str<'a>(
    arguments: &'a Map<String, Value>,
    key: &str,
) -> Result<Option<&'a str>, ToolError> {
    match arguments.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) => Ok(Some(value)),
        Some(_) => Err(ToolError::invalid_arguments(format!("'{key}' must be a string"))),
    }
}

pub fn optional_u64(arguments: &Map<String, Value>, key: &str) -> Result<Option<u64>, ToolError> {
    match arguments.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value.as_u64().map(Some).ok_or_else(|| {
            ToolError::invalid_arguments(format!("'{key}' must be a non-negative integer"))
        }),
    }
}
