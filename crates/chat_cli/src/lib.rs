//! Interactive `tool-chat` binary crate.
//!
//! ## Backend selection
//!
//! - `TOOL_CHAT_PROVIDER=ollama` (default) talks to `OLLAMA_HOST`
//!   (default `http://localhost:11434`) with `TOOL_CHAT_MODEL`.
//!   `TOOL_CHAT_OLLAMA_HEADERS` adds `Name=value` request headers.
//! - `TOOL_CHAT_PROVIDER=mock` echoes input locally; useful without a server.
//!
//! ## Tools
//!
//! Built-in tools operate inside the directory `tool-chat` was started in.
//! `TOOL_CHAT_TOOLS` narrows the enabled set (comma separated, empty for none)
//! and `TOOL_CHAT_TOOL_POLICY` picks when the `[y/N]` prompt appears.
//!
//! ## Sessions
//!
//! Every change is saved as JSON under `TOOL_CHAT_SESSIONS_DIR`. Set
//! `TOOL_CHAT_SESSION=<id>` to resume one at startup, or use `/sessions <id>`
//! inside the chat.

pub mod app;
pub mod commands;
pub mod interrupt;
pub mod providers;
pub mod tools;

use tool_chat::{ChatConfig, ToolRegistry, ToolSettings};
use tracing::warn;

/// Enabled tools for `config`, limited to what `registry` provides.
///
/// Unknown names are dropped with a warning.
pub fn tool_settings(config: &ChatConfig, registry: &ToolRegistry) -> ToolSettings {
    let names = match &config.tools {
        None => registry.names(),
        Some(requested) => requested
            .iter()
            .filter(|name| {
                let known = registry.get(name).is_some();
                if !known {
                    warn!(tool = %name, "ignoring unknown tool in TOOL_CHAT_TOOLS");
                }
                known
            })
            .cloned()
            .collect(),
    };

    ToolSettings::new(names, config.tool_policy)
}

#[cfg(test)]
mod tests {
    use tool_chat::ToolExecutionPolicy;

    use super::*;
    use crate::tools::{builtin_registry, BUILTIN_TOOL_NAMES, READ_FILE};

    #[test]
    fn unset_tool_list_enables_every_builtin() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = builtin_registry(dir.path()).expect("registry");

        let settings = tool_settings(&ChatConfig::default(), &registry);

        assert_eq!(settings.tools.len(), BUILTIN_TOOL_NAMES.len());
        assert_eq!(settings.execution_policy, ToolExecutionPolicy::AlwaysConfirm);
    }

    #[test]
    fn unknown_names_are_dropped_and_empty_list_disables_all() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = builtin_registry(dir.path()).expect("registry");

        let config = ChatConfig {
            tools: Some(vec![READ_FILE.to_string(), "teleport".to_string()]),
            tool_policy: ToolExecutionPolicy::NeverConfirm,
            ..ChatConfig::default()
        };
        let settings = tool_settings(&config, &registry);
        assert!(settings.is_enabled(READ_FILE));
        assert!(!settings.is_enabled("teleport"));
        assert_eq!(settings.tools.len(), 1);

        let config = ChatConfig {
            tools: Some(Vec::new()),
            ..ChatConfig::default()
        };
        assert!(tool_settings(&config, &registry).is_empty());
    }
}
