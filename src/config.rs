//! Environment configuration.

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::engine::DEFAULT_MAX_TOOL_DEPTH;
use crate::gateway::ToolExecutionPolicy;
use crate::supervisor::DEFAULT_SUMMARY_INTERVAL;

pub const DEFAULT_LOG_LEVEL: &str = "warn";
pub const DEFAULT_SESSIONS_DIR: &str = "./chat_sessions";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProviderKind {
    #[default]
    Ollama,
    Mock,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ollama => "ollama",
            Self::Mock => "mock",
        })
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ollama" => Ok(Self::Ollama),
            "mock" => Ok(Self::Mock),
            other => Err(format!("unknown provider '{other}' (expected ollama or mock)")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatConfig {
    pub provider: ProviderKind,
    pub ollama_host: Option<String>,
    /// Extra headers sent to Ollama, from `Name=value` pairs.
    pub ollama_headers: Vec<(String, String)>,
    pub model: Option<String>,
    pub sessions_dir: PathBuf,
    /// Session to resume instead of starting a new one.
    pub session_id: Option<String>,
    /// Enabled tool names; `None` enables every built-in tool.
    pub tools: Option<Vec<String>>,
    pub tool_policy: ToolExecutionPolicy,
    pub max_tool_depth: usize,
    pub system_prompt: Option<String>,
    pub summary_enabled: bool,
    pub summary_interval: Duration,
    pub request_timeout: Option<Duration>,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
    /// Values that were present but unusable; reported once logging is up.
    pub warnings: Vec<String>,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::default(),
            ollama_host: None,
            ollama_headers: Vec::new(),
            model: None,
            sessions_dir: PathBuf::from(DEFAULT_SESSIONS_DIR),
            session_id: None,
            tools: None,
            tool_policy: ToolExecutionPolicy::AlwaysConfirm,
            max_tool_depth: DEFAULT_MAX_TOOL_DEPTH,
            system_prompt: None,
            summary_enabled: false,
            summary_interval: DEFAULT_SUMMARY_INTERVAL,
            request_timeout: None,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            log_file: None,
            warnings: Vec::new(),
        }
    }
}

impl ChatConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let mut warnings = Vec::new();

        let provider = env_parsed("TOOL_CHAT_PROVIDER", &mut warnings).unwrap_or(defaults.provider);
        let tool_policy =
            env_parsed("TOOL_CHAT_TOOL_POLICY", &mut warnings).unwrap_or(defaults.tool_policy);
        let max_tool_depth = env_parsed::<usize>("TOOL_CHAT_MAX_TOOL_DEPTH", &mut warnings)
            .unwrap_or(defaults.max_tool_depth);
        let summary_interval = env_parsed::<u64>("TOOL_CHAT_SUMMARY_INTERVAL_SEC", &mut warnings)
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(defaults.summary_interval);
        let request_timeout = env_parsed::<u64>("TOOL_CHAT_TIMEOUT_SEC", &mut warnings)
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        Self {
            provider,
            ollama_host: env_string_opt("OLLAMA_HOST"),
            ollama_headers: env_headers("TOOL_CHAT_OLLAMA_HEADERS", &mut warnings),
            model: env_string_opt("TOOL_CHAT_MODEL"),
            sessions_dir: env_string_opt("TOOL_CHAT_SESSIONS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.sessions_dir),
            session_id: env_string_opt("TOOL_CHAT_SESSION"),
            tools: env_list_opt("TOOL_CHAT_TOOLS"),
            tool_policy,
            max_tool_depth,
            system_prompt: env_string_opt("TOOL_CHAT_SYSTEM_PROMPT"),
            summary_enabled: env_flag("TOOL_CHAT_SUMMARY"),
            summary_interval,
            request_timeout,
            log_level: env_string_opt("TOOL_CHAT_LOG_LEVEL").unwrap_or(defaults.log_level),
            log_file: env_string_opt("TOOL_CHAT_LOG_FILE").map(PathBuf::from),
            warnings,
        }
    }
}

fn env_flag(key: &str) -> bool {
    env::var(key).map(|value| value == "1").unwrap_or(false)
}

fn env_string_opt(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        if value.trim().is_empty() {
            None
        } else {
            Some(value)
        }
    })
}

/// Comma separated, blanks dropped. An explicitly empty list disables every tool.
fn env_list_opt(key: &str) -> Option<Vec<String>> {
    let value = env::var(key).ok()?;
    Some(
        value
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect(),
    )
}

/// Comma separated `Name=value` pairs; malformed entries are skipped with a warning.
fn env_headers(key: &str, warnings: &mut Vec<String>) -> Vec<(String, String)> {
    let Some(raw) = env_string_opt(key) else {
        return Vec::new();
    };

    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| match entry.split_once('=') {
            Some((name, value)) if !name.trim().is_empty() => {
                Some((name.trim().to_string(), value.trim().to_string()))
            }
            _ => {
                warnings.push(format!("ignoring {key} entry {entry:?}: expected Name=value"));
                None
            }
        })
        .collect()
}

fn env_parsed<T>(key: &str, warnings: &mut Vec<String>) -> Option<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    let raw = env_string_opt(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(error) => {
            warnings.push(format!("ignoring {key}={raw:?}: {error}"));
            None
        }
    }
}
