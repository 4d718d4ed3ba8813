use std::collections::BTreeMap;
use std::time::Duration;

use crate::retry::RetryPolicy;
use crate::url::DEFAULT_OLLAMA_BASE_URL;

/// Transport configuration for Ollama API requests.
#[derive(Debug, Clone)]
pub struct OllamaApiConfig {
    /// Server root, e.g. `http://localhost:11434`.
    pub base_url: String,
    /// Optional `User-Agent` override.
    pub user_agent: Option<String>,
    /// Additional headers merged into request headers.
    pub extra_headers: BTreeMap<String, String>,
    /// Optional whole-request timeout. Streaming chat turns can be long, so
    /// there is none by default.
    pub timeout: Option<Duration>,
    /// Optional `keep_alive` forwarded with chat requests.
    pub keep_alive: Option<String>,
    pub retry: RetryPolicy,
}

impl Default for OllamaApiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_OLLAMA_BASE_URL.to_string(),
            user_agent: None,
            extra_headers: BTreeMap::new(),
            timeout: None,
            keep_alive: None,
            retry: RetryPolicy::default(),
        }
    }
}

impl OllamaApiConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: impl Into<String>) -> Self {
        self.keep_alive = Some(keep_alive.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn insert_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.insert(key.into(), value.into());
        self
    }

    pub fn with_headers(mut self, headers: impl IntoIterator<Item = (String, String)>) -> Self {
        self.extra_headers.extend(headers);
        self
    }
}
