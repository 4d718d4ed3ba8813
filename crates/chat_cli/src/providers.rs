//! Backend selection from [`ChatConfig`].

use std::sync::Arc;

use chat_provider::{ChatProvider, ModelCatalog, ProviderInitError};
use chat_provider_mock::{ScriptedProvider, MOCK_MODEL_ID};
use chat_provider_ollama::{OllamaProvider, OllamaProviderConfig};
use tool_chat::{ChatConfig, ProviderKind};

pub const DEFAULT_OLLAMA_MODEL: &str = "llama3.1:8b";

/// The streaming provider and the catalog the accountant and `/models` use.
///
/// Both usually point at the same backend object.
#[derive(Clone)]
pub struct Backend {
    pub provider: Arc<dyn ChatProvider>,
    pub catalog: Arc<dyn ModelCatalog>,
    pub default_model: String,
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("provider", &self.provider.profile())
            .field("default_model", &self.default_model)
            .finish_non_exhaustive()
    }
}

pub fn backend_from_config(config: &ChatConfig) -> Result<Backend, ProviderInitError> {
    match config.provider {
        ProviderKind::Mock => {
            let provider = Arc::new(ScriptedProvider::echo());
            Ok(Backend {
                provider: provider.clone(),
                catalog: provider,
                default_model: config
                    .model
                    .clone()
                    .unwrap_or_else(|| MOCK_MODEL_ID.to_string()),
            })
        }
        ProviderKind::Ollama => {
            let default_model = config
                .model
                .clone()
                .unwrap_or_else(|| DEFAULT_OLLAMA_MODEL.to_string());
            let mut provider_config = OllamaProviderConfig::new(default_model.clone());
            if let Some(host) = &config.ollama_host {
                provider_config = provider_config.with_base_url(normalize_host(host));
            }
            if let Some(timeout) = config.request_timeout {
                provider_config = provider_config.with_timeout(timeout);
            }
            if !config.ollama_headers.is_empty() {
                provider_config = provider_config.with_headers(config.ollama_headers.clone());
            }

            let provider = Arc::new(OllamaProvider::new(provider_config)?);
            Ok(Backend {
                provider: provider.clone(),
                catalog: provider,
                default_model,
            })
        }
    }
}

/// `OLLAMA_HOST` is often given as `host:port`; the client needs a URL.
fn normalize_host(host: &str) -> String {
    let host = host.trim().trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("http://{host}")
    }
}
