use url::Url;

use crate::error::OllamaApiError;

/// Default local Ollama server.
pub const DEFAULT_OLLAMA_BASE_URL: &str = "http://localhost:11434";

/// Parse and normalize a server root.
///
/// Normalization rules:
/// 1) blank input falls back to [`DEFAULT_OLLAMA_BASE_URL`]
/// 2) a bare `host:port` gets an `http://` scheme (the `OLLAMA_HOST` convention)
/// 3) a trailing `/api` segment is dropped so endpoints are not doubled
/// 4) only `http` and `https` are accepted
pub fn normalize_base_url(input: &str) -> Result<Url, OllamaApiError> {
    let trimmed = input.trim();
    let raw = if trimmed.is_empty() {
        DEFAULT_OLLAMA_BASE_URL.to_string()
    } else if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    };

    let mut url =
        Url::parse(&raw).map_err(|error| OllamaApiError::InvalidBaseUrl(format!("{raw}: {error}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(OllamaApiError::InvalidBaseUrl(format!(
            "{raw}: unsupported scheme '{}'",
            url.scheme()
        )));
    }

    let path = url.path().trim_end_matches('/');
    let path = path.strip_suffix("/api").unwrap_or(path).to_string();
    url.set_path(&format!("{path}/"));
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

/// Join an `api/...` path onto a normalized base.
pub fn endpoint(base: &Url, path: &str) -> Result<Url, OllamaApiError> {
    base.join(path.trim_start_matches('/'))
        .map_err(|error| OllamaApiError::InvalidBaseUrl(format!("{base}{path}: {error}")))
}
