use std::collections::BTreeMap;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use crate::config::OllamaApiConfig;
use crate::error::OllamaApiError;

pub const HEADER_ACCEPT: &str = "accept";
pub const HEADER_CONTENT_TYPE: &str = "content-type";
pub const HEADER_USER_AGENT: &str = "user-agent";

/// Build a deterministic header map for Ollama requests.
pub fn build_headers(config: &OllamaApiConfig) -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();

    headers.insert(HEADER_ACCEPT.to_owned(), "application/x-ndjson".to_owned());
    headers.insert(
        HEADER_CONTENT_TYPE.to_owned(),
        "application/json".to_owned(),
    );

    let ua = config
        .user_agent
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map_or_else(default_user_agent, ToOwned::to_owned);
    headers.insert(HEADER_USER_AGENT.to_owned(), ua);

    for (key, value) in &config.extra_headers {
        headers.insert(key.trim().to_ascii_lowercase(), value.trim().to_owned());
    }

    headers
}

/// Convert the deterministic map into a reqwest header map.
pub fn to_header_map(headers: &BTreeMap<String, String>) -> Result<HeaderMap, OllamaApiError> {
    let mut out = HeaderMap::new();
    for (key, value) in headers {
        out.insert(
            HeaderName::from_bytes(key.as_bytes())
                .map_err(|_| OllamaApiError::InvalidHeader(format!("invalid header key: {key}")))?,
            HeaderValue::from_str(value)
                .map_err(|_| OllamaApiError::InvalidHeader(format!("invalid value for {key}")))?,
        );
    }
    Ok(out)
}

fn default_user_agent() -> String {
    format!(
        "tool-chat/{} ({}; {})",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extra_headers_are_normalized_and_override_defaults() {
        let config = OllamaApiConfig::default().with_headers([
            (" Authorization ".to_string(), " Bearer token ".to_string()),
            ("Accept".to_string(), "application/json".to_string()),
        ]);

        let headers = build_headers(&config);

        assert_eq!(headers.get("authorization").map(String::as_str), Some("Bearer token"));
        assert_eq!(headers.get(HEADER_ACCEPT).map(String::as_str), Some("application/json"));
        assert!(headers[HEADER_USER_AGENT].starts_with("tool-chat/"));
        assert!(to_header_map(&headers).is_ok());
    }

    #[test]
    fn invalid_header_name_is_rejected() {
        let config = OllamaApiConfig::default().insert_header("bad header", "x");

        let error = to_header_map(&build_headers(&config)).expect_err("space in name");

        assert!(matches!(error, OllamaApiError::InvalidHeader(_)));
    }
}
