use std::fmt;

use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Error as JsonError;

#[derive(Debug)]
pub enum OllamaApiError {
    InvalidBaseUrl(String),
    InvalidHeader(String),
    Request(reqwest::Error),
    Status(StatusCode, String),
    MalformedChunk(String),
    Serde(JsonError),
    RetryExhausted {
        status: Option<StatusCode>,
        last_error: Option<String>,
    },
    StreamFailed {
        message: String,
    },
    IncompleteStream,
    Cancelled,
}

impl OllamaApiError {
    /// Status errors that mean the requested model is not installed.
    pub fn is_model_not_found(&self) -> bool {
        matches!(self, Self::Status(status, _) if *status == StatusCode::NOT_FOUND)
    }
}

/// Ollama reports failures as `{"error": "<text>"}`.
#[derive(Debug, Deserialize)]
pub(crate) struct ErrorPayload {
    pub error: Option<String>,
}

impl fmt::Display for OllamaApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidBaseUrl(value) => write!(f, "invalid base URL: {value}"),
            Self::InvalidHeader(message) => write!(f, "invalid header: {message}"),
            Self::Request(error) => write!(f, "request error: {error}"),
            Self::Status(status, message) => write!(f, "HTTP {status} {message}"),
            Self::MalformedChunk(message) => write!(f, "malformed stream chunk: {message}"),
            Self::Serde(error) => write!(f, "serialization error: {error}"),
            Self::RetryExhausted { status, last_error } => {
                let status = status
                    .map(|status| status.as_u16().to_string())
                    .unwrap_or_else(|| "n/a".to_owned());
                write!(
                    f,
                    "retry exhausted after max attempts (status: {status}, last_error: {last_error:?})"
                )
            }
            Self::StreamFailed { message } => write!(f, "stream failed: {message}"),
            Self::IncompleteStream => write!(f, "stream ended without a final chunk"),
            Self::Cancelled => write!(f, "request was cancelled"),
        }
    }
}

impl std::error::Error for OllamaApiError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Request(error) => Some(error),
            Self::Serde(error) => Some(error),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for OllamaApiError {
    fn from(error: reqwest::Error) -> Self {
        Self::Request(error)
    }
}

impl From<JsonError> for OllamaApiError {
    fn from(error: JsonError) -> Self {
        Self::Serde(error)
    }
}

/// Human-readable message for a failed response body.
pub fn parse_error_message(status: StatusCode, body: &str) -> String {
    let explicit = serde_json::from_str::<ErrorPayload>(body)
        .ok()
        .and_then(|payload| payload.error)
        .map(|message| message.trim().to_string())
        .filter(|message| !message.is_empty());
    if let Some(message) = explicit {
        return message;
    }

    let body = body.trim();
    if body.is_empty() {
        status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string()
    } else {
        body.to_string()
    }
}
