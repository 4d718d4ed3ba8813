//! Transport-only Ollama HTTP client primitives.
//!
//! This crate owns request building, retry and response parsing for the
//! Ollama `/api/chat`, `/api/tags` and `/api/show` endpoints. It knows nothing
//! about conversation ledgers or tool execution; the provider adapter maps its
//! wire types onto the shared chat contract.
//!
//! Streaming responses are newline-delimited JSON. [`NdjsonStreamParser`]
//! turns arbitrary byte chunks into [`ChatChunk`] values, and an in-stream
//! `{"error": ...}` line surfaces as [`OllamaApiError::StreamFailed`].

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod headers;
pub mod ndjson;
pub mod payload;
pub mod retry;
pub mod url;

pub use client::{CancellationSignal, OllamaApiClient, StreamResult};
pub use config::OllamaApiConfig;
pub use error::OllamaApiError;
pub use events::{ChatChunk, ChunkMessage, ModelTag, ShowResponse, TagsResponse, WireToolCall};
pub use ndjson::NdjsonStreamParser;
pub use payload::{ChatPayload, WireMessage, WireTool};
pub use retry::RetryPolicy;
pub use reqwest::StatusCode;
pub use url::{normalize_base_url, DEFAULT_OLLAMA_BASE_URL};
