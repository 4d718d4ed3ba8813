use std::future::Future;
use std::sync::{atomic::AtomicBool, atomic::Ordering, Arc};
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use url::Url;

use crate::config::OllamaApiConfig;
use crate::error::{parse_error_message, OllamaApiError};
use crate::events::{ChatChunk, ModelTag, ShowResponse, TagsResponse};
use crate::headers::{build_headers, to_header_map};
use crate::ndjson::NdjsonStreamParser;
use crate::payload::{ChatPayload, ShowPayload};
use crate::retry::is_retryable_http_error;
use crate::url::{endpoint, normalize_base_url};

/// Optional cancellation signal shared across request and stream loops.
pub type CancellationSignal = Arc<AtomicBool>;

const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug)]
pub struct OllamaApiClient {
    http: Client,
    config: OllamaApiConfig,
    base: Url,
}

#[derive(Debug, Clone)]
pub struct StreamResult {
    pub chunks: Vec<ChatChunk>,
}

impl StreamResult {
    pub fn content(&self) -> String {
        self.chunks.iter().map(ChatChunk::content).collect()
    }
}

impl OllamaApiClient {
    pub fn new(config: OllamaApiConfig) -> Result<Self, OllamaApiError> {
        let base = normalize_base_url(&config.base_url)?;
        let mut builder = Client::builder();
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder.build().map_err(OllamaApiError::from)?;
        Ok(Self { http, config, base })
    }

    pub fn config(&self) -> &OllamaApiConfig {
        &self.config
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn request(&self, method: reqwest::Method, path: &str) -> Result<RequestBuilder, OllamaApiError> {
        let url = endpoint(&self.base, path)?;
        let headers = to_header_map(&build_headers(&self.config))?;
        Ok(self.http.request(method, url).headers(headers))
    }

    fn build_chat_request(&self, payload: &ChatPayload) -> Result<RequestBuilder, OllamaApiError> {
        let payload = self.payload_with_transport_defaults(payload);
        Ok(self
            .request(reqwest::Method::POST, "api/chat")?
            .json(&payload))
    }

    fn payload_with_transport_defaults(&self, payload: &ChatPayload) -> ChatPayload {
        let mut payload = payload.clone();
        payload.stream = true;
        if payload.keep_alive.is_none() {
            payload.keep_alive = self.config.keep_alive.clone();
        }
        payload
    }

    /// Send with exponential backoff. Only the initial connection and status
    /// are retried; the returned response body has not been read.
    pub async fn send_with_retry<B>(
        &self,
        build: B,
        cancellation: Option<&CancellationSignal>,
    ) -> Result<Response, OllamaApiError>
    where
        B: Fn() -> Result<RequestBuilder, OllamaApiError>,
    {
        let policy = self.config.retry;
        let mut last_status: Option<StatusCode> = None;
        let mut last_error = None;

        for attempt in 0..=policy.max_retries {
            if is_cancelled(cancellation) {
                return Err(OllamaApiError::Cancelled);
            }

            let response = build()?.send();
            let response = await_or_cancel(response, cancellation)
                .await?
                .map_err(OllamaApiError::from);

            match response {
                Ok(response) => {
                    if response.status().is_success() {
                        return Ok(response);
                    }

                    let status = response.status();
                    last_status = Some(status);
                    let body = await_or_cancel(response.text(), cancellation)
                        .await?
                        .unwrap_or_default();
                    let message = parse_error_message(status, &body);
                    last_error = Some(message.clone());

                    if attempt < policy.max_retries && is_retryable_http_error(status.as_u16(), &body)
                    {
                        await_or_cancel(tokio::time::sleep(policy.delay(attempt)), cancellation)
                            .await?;
                        continue;
                    }

                    return Err(OllamaApiError::Status(status, message));
                }
                Err(error) => {
                    last_error = Some(error.to_string());
                    if attempt < policy.max_retries {
                        await_or_cancel(tokio::time::sleep(policy.delay(attempt)), cancellation)
                            .await?;
                        continue;
                    }
                    return Err(OllamaApiError::RetryExhausted {
                        status: last_status,
                        last_error,
                    });
                }
            }
        }

        Err(OllamaApiError::RetryExhausted {
            status: last_status,
            last_error,
        })
    }

    /// Stream one chat turn, handing every parsed chunk to `on_chunk` as it
    /// arrives. Fails with [`OllamaApiError::IncompleteStream`] when the body
    /// ends before a `done` chunk.
    pub async fn stream_chat_with_handler<F>(
        &self,
        payload: &ChatPayload,
        cancellation: Option<&CancellationSignal>,
        mut on_chunk: F,
    ) -> Result<(), OllamaApiError>
    where
        F: FnMut(ChatChunk),
    {
        let response = self
            .send_with_retry(|| self.build_chat_request(payload), cancellation)
            .await?;
        let mut bytes = response.bytes_stream();
        let mut parser = NdjsonStreamParser::default();
        let mut done = false;

        loop {
            let Some(chunk) = await_or_cancel(bytes.next(), cancellation).await? else {
                break;
            };
            if is_cancelled(cancellation) {
                return Err(OllamaApiError::Cancelled);
            }
            let chunk = chunk.map_err(OllamaApiError::from)?;
            for parsed in parser.feed(&chunk) {
                process_chunk(parsed, &mut done, &mut on_chunk)?;
            }
        }

        if let Some(parsed) = parser.finish() {
            process_chunk(parsed, &mut done, &mut on_chunk)?;
        }

        if is_cancelled(cancellation) {
            return Err(OllamaApiError::Cancelled);
        }
        if !done {
            return Err(OllamaApiError::IncompleteStream);
        }

        Ok(())
    }

    pub async fn chat_stream(
        &self,
        payload: &ChatPayload,
        cancellation: Option<&CancellationSignal>,
    ) -> Result<StreamResult, OllamaApiError> {
        let mut chunks = Vec::new();
        self.stream_chat_with_handler(payload, cancellation, |chunk| chunks.push(chunk))
            .await?;
        Ok(StreamResult { chunks })
    }

    /// Installed models from `GET /api/tags`.
    pub async fn list_models(
        &self,
        cancellation: Option<&CancellationSignal>,
    ) -> Result<Vec<ModelTag>, OllamaApiError> {
        let response = self
            .send_with_retry(|| self.request(reqwest::Method::GET, "api/tags"), cancellation)
            .await?;
        let tags = await_or_cancel(response.json::<TagsResponse>(), cancellation).await??;
        Ok(tags.models)
    }

    /// Model details from `POST /api/show`.
    pub async fn show_model(
        &self,
        model: &str,
        cancellation: Option<&CancellationSignal>,
    ) -> Result<ShowResponse, OllamaApiError> {
        let payload = ShowPayload {
            model: model.to_string(),
        };
        let response = self
            .send_with_retry(
                || Ok(self.request(reqwest::Method::POST, "api/show")?.json(&payload)),
                cancellation,
            )
            .await?;
        Ok(await_or_cancel(response.json::<ShowResponse>(), cancellation).await??)
    }

    /// Context length of `model`, `None` when the model is not installed or
    /// reports no length.
    pub async fn context_length(
        &self,
        model: &str,
        cancellation: Option<&CancellationSignal>,
    ) -> Result<Option<u64>, OllamaApiError> {
        match self.show_model(model, cancellation).await {
            Ok(show) => Ok(show.context_length()),
            Err(error) if error.is_model_not_found() => Ok(None),
            Err(error) => Err(error),
        }
    }
}

fn process_chunk<F>(
    parsed: Result<ChatChunk, OllamaApiError>,
    done: &mut bool,
    on_chunk: &mut F,
) -> Result<(), OllamaApiError>
where
    F: FnMut(ChatChunk),
{
    let chunk = parsed?;
    if let Some(message) = chunk.error.as_deref() {
        return Err(OllamaApiError::StreamFailed {
            message: message.to_string(),
        });
    }

    if chunk.done {
        *done = true;
    }

    on_chunk(chunk);
    Ok(())
}

fn is_cancelled(cancel: Option<&CancellationSignal>) -> bool {
    cancel.is_some_and(|token| token.load(Ordering::Acquire))
}

async fn await_or_cancel<F>(
    future: F,
    cancellation: Option<&CancellationSignal>,
) -> Result<F::Output, OllamaApiError>
where
    F: Future,
{
    if cancellation.is_none() {
        return Ok(future.await);
    }

    let mut future = Box::pin(future);

    loop {
        if is_cancelled(cancellation) {
            return Err(OllamaApiError::Cancelled);
        }

        if let Ok(output) = tokio::time::timeout(CANCEL_POLL_INTERVAL, &mut future).await {
            if is_cancelled(cancellation) {
                return Err(OllamaApiError::Cancelled);
            }
            return Ok(output);
        }
    }
}
