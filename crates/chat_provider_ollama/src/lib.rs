//! Ollama-backed implementation of the shared `chat_provider` contract.
//!
//! The engine consumes streams as blocking iterators while `ollama_api` is
//! async. Each request runs on a named worker thread that owns a
//! current-thread tokio runtime and forwards mapped events through a bounded
//! channel. Dropping the iterator cancels the worker.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chat_provider::{
    CancelSignal, ChatProvider, ChatRequest, EventStream, ModelCatalog, ModelInfo, ProviderError,
    ProviderInitError, ProviderProfile, RequestMessage, StreamEvent, ToolCall, ToolDefinition,
};
use ollama_api::{
    ChatChunk, ChatPayload, ModelTag, OllamaApiClient, OllamaApiConfig, OllamaApiError,
    WireMessage, WireTool, WireToolCall,
};

/// Stable provider identifier used by startup selection.
pub const OLLAMA_PROVIDER_ID: &str = "ollama";

const CHANNEL_CAPACITY: usize = 64;
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Runtime configuration for the Ollama provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OllamaProviderConfig {
    pub default_model: String,
    pub base_url: Option<String>,
    pub timeout: Option<Duration>,
    pub keep_alive: Option<String>,
    /// Extra request headers, e.g. for an authenticating proxy.
    pub headers: BTreeMap<String, String>,
}

impl OllamaProviderConfig {
    #[must_use]
    pub fn new(default_model: impl Into<String>) -> Self {
        Self {
            default_model: default_model.into(),
            base_url: None,
            timeout: None,
            keep_alive: None,
            headers: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_keep_alive(mut self, keep_alive: impl Into<String>) -> Self {
        self.keep_alive = Some(keep_alive.into());
        self
    }

    #[must_use]
    pub fn with_headers(mut self, headers: impl IntoIterator<Item = (String, String)>) -> Self {
        self.headers.extend(headers);
        self
    }

    fn into_api_config(self) -> OllamaApiConfig {
        let mut config = OllamaApiConfig::default().with_headers(self.headers);

        if let Some(base_url) = self.base_url {
            config = config.with_base_url(base_url);
        }

        if let Some(timeout) = self.timeout {
            config = config.with_timeout(timeout);
        }

        if let Some(keep_alive) = self.keep_alive {
            config = config.with_keep_alive(keep_alive);
        }

        config
    }
}

/// Blocking seam over the async client, one runtime per call.
trait Transport: Send + Sync + 'static {
    fn stream_chat(
        &self,
        payload: &ChatPayload,
        cancel: &CancelSignal,
        on_chunk: &mut dyn FnMut(ChatChunk),
    ) -> Result<(), OllamaApiError>;

    fn list_models(&self) -> Result<Vec<ModelTag>, OllamaApiError>;

    fn context_length(&self, model: &str) -> Result<Option<u64>, OllamaApiError>;
}

#[derive(Debug)]
struct HttpTransport {
    client: OllamaApiClient,
}

impl HttpTransport {
    fn block_on<F: std::future::Future>(future: F) -> Result<F::Output, OllamaApiError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|error| OllamaApiError::StreamFailed {
                message: format!("failed to initialize tokio runtime: {error}"),
            })?;
        Ok(runtime.block_on(future))
    }
}

impl Transport for HttpTransport {
    fn stream_chat(
        &self,
        payload: &ChatPayload,
        cancel: &CancelSignal,
        on_chunk: &mut dyn FnMut(ChatChunk),
    ) -> Result<(), OllamaApiError> {
        Self::block_on(
            self.client
                .stream_chat_with_handler(payload, Some(cancel), |chunk| on_chunk(chunk)),
        )?
    }

    fn list_models(&self) -> Result<Vec<ModelTag>, OllamaApiError> {
        Self::block_on(self.client.list_models(None))?
    }

    fn context_length(&self, model: &str) -> Result<Option<u64>, OllamaApiError> {
        Self::block_on(self.client.context_length(model, None))?
    }
}

/// `ChatProvider` and `ModelCatalog` adapter backed by `ollama_api`.
pub struct OllamaProvider {
    default_model: String,
    transport: Arc<dyn Transport>,
}

impl OllamaProvider {
    /// Creates a provider using real HTTP transport.
    pub fn new(config: OllamaProviderConfig) -> Result<Self, ProviderInitError> {
        let default_model = config.default_model.trim().to_string();
        let client = OllamaApiClient::new(config.into_api_config()).map_err(map_init_error)?;
        tracing::debug!(base_url = %client.base_url(), "ollama provider ready");

        Ok(Self {
            default_model,
            transport: Arc::new(HttpTransport { client }),
        })
    }

    #[cfg(test)]
    fn with_transport_for_tests(default_model: &str, transport: Arc<dyn Transport>) -> Self {
        Self {
            default_model: default_model.to_string(),
            transport,
        }
    }
}

impl ChatProvider for OllamaProvider {
    fn profile(&self) -> ProviderProfile {
        ProviderProfile {
            provider_id: OLLAMA_PROVIDER_ID.to_string(),
            model_id: self.default_model.clone(),
        }
    }

    fn stream_chat(
        &self,
        request: ChatRequest,
        cancel: CancelSignal,
    ) -> Result<EventStream, ProviderError> {
        if cancel.load(Ordering::Acquire) {
            return Err(ProviderError::Cancelled);
        }

        let payload = payload_from_request(request);
        let (sender, receiver) = mpsc::sync_channel(CHANNEL_CAPACITY);
        let worker_cancel: CancelSignal = Arc::new(AtomicBool::new(false));
        let transport = Arc::clone(&self.transport);

        let spawned = thread::Builder::new()
            .name("ollama-stream".to_string())
            .spawn({
                let worker_cancel = Arc::clone(&worker_cancel);
                move || run_stream_worker(transport.as_ref(), &payload, &worker_cancel, &sender)
            });
        if let Err(error) = spawned {
            return Err(ProviderError::Transport(format!(
                "failed to spawn stream worker: {error}"
            )));
        }

        Ok(Box::new(ChannelStream {
            receiver,
            turn_cancel: cancel,
            worker_cancel,
            finished: false,
        }))
    }
}

impl ModelCatalog for OllamaProvider {
    fn list_models(&self) -> Result<Vec<ModelInfo>, ProviderError> {
        let tags = self.transport.list_models().map_err(map_catalog_error)?;
        Ok(tags
            .into_iter()
            .map(|tag| ModelInfo {
                name: tag.name,
                context_length: None,
            })
            .collect())
    }

    fn context_length(&self, model_name: &str) -> Result<Option<u64>, ProviderError> {
        self.transport
            .context_length(model_name)
            .map_err(map_catalog_error)
    }
}

fn run_stream_worker(
    transport: &dyn Transport,
    payload: &ChatPayload,
    cancel: &CancelSignal,
    sender: &SyncSender<Result<StreamEvent, ProviderError>>,
) {
    let outcome = transport.stream_chat(payload, cancel, &mut |chunk| {
        if sender.send(Ok(event_from_chunk(chunk))).is_err() {
            // Receiver is gone; stop reading the body.
            cancel.store(true, Ordering::Release);
        }
    });

    if let Err(error) = outcome {
        if !cancel.load(Ordering::Acquire) {
            tracing::debug!(%error, "ollama stream failed");
        }
        let _ = sender.send(Err(map_stream_error(error)));
    }
}

struct ChannelStream {
    receiver: Receiver<Result<StreamEvent, ProviderError>>,
    turn_cancel: CancelSignal,
    worker_cancel: CancelSignal,
    finished: bool,
}

impl Iterator for ChannelStream {
    type Item = Result<StreamEvent, ProviderError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        loop {
            if self.turn_cancel.load(Ordering::Acquire) {
                self.worker_cancel.store(true, Ordering::Release);
                self.finished = true;
                return Some(Err(ProviderError::Cancelled));
            }

            match self.receiver.recv_timeout(CANCEL_POLL_INTERVAL) {
                Ok(item) => {
                    if item.is_err() {
                        self.finished = true;
                    }
                    return Some(item);
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    self.finished = true;
                    return None;
                }
            }
        }
    }
}

impl Drop for ChannelStream {
    fn drop(&mut self) {
        self.worker_cancel.store(true, Ordering::Release);
    }
}

fn payload_from_request(request: ChatRequest) -> ChatPayload {
    let messages = request.messages.iter().map(wire_message).collect();
    let tools = request.tools.iter().map(wire_tool).collect();
    ChatPayload::new(request.model, messages).with_tools(tools)
}

fn wire_message(message: &RequestMessage) -> WireMessage {
    let mut wire = WireMessage::new(message.role.as_str(), message.content.clone());
    if let Some(calls) = &message.tool_calls {
        wire.tool_calls = calls
            .iter()
            .map(|call| WireToolCall::new(call.tool_name.clone(), call.arguments.clone()))
            .collect();
    }
    wire.tool_name = message.tool_name.clone();
    wire
}

fn wire_tool(definition: &ToolDefinition) -> WireTool {
    WireTool::function(
        definition.name.clone(),
        definition.description.clone(),
        definition.input_schema.clone(),
    )
}

fn event_from_chunk(chunk: ChatChunk) -> StreamEvent {
    let tool_calls: Vec<ToolCall> = chunk
        .tool_calls()
        .iter()
        .map(|call| ToolCall::new(call.function.name.clone(), call.function.arguments_map()))
        .collect();

    StreamEvent {
        content_delta: chunk.content().to_string(),
        thinking_delta: chunk.thinking().to_string(),
        tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
        done: chunk.done,
        eval_count: chunk.eval_count,
        prompt_eval_count: chunk.prompt_eval_count,
    }
}

fn map_stream_error(error: OllamaApiError) -> ProviderError {
    match error {
        OllamaApiError::Cancelled => ProviderError::Cancelled,
        OllamaApiError::IncompleteStream => ProviderError::IncompleteStream,
        OllamaApiError::Status(status, message) => ProviderError::Status {
            status: status.as_u16(),
            message,
        },
        OllamaApiError::StreamFailed { message } => ProviderError::StreamFailed(message),
        error @ OllamaApiError::MalformedChunk(_) => ProviderError::StreamFailed(error.to_string()),
        error => ProviderError::Transport(error.to_string()),
    }
}

fn map_catalog_error(error: OllamaApiError) -> ProviderError {
    ProviderError::Catalog(error.to_string())
}

fn map_init_error(error: OllamaApiError) -> ProviderInitError {
    ProviderInitError::new(format!("Failed to initialize ollama provider: {error}"))
}

#[cfg(test)]
mod tests {
    use std::sync::{Mutex, MutexGuard};
    use std::time::Instant;

    use chat_provider::Role;
    use serde_json::json;

    use super::*;

    fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
        match mutex.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    enum FakeOutcome {
        Chunks(Vec<ChatChunk>, Option<OllamaApiError>),
        /// Emits chunks until cancelled, then reports whether it saw the signal.
        Endless,
    }

    struct FakeTransport {
        observed: Mutex<Vec<ChatPayload>>,
        outcome: Mutex<Option<FakeOutcome>>,
        saw_cancel: Arc<AtomicBool>,
    }

    impl FakeTransport {
        fn new(outcome: FakeOutcome) -> Arc<Self> {
            Arc::new(Self {
                observed: Mutex::new(Vec::new()),
                outcome: Mutex::new(Some(outcome)),
                saw_cancel: Arc::new(AtomicBool::new(false)),
            })
        }
    }

    impl Transport for FakeTransport {
        fn stream_chat(
            &self,
            payload: &ChatPayload,
            cancel: &CancelSignal,
            on_chunk: &mut dyn FnMut(ChatChunk),
        ) -> Result<(), OllamaApiError> {
            lock_unpoisoned(&self.observed).push(payload.clone());
            let outcome = lock_unpoisoned(&self.outcome).take();
            match outcome {
                Some(FakeOutcome::Chunks(chunks, error)) => {
                    for chunk in chunks {
                        on_chunk(chunk);
                    }
                    error.map_or(Ok(()), Err)
                }
                Some(FakeOutcome::Endless) => {
                    let started = Instant::now();
                    while started.elapsed() < Duration::from_secs(5) {
                        if cancel.load(Ordering::Acquire) {
                            self.saw_cancel.store(true, Ordering::Release);
                            return Err(OllamaApiError::Cancelled);
                        }
                        on_chunk(text_chunk("tick", false));
                        thread::sleep(Duration::from_millis(5));
                    }
                    Ok(())
                }
                None => Err(OllamaApiError::StreamFailed {
                    message: "fake transport used twice".to_string(),
                }),
            }
        }

        fn list_models(&self) -> Result<Vec<ModelTag>, OllamaApiError> {
            Ok(vec![ModelTag {
                name: "llama3.1:8b".to_string(),
                model: None,
                size: None,
                details: None,
            }])
        }

        fn context_length(&self, model: &str) -> Result<Option<u64>, OllamaApiError> {
            Ok((model == "llama3.1:8b").then_some(8192))
        }
    }

    fn text_chunk(text: &str, done: bool) -> ChatChunk {
        serde_json::from_value(json!({
            "model": "llama3.1:8b",
            "message": {"role": "assistant", "content": text},
            "done": done,
        }))
        .expect("chunk should build")
    }

    fn request() -> ChatRequest {
        ChatRequest {
            model: "llama3.1:8b".to_string(),
            messages: vec![
                RequestMessage::new(Role::User, "what time is it?"),
                RequestMessage {
                    role: Role::Assistant,
                    content: String::new(),
                    tool_calls: Some(vec![ToolCall::from_value("clock", json!({"tz": "UTC"}))]),
                    tool_name: None,
                },
                RequestMessage {
                    role: Role::Tool,
                    content: "09:00".to_string(),
                    tool_calls: None,
                    tool_name: Some("clock".to_string()),
                },
            ],
            tools: vec![ToolDefinition {
                name: "clock".to_string(),
                description: Some("Current time".to_string()),
                input_schema: json!({"type": "object"}),
            }],
        }
    }

    fn not_cancelled() -> CancelSignal {
        Arc::new(AtomicBool::new(false))
    }

    #[test]
    fn provider_config_carries_headers_into_api_config() {
        let api_config = OllamaProviderConfig::new("m")
            .with_base_url("http://gpu-box:11434")
            .with_headers([("X-Api-Key".to_string(), "secret".to_string())])
            .into_api_config();

        assert_eq!(api_config.base_url, "http://gpu-box:11434");
        assert_eq!(
            api_config.extra_headers.get("X-Api-Key").map(String::as_str),
            Some("secret")
        );
    }

    #[test]
    fn profile_reports_ollama_provider_id_and_default_model() {
        let provider = OllamaProvider::with_transport_for_tests(
            "llama3.1:8b",
            FakeTransport::new(FakeOutcome::Chunks(Vec::new(), None)),
        );

        let profile = provider.profile();
        assert_eq!(profile.provider_id, OLLAMA_PROVIDER_ID);
        assert_eq!(profile.model_id, "llama3.1:8b");
    }

    #[test]
    fn request_is_translated_to_wire_payload() {
        let transport = FakeTransport::new(FakeOutcome::Chunks(vec![text_chunk("", true)], None));
        let provider = OllamaProvider::with_transport_for_tests(
            "llama3.1:8b",
            Arc::clone(&transport) as Arc<dyn Transport>,
        );

        let events: Vec<_> = provider
            .stream_chat(request(), not_cancelled())
            .expect("stream should open")
            .collect();
        assert_eq!(events.len(), 1);

        let observed = lock_unpoisoned(&transport.observed);
        let payload = &observed[0];
        assert_eq!(payload.model, "llama3.1:8b");
        assert_eq!(payload.messages[1].role, "assistant");
        assert_eq!(payload.messages[1].tool_calls[0].function.name, "clock");
        assert_eq!(payload.messages[2].tool_name.as_deref(), Some("clock"));
        assert_eq!(payload.tools[0].function.name, "clock");
    }

    #[test]
    fn chunks_map_to_stream_events_with_tool_calls_and_usage() {
        let tool_chunk: ChatChunk = serde_json::from_value(json!({
            "message": {
                "role": "assistant",
                "content": "",
                "thinking": "hmm",
                "tool_calls": [{"function": {"name": "clock", "arguments": {"tz": "UTC"}}}]
            },
            "done": false
        }))
        .expect("chunk should build");
        let done_chunk: ChatChunk = serde_json::from_value(json!({
            "message": {"role": "assistant", "content": ""},
            "done": true,
            "eval_count": 150,
            "prompt_eval_count": 50
        }))
        .expect("chunk should build");
        let provider = OllamaProvider::with_transport_for_tests(
            "llama3.1:8b",
            FakeTransport::new(FakeOutcome::Chunks(vec![tool_chunk, done_chunk], None)),
        );

        let events: Vec<StreamEvent> = provider
            .stream_chat(request(), not_cancelled())
            .expect("stream should open")
            .collect::<Result<_, _>>()
            .expect("events should be ok");

        assert_eq!(events[0].thinking_delta, "hmm");
        assert_eq!(events[0].pending_tool_calls()[0].tool_name, "clock");
        assert_eq!(events[0].pending_tool_calls()[0].arguments["tz"], "UTC");
        assert!(events[1].done);
        assert_eq!(events[1].usage().map(|usage| usage.total()), Some(200));
    }

    #[test]
    fn transport_errors_end_the_stream_with_provider_errors() {
        let provider = OllamaProvider::with_transport_for_tests(
            "llama3.1:8b",
            FakeTransport::new(FakeOutcome::Chunks(
                vec![text_chunk("partial", false)],
                Some(OllamaApiError::IncompleteStream),
            )),
        );

        let events: Vec<_> = provider
            .stream_chat(request(), not_cancelled())
            .expect("stream should open")
            .collect();

        assert_eq!(events.len(), 2);
        assert!(events[0].is_ok());
        assert_eq!(events[1], Err(ProviderError::IncompleteStream));
    }

    #[test]
    fn error_mapping_keeps_status_and_stream_failures_distinct() {
        assert_eq!(
            map_stream_error(OllamaApiError::Status(
                reqwest_status(404),
                "missing".to_string()
            )),
            ProviderError::Status {
                status: 404,
                message: "missing".to_string()
            }
        );
        assert_eq!(
            map_stream_error(OllamaApiError::StreamFailed {
                message: "boom".to_string()
            }),
            ProviderError::StreamFailed("boom".to_string())
        );
        assert!(matches!(
            map_stream_error(OllamaApiError::RetryExhausted {
                status: None,
                last_error: Some("refused".to_string())
            }),
            ProviderError::Transport(message) if message.contains("refused")
        ));
    }

    fn reqwest_status(code: u16) -> ollama_api::StatusCode {
        ollama_api::StatusCode::from_u16(code).expect("valid status")
    }

    #[test]
    fn dropping_the_stream_cancels_the_worker() {
        let transport = FakeTransport::new(FakeOutcome::Endless);
        let saw_cancel = Arc::clone(&transport.saw_cancel);
        let provider = OllamaProvider::with_transport_for_tests(
            "llama3.1:8b",
            transport as Arc<dyn Transport>,
        );

        let mut stream = provider
            .stream_chat(request(), not_cancelled())
            .expect("stream should open");
        assert!(matches!(stream.next(), Some(Ok(_))));
        drop(stream);

        let started = Instant::now();
        while !saw_cancel.load(Ordering::Acquire) && started.elapsed() < Duration::from_secs(2) {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(saw_cancel.load(Ordering::Acquire));
    }

    #[test]
    fn turn_cancellation_surfaces_as_cancelled() {
        let provider = OllamaProvider::with_transport_for_tests(
            "llama3.1:8b",
            FakeTransport::new(FakeOutcome::Endless),
        );
        let cancel = not_cancelled();

        let mut stream = provider
            .stream_chat(request(), Arc::clone(&cancel))
            .expect("stream should open");
        assert!(matches!(stream.next(), Some(Ok(_))));
        cancel.store(true, Ordering::Release);

        assert_eq!(stream.next(), Some(Err(ProviderError::Cancelled)));
        assert_eq!(stream.next(), None);
    }

    #[test]
    fn catalog_uses_show_for_context_length() {
        let provider = OllamaProvider::with_transport_for_tests(
            "llama3.1:8b",
            FakeTransport::new(FakeOutcome::Chunks(Vec::new(), None)),
        );

        let models = provider.list_models().expect("tags should load");
        assert_eq!(models[0].name, "llama3.1:8b");
        assert_eq!(provider.context_length("llama3.1:8b"), Ok(Some(8192)));
        assert_eq!(provider.context_length("other"), Ok(None));
    }
}
