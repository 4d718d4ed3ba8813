//! Deterministic scripted implementation of the shared `chat_provider` contract.
//!
//! This crate contains no transport/protocol logic and is intended for local
//! development and engine-level integration testing. Each call to
//! `stream_chat` consumes the next scripted turn.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use chat_provider::{
    CancelSignal, ChatProvider, ChatRequest, EventStream, ModelCatalog, ModelInfo, ProviderError,
    ProviderProfile, Role, StreamEvent, ToolCall,
};

/// Stable provider identifier used for explicit startup selection.
pub const MOCK_PROVIDER_ID: &str = "mock";

/// Model name reported when no catalog is configured.
pub const MOCK_MODEL_ID: &str = "mock";

/// One scripted backend response.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedTurn {
    /// The stream opens and yields these items in order.
    Events(Vec<Result<StreamEvent, ProviderError>>),
    /// Opening the stream fails outright.
    OpenError(ProviderError),
}

impl ScriptedTurn {
    /// Text chunks followed by a final event carrying `usage` as `(eval, prompt_eval)`.
    #[must_use]
    pub fn text(chunks: &[&str], usage: Option<(u64, u64)>) -> Self {
        let mut events: Vec<Result<StreamEvent, ProviderError>> = chunks
            .iter()
            .map(|chunk| Ok(StreamEvent::content(*chunk)))
            .collect();
        let done = match usage {
            Some((eval, prompt_eval)) => StreamEvent::done().with_usage(eval, prompt_eval),
            None => StreamEvent::done(),
        };
        events.push(Ok(done));
        Self::Events(events)
    }

    /// A single tool-call batch followed by a bare final event.
    #[must_use]
    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        Self::Events(vec![
            Ok(StreamEvent::tool_calls(calls)),
            Ok(StreamEvent::done()),
        ])
    }

    /// Chunks that end without a final event.
    #[must_use]
    pub fn truncated(chunks: &[&str]) -> Self {
        Self::Events(
            chunks
                .iter()
                .map(|chunk| Ok(StreamEvent::content(*chunk)))
                .collect(),
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Fallback {
    Exhausted,
    Repeat(ScriptedTurn),
    Echo,
}

/// Scripted provider used by engine tests and local runs.
#[derive(Debug)]
pub struct ScriptedProvider {
    script: Mutex<VecDeque<ScriptedTurn>>,
    fallback: Fallback,
    requests: Mutex<Vec<ChatRequest>>,
    models: Vec<ModelInfo>,
    token_delay: Option<Duration>,
}

impl ScriptedProvider {
    /// Creates a provider that serves `turns` once each, then fails.
    #[must_use]
    pub fn new(turns: Vec<ScriptedTurn>) -> Self {
        Self {
            script: Mutex::new(turns.into()),
            fallback: Fallback::Exhausted,
            requests: Mutex::new(Vec::new()),
            models: vec![ModelInfo {
                name: MOCK_MODEL_ID.to_string(),
                context_length: Some(4096),
            }],
            token_delay: None,
        }
    }

    /// Provider that answers every request with the same turn.
    #[must_use]
    pub fn repeating(turn: ScriptedTurn) -> Self {
        Self {
            fallback: Fallback::Repeat(turn),
            ..Self::new(Vec::new())
        }
    }

    /// Interactive demo provider: echoes the latest user message word by word.
    #[must_use]
    pub fn echo() -> Self {
        Self {
            fallback: Fallback::Echo,
            token_delay: Some(Duration::from_millis(Self::TOKEN_DELAY_MS)),
            ..Self::new(Vec::new())
        }
    }

    #[must_use]
    pub fn with_models(mut self, models: Vec<ModelInfo>) -> Self {
        self.models = models;
        self
    }

    #[must_use]
    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = Some(delay);
        self
    }

    /// Appends another scripted turn.
    pub fn push_turn(&self, turn: ScriptedTurn) {
        lock_unpoisoned(&self.script).push_back(turn);
    }

    /// Requests received so far, oldest first.
    #[must_use]
    pub fn requests(&self) -> Vec<ChatRequest> {
        lock_unpoisoned(&self.requests).clone()
    }

    #[must_use]
    pub fn request_count(&self) -> usize {
        lock_unpoisoned(&self.requests).len()
    }

    #[must_use]
    pub fn remaining_turns(&self) -> usize {
        lock_unpoisoned(&self.script).len()
    }

    fn next_turn(&self, request: &ChatRequest) -> ScriptedTurn {
        if let Some(turn) = lock_unpoisoned(&self.script).pop_front() {
            return turn;
        }

        match &self.fallback {
            Fallback::Exhausted => ScriptedTurn::OpenError(ProviderError::StreamFailed(
                "mock script exhausted".to_string(),
            )),
            Fallback::Repeat(turn) => turn.clone(),
            Fallback::Echo => echo_turn(request),
        }
    }

    const TOKEN_DELAY_MS: u64 = 30;
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::echo()
    }
}

impl ChatProvider for ScriptedProvider {
    fn profile(&self) -> ProviderProfile {
        ProviderProfile {
            provider_id: MOCK_PROVIDER_ID.to_string(),
            model_id: self
                .models
                .first()
                .map_or_else(|| MOCK_MODEL_ID.to_string(), |model| model.name.clone()),
        }
    }

    fn stream_chat(
        &self,
        request: ChatRequest,
        cancel: CancelSignal,
    ) -> Result<EventStream, ProviderError> {
        let turn = self.next_turn(&request);
        lock_unpoisoned(&self.requests).push(request);

        if cancel.load(Ordering::SeqCst) {
            return Err(ProviderError::Cancelled);
        }

        match turn {
            ScriptedTurn::OpenError(error) => Err(error),
            ScriptedTurn::Events(events) => Ok(Box::new(ScriptedStream {
                events: events.into(),
                cancel,
                token_delay: self.token_delay,
                finished: false,
            })),
        }
    }
}

impl ModelCatalog for ScriptedProvider {
    fn list_models(&self) -> Result<Vec<ModelInfo>, ProviderError> {
        Ok(self.models.clone())
    }
}

struct ScriptedStream {
    events: VecDeque<Result<StreamEvent, ProviderError>>,
    cancel: CancelSignal,
    token_delay: Option<Duration>,
    finished: bool,
}

impl Iterator for ScriptedStream {
    type Item = Result<StreamEvent, ProviderError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        if self.cancel.load(Ordering::SeqCst) {
            self.finished = true;
            return Some(Err(ProviderError::Cancelled));
        }

        let item = self.events.pop_front()?;
        if let Some(delay) = self.token_delay {
            thread::sleep(delay);
        }
        if item.is_err() {
            self.finished = true;
        }
        Some(item)
    }
}

fn echo_turn(request: &ChatRequest) -> ScriptedTurn {
    let prompt = request
        .messages
        .iter()
        .rev()
        .find(|message| message.role == Role::User)
        .map_or("", |message| message.content.as_str());

    let reply = if prompt.trim().is_empty() {
        "(mock) nothing to echo".to_string()
    } else {
        format!("(mock) {prompt}")
    };

    let mut events = Vec::new();
    let mut pending_token = String::new();
    for ch in reply.chars() {
        pending_token.push(ch);
        if matches!(ch, ' ' | '\n') {
            events.push(Ok(StreamEvent::content(std::mem::take(&mut pending_token))));
        }
    }
    if !pending_token.is_empty() {
        events.push(Ok(StreamEvent::content(pending_token)));
    }

    let eval_count = reply.split_whitespace().count().max(1) as u64;
    let prompt_eval_count = request
        .messages
        .iter()
        .map(|message| message.content.split_whitespace().count() as u64)
        .sum::<u64>()
        .max(1);
    events.push(Ok(
        StreamEvent::done().with_usage(eval_count, prompt_eval_count)
    ));

    ScriptedTurn::Events(events)
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
