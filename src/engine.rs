//! Streaming conversation engine.
//!
//! One call to [`ConversationEngine::respond`] is one user turn: it streams a
//! response, drains every tool-call batch through the [`ToolGateway`], and
//! re-enters streaming with the updated ledger until the backend produces a
//! terminal message. Each continuation is a fresh sub-invocation whose depth
//! is passed by value.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chat_provider::{
    CancelSignal, ChatProvider, ChatRequest, Message, ProviderError, RequestMessage, Role,
    StreamEvent, ToolCall,
};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::gateway::{ConfirmFn, ToolExecutionResult, ToolGateway, ToolSettings};
use crate::ledger::{Ledger, LedgerError};

pub const DEFAULT_MAX_TOOL_DEPTH: usize = 5;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Continuations allowed per turn.
    pub max_depth: usize,
    /// Sent ahead of the history when the ledger has no system message.
    pub system_prompt: Option<String>,
    /// Turn-level cancellation, cleared when a turn starts.
    pub cancel: Option<CancelSignal>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_TOOL_DEPTH,
            system_prompt: None,
            cancel: None,
        }
    }
}

impl EngineConfig {
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        let prompt = prompt.into();
        self.system_prompt = (!prompt.trim().is_empty()).then_some(prompt);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    Idle,
    Streaming,
    ToolPending,
    Confirming,
    Executing,
    Denied,
    Continuing,
    Done,
    Error,
    DepthExceeded,
}

impl TurnPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error | Self::DepthExceeded)
    }
}

/// Progress visible to the caller while a turn runs.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    ContentDelta(String),
    ThinkingDelta(String),
    ToolRequested {
        tool_name: String,
        arguments: Map<String, Value>,
    },
    ToolCompleted(ToolExecutionResult),
    Continuing {
        depth: usize,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("backend failure: {0}")]
    Transport(ProviderError),
    #[error("tool calls kept requesting more tools; stopped after {max_depth} continuations")]
    DepthExceeded { max_depth: usize },
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("another turn is already in progress")]
    TurnInProgress,
    #[error("turn cancelled")]
    Cancelled,
}

impl EngineError {
    /// Transport failures may succeed if the user simply tries again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

impl From<ProviderError> for EngineError {
    fn from(error: ProviderError) -> Self {
        match error {
            ProviderError::Cancelled => Self::Cancelled,
            other => Self::Transport(other),
        }
    }
}

/// How one backend stream ended.
enum Pass {
    Finished(Message),
    /// A productive tool batch ran; the model needs a fresh stream.
    Continue,
}

/// Borrowed state shared by every sub-invocation of one turn.
struct Turn<'a, 'c> {
    ledger: &'a Ledger,
    model: &'a str,
    settings: &'a ToolSettings,
    confirm: &'a mut ConfirmFn<'c>,
    emit: &'a mut dyn FnMut(EngineEvent),
    cancel: CancelSignal,
}

pub struct ConversationEngine {
    provider: Arc<dyn ChatProvider>,
    gateway: ToolGateway,
    config: EngineConfig,
    busy: AtomicBool,
    phase: Mutex<TurnPhase>,
}

impl fmt::Debug for ConversationEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversationEngine")
            .field("provider", &self.provider.profile())
            .field("config", &self.config)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

impl ConversationEngine {
    pub fn new(provider: Arc<dyn ChatProvider>, gateway: ToolGateway, config: EngineConfig) -> Self {
        Self {
            provider,
            gateway,
            config,
            busy: AtomicBool::new(false),
            phase: Mutex::new(TurnPhase::Idle),
        }
    }

    pub fn gateway(&self) -> &ToolGateway {
        &self.gateway
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn provider(&self) -> &Arc<dyn ChatProvider> {
        &self.provider
    }

    /// Phase of the current turn, or the terminal phase of the last one.
    pub fn phase(&self) -> TurnPhase {
        *lock_unpoisoned(&self.phase)
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Appends `text` as a user message, then runs the turn.
    pub fn send_user_message(
        &self,
        ledger: &Ledger,
        model: &str,
        text: &str,
        settings: &ToolSettings,
        confirm: &mut ConfirmFn<'_>,
        emit: &mut dyn FnMut(EngineEvent),
    ) -> Result<Message, EngineError> {
        let busy = BusyGuard::acquire(&self.busy)?;
        ledger.append(Message::user(text))?;
        self.respond_locked(busy, ledger, model, settings, confirm, emit)
    }

    /// Runs one turn from the current ledger state and returns the terminal
    /// assistant message, which has already been appended.
    ///
    /// Entries appended before a failure stay in the ledger.
    pub fn respond(
        &self,
        ledger: &Ledger,
        model: &str,
        settings: &ToolSettings,
        confirm: &mut ConfirmFn<'_>,
        emit: &mut dyn FnMut(EngineEvent),
    ) -> Result<Message, EngineError> {
        let busy = BusyGuard::acquire(&self.busy)?;
        self.respond_locked(busy, ledger, model, settings, confirm, emit)
    }

    /// Runs a turn while `_busy` keeps other turns out.
    fn respond_locked(
        &self,
        _busy: BusyGuard<'_>,
        ledger: &Ledger,
        model: &str,
        settings: &ToolSettings,
        confirm: &mut ConfirmFn<'_>,
        emit: &mut dyn FnMut(EngineEvent),
    ) -> Result<Message, EngineError> {
        let cancel = match &self.config.cancel {
            Some(cancel) => {
                cancel.store(false, Ordering::SeqCst);
                Arc::clone(cancel)
            }
            None => Arc::new(AtomicBool::new(false)),
        };

        info!(
            session_id = %ledger.session_id(),
            model,
            tools = settings.tools.len(),
            policy = %settings.execution_policy,
            "turn started"
        );

        let mut turn = Turn {
            ledger,
            model,
            settings,
            confirm,
            emit,
            cancel,
        };

        let outcome = self.stream_once(&mut turn, 0);
        match &outcome {
            Ok(_) => {}
            Err(EngineError::DepthExceeded { max_depth }) => {
                warn!(max_depth, "turn stopped at tool depth limit");
            }
            Err(error) => {
                self.enter(TurnPhase::Error, 0);
                warn!(%error, "turn failed");
            }
        }

        outcome
    }

    fn stream_once(&self, turn: &mut Turn<'_, '_>, depth: usize) -> Result<Message, EngineError> {
        match self.stream_pass(turn, depth)? {
            Pass::Finished(message) => Ok(message),
            Pass::Continue => {
                let next_depth = depth + 1;
                if next_depth > self.config.max_depth {
                    self.enter(TurnPhase::DepthExceeded, depth);
                    return Err(EngineError::DepthExceeded {
                        max_depth: self.config.max_depth,
                    });
                }

                self.enter(TurnPhase::Continuing, next_depth);
                (turn.emit)(EngineEvent::Continuing { depth: next_depth });
                self.stream_once(turn, next_depth)
            }
        }
    }

    /// Reads one backend stream. The stream is dropped before the caller
    /// opens the next one, so a turn holds at most one open stream.
    fn stream_pass(&self, turn: &mut Turn<'_, '_>, depth: usize) -> Result<Pass, EngineError> {
        self.enter(TurnPhase::Streaming, depth);

        let request = self.build_request(turn);
        let stream = self.provider.stream_chat(request, Arc::clone(&turn.cancel))?;

        let mut accumulated = String::new();
        let mut unattached = String::new();

        for item in stream {
            if turn.cancel.load(Ordering::SeqCst) {
                return Err(EngineError::Cancelled);
            }

            let event = item?;
            self.forward_deltas(turn, &event, &mut accumulated, &mut unattached);

            let calls = event.pending_tool_calls();
            if !calls.is_empty() {
                self.enter(TurnPhase::ToolPending, depth);
                let preface = std::mem::take(&mut unattached);
                if self.run_tool_batch(turn, calls, preface, depth)? {
                    return Ok(Pass::Continue);
                }

                // Nothing to continue from; keep reading this response.
                self.enter(TurnPhase::Streaming, depth);
            }

            if event.done {
                let message = Message::assistant(
                    accumulated,
                    Some(turn.model.to_string()),
                    event.usage(),
                );
                turn.ledger.append(message.clone())?;
                self.enter(TurnPhase::Done, depth);
                debug!(
                    depth,
                    eval_count = ?message.eval_count(),
                    prompt_eval_count = ?message.prompt_eval_count(),
                    "turn completed"
                );
                return Ok(Pass::Finished(message));
            }
        }

        if turn.cancel.load(Ordering::SeqCst) {
            return Err(EngineError::Cancelled);
        }
        Err(EngineError::Transport(ProviderError::IncompleteStream))
    }

    fn forward_deltas(
        &self,
        turn: &mut Turn<'_, '_>,
        event: &StreamEvent,
        accumulated: &mut String,
        unattached: &mut String,
    ) {
        if !event.thinking_delta.is_empty() {
            (turn.emit)(EngineEvent::ThinkingDelta(event.thinking_delta.clone()));
        }

        if !event.content_delta.is_empty() {
            accumulated.push_str(&event.content_delta);
            unattached.push_str(&event.content_delta);
            (turn.emit)(EngineEvent::ContentDelta(event.content_delta.clone()));
        }
    }

    /// Confirms and executes every call of one batch in request order,
    /// appending an (assistant call, tool result) pair per call.
    ///
    /// Returns whether any call gave the model something to continue from.
    fn run_tool_batch(
        &self,
        turn: &mut Turn<'_, '_>,
        calls: &[ToolCall],
        mut preface: String,
        depth: usize,
    ) -> Result<bool, EngineError> {
        debug!(depth, calls = calls.len(), "processing tool batch");
        let mut productive = false;

        for call in calls {
            (turn.emit)(EngineEvent::ToolRequested {
                tool_name: call.tool_name.clone(),
                arguments: call.arguments.clone(),
            });

            self.enter(TurnPhase::Confirming, depth);
            let mut denied = false;
            let confirm = &mut *turn.confirm;
            let result = self.gateway.execute(
                &call.tool_name,
                &call.arguments,
                turn.settings,
                &mut |name: &str, arguments: &Map<String, Value>| {
                    let approved = confirm(name, arguments);
                    denied = !approved;
                    approved
                },
            );

            if denied {
                self.enter(TurnPhase::Denied, depth);
            } else {
                self.enter(TurnPhase::Executing, depth);
            }

            turn.ledger.append(Message::assistant_tool_calls(
                std::mem::take(&mut preface),
                Some(turn.model.to_string()),
                vec![call.clone()],
            ))?;
            turn.ledger
                .append(Message::tool(&call.tool_name, result.ledger_content()))?;

            productive |= result.is_productive();
            (turn.emit)(EngineEvent::ToolCompleted(result));
        }

        Ok(productive)
    }

    fn build_request(&self, turn: &Turn<'_, '_>) -> ChatRequest {
        let mut messages = Vec::new();
        if let Some(prompt) = &self.config.system_prompt {
            if !turn.ledger.has_system_message() {
                messages.push(RequestMessage::new(Role::System, prompt.clone()));
            }
        }
        messages.extend(turn.ledger.messages_as_request());

        ChatRequest {
            model: turn.model.to_string(),
            messages,
            tools: self.gateway.definitions(turn.settings),
        }
    }

    fn enter(&self, next: TurnPhase, depth: usize) {
        let mut phase = lock_unpoisoned(&self.phase);
        debug!(from = ?*phase, to = ?next, depth, "turn phase");
        *phase = next;
    }
}

/// Marks the engine busy for the lifetime of one turn.
struct BusyGuard<'a> {
    busy: &'a AtomicBool,
}

impl<'a> BusyGuard<'a> {
    fn acquire(busy: &'a AtomicBool) -> Result<Self, EngineError> {
        busy.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| EngineError::TurnInProgress)?;
        Ok(Self { busy })
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::SeqCst);
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
