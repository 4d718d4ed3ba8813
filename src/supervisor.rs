//! Background conversation summaries.
//!
//! [`SummarySupervisor`] owns one worker thread that periodically reads the
//! ledger and reports a fresh summary through a callback. It never writes to
//! the ledger. Summaries are advisory, so the worker tolerates the ledger
//! changing between reads and any pass in flight at shutdown is abandoned.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::AtomicBool;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chat_provider::{ChatProvider, ChatRequest, Message, ProviderError, RequestMessage, Role};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::ledger::Ledger;

pub const DEFAULT_SUMMARY_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_MIN_MESSAGES: usize = 2;

const SUMMARY_PROMPT: &str = "Summarize the conversation above in at most three sentences. \
Focus on the user's goals and any conclusions reached. Reply with the summary only.";

#[derive(Debug, thiserror::Error)]
pub enum SummaryError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("backend returned an empty summary")]
    Empty,
}

pub trait Summarizer: Send + Sync {
    fn summarize(&self, messages: &[Message], model: &str) -> Result<String, SummaryError>;
}

/// Summarizes by streaming a one-off prompt through a chat provider, without tools.
pub struct ProviderSummarizer {
    provider: Arc<dyn ChatProvider>,
}

impl ProviderSummarizer {
    pub fn new(provider: Arc<dyn ChatProvider>) -> Self {
        Self { provider }
    }

    fn request(messages: &[Message], model: &str) -> ChatRequest {
        let mut request_messages: Vec<RequestMessage> = messages
            .iter()
            .filter(|message| matches!(message.role(), Role::User | Role::Assistant))
            .filter(|message| !message.content().trim().is_empty())
            .map(|message| RequestMessage::new(message.role(), message.content()))
            .collect();
        request_messages.push(RequestMessage::new(Role::User, SUMMARY_PROMPT));

        ChatRequest {
            model: model.to_string(),
            messages: request_messages,
            tools: Vec::new(),
        }
    }
}

impl Summarizer for ProviderSummarizer {
    fn summarize(&self, messages: &[Message], model: &str) -> Result<String, SummaryError> {
        let cancel = Arc::new(AtomicBool::new(false));
        let stream = self
            .provider
            .stream_chat(Self::request(messages, model), cancel)?;

        let mut text = String::new();
        let mut finished = false;
        for event in stream {
            let event = event?;
            text.push_str(&event.content_delta);
            if event.done {
                finished = true;
                break;
            }
        }

        if !finished {
            return Err(ProviderError::IncompleteStream.into());
        }

        let summary = text.trim();
        if summary.is_empty() {
            return Err(SummaryError::Empty);
        }
        Ok(summary.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    pub interval: Duration,
    /// Fewer messages than this are not worth summarizing.
    pub min_messages: usize,
    /// Model used for summaries; the ledger's model when `None`.
    pub model: Option<String>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_SUMMARY_INTERVAL,
            min_messages: DEFAULT_MIN_MESSAGES,
            model: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// The worker exited within the grace period.
    Stopped,
    /// The worker was still busy and has been left to finish on its own.
    Detached,
}

#[derive(Default)]
struct StopSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl StopSignal {
    fn stop(&self) {
        *lock_unpoisoned(&self.stopped) = true;
        self.wake.notify_all();
    }

    fn is_stopped(&self) -> bool {
        *lock_unpoisoned(&self.stopped)
    }

    /// Sleeps up to `timeout`; returns true as soon as stop is requested.
    fn wait(&self, timeout: Duration) -> bool {
        let guard = lock_unpoisoned(&self.stopped);
        let result = self
            .wake
            .wait_timeout_while(guard, timeout, |stopped| !*stopped);
        match result {
            Ok((stopped, _)) => *stopped,
            Err(poisoned) => *poisoned.into_inner().0,
        }
    }
}

pub struct SummarySupervisor {
    signal: Arc<StopSignal>,
    exited: Receiver<()>,
    handle: Option<JoinHandle<()>>,
}

impl SummarySupervisor {
    /// Spawns the worker. `on_summary_updated` runs on the worker thread.
    pub fn start<F>(
        ledger: Arc<Ledger>,
        summarizer: Arc<dyn Summarizer>,
        config: SupervisorConfig,
        on_summary_updated: F,
    ) -> std::io::Result<Self>
    where
        F: FnMut(String) + Send + 'static,
    {
        let signal = Arc::new(StopSignal::default());
        let (exited_tx, exited) = mpsc::channel();
        let worker = Worker {
            ledger,
            summarizer,
            config,
            signal: Arc::clone(&signal),
            on_summary_updated: Box::new(on_summary_updated),
            summarized: None,
        };

        let handle = thread::Builder::new()
            .name("tool-chat-summary".to_string())
            .spawn(move || worker.run(exited_tx))?;

        info!("summary supervisor started");
        Ok(Self {
            signal,
            exited,
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Requests a cooperative stop and waits at most `grace` for the worker.
    pub fn shutdown(mut self, grace: Duration) -> ShutdownOutcome {
        self.stop_and_wait(grace)
    }

    fn stop_and_wait(&mut self, grace: Duration) -> ShutdownOutcome {
        self.signal.stop();
        let Some(handle) = self.handle.take() else {
            return ShutdownOutcome::Stopped;
        };

        match self.exited.recv_timeout(grace) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                let _ = handle.join();
                debug!("summary supervisor stopped");
                ShutdownOutcome::Stopped
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(grace_ms = grace.as_millis() as u64, "summary worker detached after grace period");
                ShutdownOutcome::Detached
            }
        }
    }
}

impl Drop for SummarySupervisor {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop_and_wait(Duration::ZERO);
        }
    }
}

struct Worker {
    ledger: Arc<Ledger>,
    summarizer: Arc<dyn Summarizer>,
    config: SupervisorConfig,
    signal: Arc<StopSignal>,
    on_summary_updated: Box<dyn FnMut(String) + Send>,
    /// Message count and save time of the ledger state last summarized.
    summarized: Option<(usize, OffsetDateTime)>,
}

impl Worker {
    fn run(mut self, exited: Sender<()>) {
        while !self.signal.wait(self.config.interval) {
            self.pass();
        }
        let _ = exited.send(());
    }

    fn pass(&mut self) {
        let snapshot = self.ledger.snapshot();
        let count = snapshot.messages.len();
        let state = (count, snapshot.metadata.updated_at);
        // Edits can shrink the ledger, so any change counts, not only growth.
        if count < self.config.min_messages || self.summarized == Some(state) {
            return;
        }

        let model = self
            .config
            .model
            .clone()
            .unwrap_or_else(|| snapshot.metadata.model.clone());
        let summarizer = Arc::clone(&self.summarizer);
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            summarizer.summarize(&snapshot.messages, &model)
        }));

        if self.signal.is_stopped() {
            return;
        }

        match outcome {
            Ok(Ok(summary)) => {
                self.summarized = Some(state);
                debug!(messages = count, "summary updated");
                let callback = &mut self.on_summary_updated;
                if catch_unwind(AssertUnwindSafe(|| callback(summary))).is_err() {
                    warn!("summary callback panicked");
                }
            }
            Ok(Err(error)) => warn!(%error, "summary pass failed"),
            Err(_) => warn!("summarizer panicked"),
        }
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
