//! Line-oriented chat loop over any reader/writer pair.

use std::cell::RefCell;
use std::io::{self, BufRead, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chat_provider::{ModelCatalog, Role};
use ledger_store::LedgerStore;
use serde_json::{Map, Value};
use tool_chat::{
    ContextWindowAccountant, ConversationEngine, EngineError, EngineEvent, Ledger, LedgerError,
    Message, Summarizer, SummarySupervisor, SupervisorConfig, ToolExecutionResult, ToolSettings,
};
use tracing::{info, warn};

use crate::commands::{parse_slash_command, SessionAction, SlashCommand, HELP_TEXT};

const PROMPT: &str = "> ";
const MAX_ARGUMENT_PREVIEW_CHARS: usize = 120;
const SUPERVISOR_GRACE: Duration = Duration::from_secs(2);

/// Latest summary produced by the background supervisor, if any.
type SummarySlot = Arc<Mutex<Option<String>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Exit,
}

struct Summaries {
    summarizer: Arc<dyn Summarizer>,
    config: SupervisorConfig,
}

pub struct ChatApp<R, W> {
    engine: ConversationEngine,
    ledger: Arc<Ledger>,
    catalog: Arc<dyn ModelCatalog>,
    accountant: ContextWindowAccountant,
    store: Option<Arc<dyn LedgerStore>>,
    settings: ToolSettings,
    model: String,
    show_thinking: bool,
    summary: SummarySlot,
    summaries: Option<Summaries>,
    supervisor: Option<SummarySupervisor>,
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> ChatApp<R, W> {
    pub fn new(
        engine: ConversationEngine,
        ledger: Arc<Ledger>,
        catalog: Arc<dyn ModelCatalog>,
        input: R,
        output: W,
    ) -> Self {
        let model = ledger.model();
        Self {
            engine,
            ledger,
            accountant: ContextWindowAccountant::new(Arc::clone(&catalog)),
            catalog,
            store: None,
            settings: ToolSettings::default(),
            model,
            show_thinking: false,
            summary: Arc::new(Mutex::new(None)),
            summaries: None,
            supervisor: None,
            input,
            output,
        }
    }

    /// Store listed and opened by `/sessions`.
    pub fn with_store(mut self, store: Arc<dyn LedgerStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_settings(mut self, settings: ToolSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Keeps a background summary of whichever session is active while
    /// [`ChatApp::run`] executes.
    pub fn with_summaries(
        mut self,
        summarizer: Arc<dyn Summarizer>,
        config: SupervisorConfig,
    ) -> Self {
        self.summaries = Some(Summaries { summarizer, config });
        self
    }

    /// The active session; `/sessions` may have replaced the initial one.
    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn into_output(self) -> W {
        self.output
    }

    /// Reads lines until `/quit` or end of input.
    pub fn run(&mut self) -> io::Result<()> {
        self.start_supervisor();
        let result = self.read_loop();
        self.stop_supervisor();

        info!(session_id = %self.ledger.session_id(), "chat loop finished");
        result
    }

    fn read_loop(&mut self) -> io::Result<()> {
        self.print_banner()?;

        loop {
            write!(self.output, "{PROMPT}")?;
            self.output.flush()?;

            let mut line = String::new();
            if self.input.read_line(&mut line)? == 0 {
                writeln!(self.output)?;
                break;
            }

            if self.handle_line(line.trim())? == Flow::Exit {
                break;
            }
        }
        Ok(())
    }

    fn print_banner(&mut self) -> io::Result<()> {
        let profile = self.engine.provider().profile();
        writeln!(
            self.output,
            "tool-chat: session {} with {} via {} ({} messages). /help for commands.",
            self.ledger.session_id(),
            self.model,
            profile.provider_id,
            self.ledger.len()
        )
    }

    fn handle_line(&mut self, line: &str) -> io::Result<Flow> {
        if line.is_empty() {
            return Ok(Flow::Continue);
        }

        let Some(command) = parse_slash_command(line) else {
            self.send(line)?;
            return Ok(Flow::Continue);
        };

        match command {
            SlashCommand::Help => writeln!(self.output, "{HELP_TEXT}")?,
            SlashCommand::Status => self.show_status()?,
            SlashCommand::History => self.show_history()?,
            SlashCommand::Edit { number, text } => self.edit(number, &text)?,
            SlashCommand::Tools => self.show_tools()?,
            SlashCommand::Policy(None) => writeln!(
                self.output,
                "Tool policy: {}",
                self.settings.execution_policy
            )?,
            SlashCommand::Policy(Some(policy)) => {
                self.settings.execution_policy = policy;
                writeln!(self.output, "Tool policy set to {policy}")?;
            }
            SlashCommand::Models => self.show_models()?,
            SlashCommand::Model(None) => writeln!(self.output, "Model: {}", self.model)?,
            SlashCommand::Model(Some(name)) => self.switch_model(name)?,
            SlashCommand::Sessions(SessionAction::List) => self.show_sessions()?,
            SlashCommand::Sessions(SessionAction::New) => self.new_session()?,
            SlashCommand::Sessions(SessionAction::Switch(id)) => self.switch_session(&id)?,
            SlashCommand::Thinking => {
                self.show_thinking = !self.show_thinking;
                let state = if self.show_thinking { "on" } else { "off" };
                writeln!(self.output, "Thinking display {state}")?;
            }
            SlashCommand::Quit => return Ok(Flow::Exit),
            SlashCommand::Usage(message) => writeln!(self.output, "{message}")?,
            SlashCommand::Unknown(name) => {
                writeln!(self.output, "Unknown command {name}; try /help")?
            }
        }

        Ok(Flow::Continue)
    }

    fn send(&mut self, text: &str) -> io::Result<()> {
        let result = self.run_turn(|engine, ledger, model, settings, confirm, emit| {
            engine.send_user_message(ledger, model, text, settings, confirm, emit)
        });
        self.report_turn(result)
    }

    fn edit(&mut self, number: usize, text: &str) -> io::Result<()> {
        let target = self
            .ledger
            .user_messages_with_indices()
            .into_iter()
            .find(|(n, _, _)| *n == number);

        let Some((_, index, _)) = target else {
            return writeln!(self.output, "No user message #{number}; see /history");
        };

        match self.ledger.edit_and_truncate(index, text) {
            Ok(()) => {}
            // The edit stays applied in memory when only the save failed.
            Err(error @ LedgerError::Store(_)) => writeln!(self.output, "warning: {error}")?,
            Err(error) => return writeln!(self.output, "Cannot edit: {error}"),
        }

        writeln!(self.output, "Edited message #{number}; regenerating.")?;
        let result = self.run_turn(|engine, ledger, model, settings, confirm, emit| {
            engine.respond(ledger, model, settings, confirm, emit)
        });
        self.report_turn(result)
    }

    /// Runs one engine call with stdin confirmation and streamed output.
    fn run_turn<F>(&mut self, call: F) -> Result<(), EngineError>
    where
        F: FnOnce(
            &ConversationEngine,
            &Ledger,
            &str,
            &ToolSettings,
            &mut dyn FnMut(&str, &Map<String, Value>) -> bool,
            &mut dyn FnMut(EngineEvent),
        ) -> Result<Message, EngineError>,
    {
        let show_thinking = self.show_thinking;
        let output = RefCell::new(&mut self.output);
        let input = &mut self.input;

        let mut confirm = |tool_name: &str, arguments: &Map<String, Value>| {
            let mut output = output.borrow_mut();
            let _ = write!(
                output,
                "\nRun tool '{tool_name}' with {}? [y/N] ",
                preview_arguments(arguments)
            );
            let _ = output.flush();
            drop(output);

            let mut answer = String::new();
            match input.read_line(&mut answer) {
                Ok(0) | Err(_) => false,
                Ok(_) => matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"),
            }
        };

        let mut thinking = false;
        let mut emit = |event: EngineEvent| {
            let mut output = output.borrow_mut();
            let _ = match event {
                EngineEvent::ThinkingDelta(text) if show_thinking => {
                    let prefix = if thinking { "" } else { "[thinking] " };
                    thinking = true;
                    write!(output, "{prefix}{text}")
                }
                EngineEvent::ThinkingDelta(_) => Ok(()),
                EngineEvent::ContentDelta(text) => {
                    let separator = if std::mem::take(&mut thinking) { "\n" } else { "" };
                    write!(output, "{separator}{text}")
                }
                EngineEvent::ToolRequested { tool_name, .. } => {
                    thinking = false;
                    write!(output, "\n[tool] {tool_name} requested")
                }
                EngineEvent::ToolCompleted(result) => {
                    writeln!(output, "\n[tool] {}", describe_result(&result))
                }
                EngineEvent::Continuing { .. } => Ok(()),
            };
            let _ = output.flush();
        };

        let result = call(
            &self.engine,
            self.ledger.as_ref(),
            self.model.as_str(),
            &self.settings,
            &mut confirm,
            &mut emit,
        );
        result.map(|_| ())
    }

    fn report_turn(&mut self, result: Result<(), EngineError>) -> io::Result<()> {
        match result {
            Ok(()) => writeln!(self.output),
            Err(EngineError::Cancelled) => writeln!(self.output, "\n[cancelled]"),
            Err(error) if error.is_retryable() => {
                warn!(%error, "turn failed");
                writeln!(self.output, "\nerror: {error} (try again)")
            }
            Err(error) => {
                warn!(%error, "turn failed");
                writeln!(self.output, "\nerror: {error}")
            }
        }
    }

    fn show_status(&mut self) -> io::Result<()> {
        let info = self.accountant.compute(&self.ledger, &self.model);
        writeln!(self.output, "Session: {}", self.ledger.session_id())?;
        writeln!(self.output, "Model: {}", self.model)?;
        writeln!(self.output, "Messages: {}", self.ledger.len())?;
        writeln!(self.output, "{info}")?;

        let summary = lock_unpoisoned(&self.summary).clone();
        if let Some(summary) = summary {
            writeln!(self.output, "Summary: {summary}")?;
        }
        Ok(())
    }

    fn show_history(&mut self) -> io::Result<()> {
        let numbered = self.ledger.user_messages_with_indices();
        if numbered.is_empty() {
            return writeln!(self.output, "No messages yet.");
        }

        for (number, _, message) in numbered {
            writeln!(self.output, "{number:>3}. {}", single_line(message.content()))?;
        }
        Ok(())
    }

    fn show_tools(&mut self) -> io::Result<()> {
        writeln!(
            self.output,
            "Tool policy: {}",
            self.settings.execution_policy
        )?;

        let registry = self.engine.gateway().registry();
        if registry.is_empty() {
            return writeln!(self.output, "No tools registered.");
        }

        for tool in registry.iter() {
            let enabled = if self.settings.is_enabled(tool.name()) {
                "on "
            } else {
                "off"
            };
            let kind = if tool.is_destructive() {
                "destructive"
            } else {
                "read-only"
            };
            writeln!(
                self.output,
                "  [{enabled}] {} ({kind}): {}",
                tool.name(),
                tool.description()
            )?;
        }
        Ok(())
    }

    fn show_models(&mut self) -> io::Result<()> {
        let models = match self.catalog.list_models() {
            Ok(models) => models,
            Err(error) => return writeln!(self.output, "Could not list models: {error}"),
        };

        if models.is_empty() {
            return writeln!(self.output, "No models available.");
        }

        for model in models {
            let marker = if model.name == self.model { '*' } else { ' ' };
            match model.context_length {
                Some(length) => writeln!(
                    self.output,
                    "{marker} {} ({length} tokens)",
                    model.name
                )?,
                None => writeln!(self.output, "{marker} {}", model.name)?,
            }
        }
        Ok(())
    }

    fn switch_model(&mut self, name: String) -> io::Result<()> {
        if let Err(error) = self.ledger.set_model(name.as_str()) {
            writeln!(self.output, "warning: {error}")?;
        }
        self.model = name;
        writeln!(self.output, "Model set to {}", self.model)
    }

    fn show_sessions(&mut self) -> io::Result<()> {
        let Some(store) = self.store.clone() else {
            return writeln!(self.output, "Sessions are not persisted.");
        };

        let sessions = match store.list() {
            Ok(sessions) => sessions,
            Err(error) => return writeln!(self.output, "Could not list sessions: {error}"),
        };

        if sessions.is_empty() {
            return writeln!(self.output, "No saved sessions.");
        }

        let current = self.ledger.session_id();
        for metadata in sessions {
            let (marker, preview) = if metadata.session_id == current {
                ('*', self.ledger.preview())
            } else {
                let preview = match store.load(&metadata.session_id) {
                    Ok(Some(snapshot)) => snapshot.preview(),
                    _ => format!(
                        "{}: ({} messages)",
                        metadata.session_id, metadata.message_count
                    ),
                };
                (' ', preview)
            };
            writeln!(self.output, "{marker} {preview} [{}]", metadata.model)?;
        }
        writeln!(self.output, "/sessions <id> switches, /sessions new starts over.")
    }

    fn switch_session(&mut self, session_id: &str) -> io::Result<()> {
        let Some(store) = self.store.clone() else {
            return writeln!(self.output, "Sessions are not persisted.");
        };

        if session_id == self.ledger.session_id() {
            return writeln!(self.output, "Already in session {session_id}.");
        }

        let ledger = match Ledger::open(store, session_id) {
            Ok(Some(ledger)) => ledger,
            Ok(None) => {
                return writeln!(self.output, "No saved session {session_id}; see /sessions")
            }
            Err(error) => {
                return writeln!(self.output, "Could not load session {session_id}: {error}")
            }
        };

        self.replace_ledger(ledger);
        writeln!(
            self.output,
            "Switched to session {} with {} ({} messages).",
            self.ledger.session_id(),
            self.model,
            self.ledger.len()
        )?;
        self.show_transcript()
    }

    fn new_session(&mut self) -> io::Result<()> {
        let ledger = match &self.store {
            Some(store) => Ledger::create(Arc::clone(store), self.model.clone()),
            None => Ledger::in_memory(self.model.clone()),
        };

        self.replace_ledger(ledger);
        writeln!(
            self.output,
            "Started new session {} with {}.",
            self.ledger.session_id(),
            self.model
        )
    }

    fn replace_ledger(&mut self, ledger: Ledger) {
        self.stop_supervisor();
        self.ledger = Arc::new(ledger);
        self.model = self.ledger.model();
        info!(session_id = %self.ledger.session_id(), model = %self.model, "switched session");
        self.start_supervisor();
    }

    fn show_transcript(&mut self) -> io::Result<()> {
        for message in self.ledger.messages() {
            match message.role() {
                Role::User => writeln!(self.output, "{PROMPT}{}", message.content())?,
                Role::Assistant => {
                    for call in message.tool_calls().unwrap_or_default() {
                        writeln!(self.output, "[tool] {} requested", call.tool_name)?;
                    }
                    if !message.content().is_empty() {
                        writeln!(self.output, "{}", message.content())?;
                    }
                }
                Role::Tool => writeln!(
                    self.output,
                    "[tool] {} result ({} bytes)",
                    message.tool_name().unwrap_or_default(),
                    message.content().len()
                )?,
                Role::System => {}
            }
        }
        Ok(())
    }

    fn start_supervisor(&mut self) {
        let Some(summaries) = &self.summaries else {
            return;
        };

        let slot = Arc::clone(&self.summary);
        let started = SummarySupervisor::start(
            Arc::clone(&self.ledger),
            Arc::clone(&summaries.summarizer),
            summaries.config.clone(),
            move |summary| *lock_unpoisoned(&slot) = Some(summary),
        );
        match started {
            Ok(supervisor) => self.supervisor = Some(supervisor),
            Err(error) => warn!(%error, "summary supervisor not started"),
        }
    }

    /// Stops the current supervisor and forgets its summary.
    fn stop_supervisor(&mut self) {
        if let Some(supervisor) = self.supervisor.take() {
            supervisor.shutdown(SUPERVISOR_GRACE);
        }
        *lock_unpoisoned(&self.summary) = None;
    }
}

fn describe_result(result: &ToolExecutionResult) -> String {
    if result.success {
        let bytes = result.result.as_deref().map_or(0, str::len);
        format!("{} ok ({bytes} bytes)", result.tool_name)
    } else {
        format!(
            "{} failed: {}",
            result.tool_name,
            result.error_message.as_deref().unwrap_or_default()
        )
    }
}

fn preview_arguments(arguments: &Map<String, Value>) -> String {
    let rendered = Value::Object(arguments.clone()).to_string();
    if rendered.chars().count() <= MAX_ARGUMENT_PREVIEW_CHARS {
        return rendered;
    }

    let mut preview: String = rendered.chars().take(MAX_ARGUMENT_PREVIEW_CHARS).collect();
    preview.push_str("...");
    preview
}

fn single_line(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn long_arguments_are_shortened() {
        let mut arguments = Map::new();
        arguments.insert("content".to_string(), json!("x".repeat(500)));

        let preview = preview_arguments(&arguments);

        assert!(preview.ends_with("..."));
        assert_eq!(preview.chars().count(), MAX_ARGUMENT_PREVIEW_CHARS + 3);
    }

    #[test]
    fn failed_results_show_their_error() {
        let result = ToolExecutionResult::failure("read_file", "no such file");
        assert_eq!(describe_result(&result), "read_file failed: no such file");

        let result = ToolExecutionResult::success("read_file", "abc");
        assert_eq!(describe_result(&result), "read_file ok (3 bytes)");
    }
}
