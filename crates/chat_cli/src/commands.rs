use tool_chat::ToolExecutionPolicy;

pub const HELP_TEXT: &str = "\
Commands:
  /help                 show this help
  /status               context window usage for the current model
  /history              numbered user messages
  /edit <n> <text>      replace user message n, drop everything after it, regenerate
  /tools                enabled tools and the confirmation policy
  /policy <mode>        set the policy: never | always | destructive
  /models               models the backend can serve
  /model <name>         switch model
  /sessions             saved sessions
  /sessions <id>        switch to a saved session and show its history
  /sessions new         start a new session
  /thinking             toggle showing the model's thinking
  /quit                 exit (also /exit, /q)";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlashCommand {
    Help,
    Status,
    History,
    Edit { number: usize, text: String },
    Tools,
    /// `None` shows the current policy.
    Policy(Option<ToolExecutionPolicy>),
    Models,
    /// `None` shows the current model.
    Model(Option<String>),
    Sessions(SessionAction),
    /// Toggles display of thinking deltas.
    Thinking,
    Quit,
    /// A known command with unusable arguments; carries the message to show.
    Usage(String),
    Unknown(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    List,
    New,
    Switch(String),
}

pub fn parse_slash_command(input: &str) -> Option<SlashCommand> {
    let trimmed = input.trim();
    if !trimmed.starts_with('/') {
        return None;
    }

    let (command, rest) = match trimmed.split_once(char::is_whitespace) {
        Some((command, rest)) => (command, rest.trim()),
        None => (trimmed, ""),
    };

    let parsed = match command {
        "/help" => SlashCommand::Help,
        "/status" => SlashCommand::Status,
        "/history" => SlashCommand::History,
        "/edit" => parse_edit(rest),
        "/tools" => SlashCommand::Tools,
        "/policy" if rest.is_empty() => SlashCommand::Policy(None),
        "/policy" => match rest.parse::<ToolExecutionPolicy>() {
            Ok(policy) => SlashCommand::Policy(Some(policy)),
            Err(error) => SlashCommand::Usage(error),
        },
        "/models" => SlashCommand::Models,
        "/model" if rest.is_empty() => SlashCommand::Model(None),
        "/model" => SlashCommand::Model(Some(rest.to_string())),
        "/sessions" => SlashCommand::Sessions(match rest {
            "" => SessionAction::List,
            "new" => SessionAction::New,
            id => SessionAction::Switch(id.to_string()),
        }),
        "/thinking" => SlashCommand::Thinking,
        "/quit" | "/exit" | "/q" => SlashCommand::Quit,
        _ => SlashCommand::Unknown(command.to_string()),
    };

    Some(parsed)
}

fn parse_edit(rest: &str) -> SlashCommand {
    const USAGE: &str = "usage: /edit <n> <new text>";

    let Some((number, text)) = rest.split_once(char::is_whitespace) else {
        return SlashCommand::Usage(USAGE.to_string());
    };

    let text = text.trim();
    match number.parse::<usize>() {
        Ok(number) if number > 0 && !text.is_empty() => SlashCommand::Edit {
            number,
            text: text.to_string(),
        },
        _ => SlashCommand::Usage(USAGE.to_string()),
    }
}
