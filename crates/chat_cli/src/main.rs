use std::io::{self, BufWriter};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use chat_cli::app::ChatApp;
use chat_cli::interrupt::install_interrupt_handler;
use chat_cli::providers::backend_from_config;
use chat_cli::tools::builtin_registry;
use chat_cli::tool_settings;
use ledger_store::{JsonFileStore, LedgerStore};
use tool_chat::{
    init_logging, ChatConfig, ConversationEngine, EngineConfig, Ledger, ProviderSummarizer,
    SupervisorConfig, ToolGateway,
};
use tracing::{error, info, warn};

fn main() -> io::Result<()> {
    let config = ChatConfig::from_env();
    if let Err(error) = init_logging(&config) {
        eprintln!("tool-chat: {error}; logging disabled");
    }

    run(config).inspect_err(|error| error!(%error, "tool-chat failed"))
}

fn run(config: ChatConfig) -> io::Result<()> {
    let backend = backend_from_config(&config).map_err(io::Error::other)?;
    let store: Arc<dyn LedgerStore> = Arc::new(JsonFileStore::new(&config.sessions_dir));

    let ledger = match &config.session_id {
        Some(session_id) => Ledger::open(Arc::clone(&store), session_id)
            .map_err(io::Error::other)?
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("session {session_id} not found"),
                )
            })?,
        None => Ledger::create(Arc::clone(&store), backend.default_model.clone()),
    };
    if let Some(model) = &config.model {
        if ledger.model() != *model {
            if let Err(error) = ledger.set_model(model.as_str()) {
                warn!(%error, "could not save model change");
            }
        }
    }
    let ledger = Arc::new(ledger);

    let workspace = std::env::current_dir()?;
    let registry = builtin_registry(&workspace).map_err(io::Error::other)?;
    let settings = tool_settings(&config, &registry);

    let cancel = Arc::new(AtomicBool::new(false));
    let mut engine_config = EngineConfig::default()
        .with_max_depth(config.max_tool_depth)
        .with_cancel(Arc::clone(&cancel));
    if let Some(prompt) = &config.system_prompt {
        engine_config = engine_config.with_system_prompt(prompt.as_str());
    }
    let engine = ConversationEngine::new(
        Arc::clone(&backend.provider),
        ToolGateway::new(registry),
        engine_config,
    );

    let _interrupts = install_interrupt_handler(cancel)?;

    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut app = ChatApp::new(
        engine,
        Arc::clone(&ledger),
        Arc::clone(&backend.catalog),
        stdin.lock(),
        BufWriter::new(stdout.lock()),
    )
    .with_store(store)
    .with_settings(settings);
    if config.summary_enabled {
        app = app.with_summaries(
            Arc::new(ProviderSummarizer::new(Arc::clone(&backend.provider))),
            SupervisorConfig {
                interval: config.summary_interval,
                ..SupervisorConfig::default()
            },
        );
    }

    info!(
        session_id = %ledger.session_id(),
        workspace = %workspace.display(),
        "tool-chat started"
    );
    app.run()
}
