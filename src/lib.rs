//! Tool-augmented streaming chat core.
//!
//! Invariant: the [`Ledger`] is the only state shared between the foreground
//! conversation and the background summary supervisor, and the supervisor
//! never writes to it.
//!
//! # Public API Overview
//! - Run turns with [`ConversationEngine`]: stream a response, execute
//!   requested tools through the [`ToolGateway`], continue until a terminal
//!   assistant message.
//! - Record and edit history with [`Ledger`], persisted through a
//!   [`ledger_store::LedgerStore`].
//! - Report context window usage with [`ContextWindowAccountant`].
//! - Summarize in the background with [`SummarySupervisor`].
//! - Load settings with [`ChatConfig::from_env`] and install tracing with
//!   [`init_logging`].

#![allow(clippy::type_complexity)]

pub mod accountant;
pub mod config;
pub mod engine;
pub mod gateway;
pub mod ledger;
pub mod logging;
pub mod supervisor;

/// Message model shared with providers.
pub use chat_provider::{Message, MessageBody, RequestMessage, Role, TokenUsage, ToolCall};

/// Context window accounting.
pub use crate::accountant::{ContextWindowAccountant, ContextWindowInfo};

/// Environment configuration.
pub use crate::config::{ChatConfig, ProviderKind};

/// Streaming engine and its observable progress.
pub use crate::engine::{
    ConversationEngine, EngineConfig, EngineError, EngineEvent, TurnPhase, DEFAULT_MAX_TOOL_DEPTH,
};

/// Tool registration, policy and execution.
pub use crate::gateway::{
    FnTool, Tool, ToolError, ToolExecutionPolicy, ToolExecutionResult, ToolGateway, ToolRegistry,
    ToolSettings,
};

/// Conversation history.
pub use crate::ledger::{Ledger, LedgerError};

/// Logging bootstrap.
pub use crate::logging::{init_logging, LoggingError};

/// Background summaries.
pub use crate::supervisor::{
    ProviderSummarizer, ShutdownOutcome, Summarizer, SummaryError, SummarySupervisor,
    SupervisorConfig,
};
