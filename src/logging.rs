//! Tracing subscriber bootstrap.
//!
//! Logs go to `TOOL_CHAT_LOG_FILE` when set, so they never interleave with
//! streamed REPL output, and to stderr otherwise.

use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing::warn;
use tracing_subscriber::EnvFilter;

use crate::config::{ChatConfig, DEFAULT_LOG_LEVEL};

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("failed to open log file {path}: {source}")]
    OpenLogFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Installs the global subscriber. Returns `Ok(false)` when one was
/// already installed, which leaves the existing subscriber in place.
pub fn init_logging(config: &ChatConfig) -> Result<bool, LoggingError> {
    let (filter, bad_level) = build_filter(&config.log_level);

    let installed = match &config.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| LoggingError::OpenLogFile {
                    path: path.clone(),
                    source,
                })?;

            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(true)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init()
                .is_ok()
        }
        None => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(io::stderr)
            .compact()
            .try_init()
            .is_ok(),
    };

    if let Some(level) = bad_level {
        warn!(level = %level, "invalid TOOL_CHAT_LOG_LEVEL; using {DEFAULT_LOG_LEVEL}");
    }
    for warning in &config.warnings {
        warn!("{warning}");
    }

    Ok(installed)
}

/// Filter for `level`, falling back to the default when it does not parse.
fn build_filter(level: &str) -> (EnvFilter, Option<String>) {
    match EnvFilter::try_new(level) {
        Ok(filter) => (filter, None),
        Err(_) => (EnvFilter::new(DEFAULT_LOG_LEVEL), Some(level.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_level_falls_back_to_default() {
        let (_, bad) = build_filter("tool_chat=debug,warn");
        assert_eq!(bad, None);

        let (_, bad) = build_filter("tool_chat=loud");
        assert_eq!(bad.as_deref(), Some("tool_chat=loud"));
    }

    #[test]
    fn unopenable_log_file_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = ChatConfig {
            log_file: Some(dir.path().join("missing").join("chat.log")),
            ..ChatConfig::default()
        };

        let error = init_logging(&config).expect_err("missing parent dir should fail");
        assert!(matches!(error, LoggingError::OpenLogFile { .. }));
    }
}
