use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerStoreError {
    #[error("I/O error while {operation} at {path}: {source}")]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse ledger JSON at {path}: {source}")]
    JsonParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize ledger '{session_id}': {source}")]
    JsonSerialize {
        session_id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid session id '{session_id}': only ASCII letters, digits, '-' and '_' are allowed")]
    InvalidSessionId { session_id: String },

    #[error("ledger file {path} belongs to session '{found}', expected '{expected}'")]
    SessionIdMismatch {
        path: PathBuf,
        expected: String,
        found: String,
    },
}

impl LedgerStoreError {
    #[must_use]
    pub fn io(operation: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }

    #[must_use]
    pub fn json_parse(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::JsonParse {
            path: path.into(),
            source,
        }
    }

    #[must_use]
    pub fn json_serialize(session_id: impl Into<String>, source: serde_json::Error) -> Self {
        Self::JsonSerialize {
            session_id: session_id.into(),
            source,
        }
    }
}
