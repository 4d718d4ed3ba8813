use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::error::LedgerStoreError;

pub const DEFAULT_SESSIONS_DIR: &str = "chat_sessions";

const SESSION_ID_LEN: usize = 10;
const MAX_SESSION_ID_LEN: usize = 64;

#[must_use]
pub fn default_sessions_root(cwd: &Path) -> PathBuf {
    cwd.join(DEFAULT_SESSIONS_DIR)
}

/// Short random session id (10 lowercase hex characters).
#[must_use]
pub fn new_session_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(SESSION_ID_LEN);
    id
}

/// Session ids become file names, so they must not contain path syntax.
pub fn validate_session_id(session_id: &str) -> Result<(), LedgerStoreError> {
    let valid = !session_id.is_empty()
        && session_id.len() <= MAX_SESSION_ID_LEN
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'));

    if valid {
        Ok(())
    } else {
        Err(LedgerStoreError::InvalidSessionId {
            session_id: session_id.to_string(),
        })
    }
}

#[must_use]
pub fn session_file_name(session_id: &str) -> String {
    format!("{session_id}.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_short_and_valid() {
        let id = new_session_id();
        assert_eq!(id.len(), SESSION_ID_LEN);
        assert!(validate_session_id(&id).is_ok());
        assert_ne!(id, new_session_id());
    }

    #[test]
    fn path_like_ids_are_rejected() {
        for bad in ["", "../escape", "a/b", "a b", "dot.json"] {
            assert!(
                matches!(
                    validate_session_id(bad),
                    Err(LedgerStoreError::InvalidSessionId { .. })
                ),
                "{bad:?} should be rejected"
            );
        }
        assert!(validate_session_id("chat_2026-abc").is_ok());
    }
}
