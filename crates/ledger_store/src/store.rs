use crate::error::LedgerStoreError;
use crate::schema::{LedgerSnapshot, SessionMetadata};

/// Durable home of conversation ledgers, keyed by session id.
///
/// `save` must be durable when it returns; callers invoke it synchronously
/// after every ledger mutation.
pub trait LedgerStore: Send + Sync {
    fn save(&self, snapshot: &LedgerSnapshot) -> Result<(), LedgerStoreError>;

    /// `Ok(None)` when no ledger exists for `session_id`.
    fn load(&self, session_id: &str) -> Result<Option<LedgerSnapshot>, LedgerStoreError>;

    /// Metadata of every stored session, most recently updated first.
    fn list(&self) -> Result<Vec<SessionMetadata>, LedgerStoreError>;

    /// Returns whether a ledger was removed.
    fn delete(&self, session_id: &str) -> Result<bool, LedgerStoreError>;
}
