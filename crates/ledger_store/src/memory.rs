use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use crate::error::LedgerStoreError;
use crate::paths::validate_session_id;
use crate::schema::{LedgerSnapshot, SessionMetadata};
use crate::store::LedgerStore;

/// Process-local store for tests and throwaway sessions.
#[derive(Debug, Default)]
pub struct MemoryStore {
    sessions: Mutex<BTreeMap<String, LedgerSnapshot>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.sessions).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LedgerStore for MemoryStore {
    fn save(&self, snapshot: &LedgerSnapshot) -> Result<(), LedgerStoreError> {
        validate_session_id(snapshot.session_id())?;
        lock_unpoisoned(&self.sessions).insert(snapshot.session_id().to_string(), snapshot.clone());
        Ok(())
    }

    fn load(&self, session_id: &str) -> Result<Option<LedgerSnapshot>, LedgerStoreError> {
        validate_session_id(session_id)?;
        Ok(lock_unpoisoned(&self.sessions).get(session_id).cloned())
    }

    fn list(&self) -> Result<Vec<SessionMetadata>, LedgerStoreError> {
        let mut sessions: Vec<SessionMetadata> = lock_unpoisoned(&self.sessions)
            .values()
            .map(|snapshot| snapshot.metadata.clone())
            .collect();
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(sessions)
    }

    fn delete(&self, session_id: &str) -> Result<bool, LedgerStoreError> {
        validate_session_id(session_id)?;
        Ok(lock_unpoisoned(&self.sessions).remove(session_id).is_some())
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
