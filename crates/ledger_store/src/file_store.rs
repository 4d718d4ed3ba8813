use std::fs::{self, File};
use std::io::{BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::error::LedgerStoreError;
use crate::paths::{session_file_name, validate_session_id};
use crate::schema::{LedgerSnapshot, SessionMetadata};
use crate::store::LedgerStore;

/// One pretty-printed JSON file per session under `root`.
///
/// Writes go to a sibling temp file that is renamed over the target, so a
/// crash mid-save leaves the previous ledger intact.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    root: PathBuf,
}

impl JsonFileStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, session_id: &str) -> Result<PathBuf, LedgerStoreError> {
        validate_session_id(session_id)?;
        Ok(self.root.join(session_file_name(session_id)))
    }

    fn read_snapshot(path: &Path) -> Result<LedgerSnapshot, LedgerStoreError> {
        let file = File::open(path)
            .map_err(|source| LedgerStoreError::io("opening ledger file", path, source))?;
        serde_json::from_reader(BufReader::new(file))
            .map_err(|source| LedgerStoreError::json_parse(path, source))
    }
}

impl LedgerStore for JsonFileStore {
    fn save(&self, snapshot: &LedgerSnapshot) -> Result<(), LedgerStoreError> {
        let session_id = snapshot.session_id();
        let path = self.path_for(session_id)?;

        fs::create_dir_all(&self.root).map_err(|source| {
            LedgerStoreError::io("creating sessions directory", &self.root, source)
        })?;

        let encoded = serde_json::to_vec_pretty(snapshot)
            .map_err(|source| LedgerStoreError::json_serialize(session_id, source))?;

        let temp_path = path.with_extension("json.tmp");
        let mut file = File::create(&temp_path)
            .map_err(|source| LedgerStoreError::io("creating temp ledger file", &temp_path, source))?;
        file.write_all(&encoded)
            .and_then(|()| file.sync_all())
            .map_err(|source| LedgerStoreError::io("writing temp ledger file", &temp_path, source))?;
        drop(file);

        fs::rename(&temp_path, &path)
            .map_err(|source| LedgerStoreError::io("replacing ledger file", &path, source))
    }

    fn load(&self, session_id: &str) -> Result<Option<LedgerSnapshot>, LedgerStoreError> {
        let path = self.path_for(session_id)?;
        if !path.exists() {
            return Ok(None);
        }

        let snapshot = Self::read_snapshot(&path)?;
        if snapshot.session_id() != session_id {
            return Err(LedgerStoreError::SessionIdMismatch {
                path,
                expected: session_id.to_string(),
                found: snapshot.metadata.session_id,
            });
        }

        Ok(Some(snapshot))
    }

    fn list(&self) -> Result<Vec<SessionMetadata>, LedgerStoreError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(LedgerStoreError::io(
                    "listing sessions directory",
                    &self.root,
                    source,
                ))
            }
        };

        let mut sessions = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| {
                LedgerStoreError::io("listing sessions directory", &self.root, source)
            })?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }

            match Self::read_snapshot(&path) {
                Ok(snapshot) => sessions.push(snapshot.metadata),
                Err(error) => {
                    tracing::warn!(path = %path.display(), %error, "skipping unreadable ledger file");
                }
            }
        }

        sessions.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        Ok(sessions)
    }

    fn delete(&self, session_id: &str) -> Result<bool, LedgerStoreError> {
        let path = self.path_for(session_id)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(false),
            Err(source) => Err(LedgerStoreError::io("deleting ledger file", &path, source)),
        }
    }
}
