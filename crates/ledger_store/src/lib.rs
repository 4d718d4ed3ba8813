mod error;
mod file_store;
mod memory;
mod paths;
mod schema;
mod store;

pub use error::LedgerStoreError;
pub use file_store::JsonFileStore;
pub use memory::MemoryStore;
pub use paths::{
    default_sessions_root, new_session_id, session_file_name, validate_session_id,
    DEFAULT_SESSIONS_DIR,
};
pub use schema::{LedgerSnapshot, SessionMetadata};
pub use store::LedgerStore;
