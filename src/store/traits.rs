//! Store traits for crypto box persistence.
//!
//! These traits define where the long-term identity, prekeys and sessions
//! live. Records are opaque byte strings; encoding them is the engine's job.

use thiserror::Error;

/// Error type for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("invalid record name: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Storage for the local long-term identity.
pub trait IdentityStore: Send + Sync {
    /// Load the serialised identity, if one was ever stored.
    fn load_identity(&self) -> StoreResult<Option<Vec<u8>>>;

    /// Store the serialised identity, replacing any previous one.
    fn save_identity(&self, identity: &[u8]) -> StoreResult<()>;
}

/// Storage for one-time and last-resort prekeys, keyed by numeric id.
pub trait PreKeyStore: Send + Sync {
    /// Get a prekey record by id.
    fn load_prekey(&self, id: u16) -> StoreResult<Option<Vec<u8>>>;

    /// Store a prekey record, replacing any record with the same id.
    fn save_prekey(&self, id: u16, record: &[u8]) -> StoreResult<()>;

    /// Remove a prekey. Removing a missing prekey is not an error.
    fn remove_prekey(&self, id: u16) -> StoreResult<()>;

    /// Ids of all stored prekeys, ascending.
    fn prekey_ids(&self) -> StoreResult<Vec<u16>>;
}

/// Storage for session records, keyed by the caller-chosen session id.
pub trait SessionStore: Send + Sync {
    /// Get a session record.
    fn load_session(&self, id: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Check if a session record exists.
    fn has_session(&self, id: &str) -> StoreResult<bool>;

    /// Store a session record.
    fn save_session(&self, id: &str, record: &[u8]) -> StoreResult<()>;

    /// Delete a session record. Deleting a missing session is not an error.
    fn delete_session(&self, id: &str) -> StoreResult<()>;

    /// Ids of all stored sessions, sorted.
    fn session_ids(&self) -> StoreResult<Vec<String>>;
}

/// Combined store interface used by the engine.
pub trait Store: IdentityStore + PreKeyStore + SessionStore {}

// Blanket implementation for any type that implements all store traits
impl<T> Store for T where T: IdentityStore + PreKeyStore + SessionStore {}
