//! In-memory store implementation for tests and ephemeral boxes.
//!
//! Nothing survives the process. Session writes can be made to fail on
//! demand, which lets callers exercise partial batch saves.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use crate::store::{IdentityStore, PreKeyStore, SessionStore, StoreError, StoreResult};

/// In-memory implementation of all store traits.
pub struct MemoryStore {
    identity: RwLock<Option<Vec<u8>>>,
    prekeys: RwLock<BTreeMap<u16, Vec<u8>>>,
    sessions: RwLock<BTreeMap<String, Vec<u8>>>,
    failing_sessions: RwLock<HashSet<String>>,
    session_writes: AtomicUsize,
}

fn poisoned() -> StoreError {
    StoreError::Unavailable("lock poisoned".to_string())
}

impl MemoryStore {
    /// Create a new, empty in-memory store.
    pub fn new() -> Self {
        Self {
            identity: RwLock::new(None),
            prekeys: RwLock::new(BTreeMap::new()),
            sessions: RwLock::new(BTreeMap::new()),
            failing_sessions: RwLock::new(HashSet::new()),
            session_writes: AtomicUsize::new(0),
        }
    }

    /// Make every following write of the given session fail.
    pub fn fail_session_writes(&self, id: &str) -> StoreResult<()> {
        let mut failing = self.failing_sessions.write().map_err(|_| poisoned())?;
        failing.insert(id.to_string());
        Ok(())
    }

    /// Let all session writes succeed again.
    pub fn clear_failures(&self) -> StoreResult<()> {
        let mut failing = self.failing_sessions.write().map_err(|_| poisoned())?;
        failing.clear();
        Ok(())
    }

    /// Number of successful session writes so far.
    pub fn session_writes(&self) -> usize {
        self.session_writes.load(Ordering::SeqCst)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityStore for MemoryStore {
    fn load_identity(&self) -> StoreResult<Option<Vec<u8>>> {
        let identity = self.identity.read().map_err(|_| poisoned())?;
        Ok(identity.clone())
    }

    fn save_identity(&self, identity: &[u8]) -> StoreResult<()> {
        let mut slot = self.identity.write().map_err(|_| poisoned())?;
        *slot = Some(identity.to_vec());
        Ok(())
    }
}

impl PreKeyStore for MemoryStore {
    fn load_prekey(&self, id: u16) -> StoreResult<Option<Vec<u8>>> {
        let prekeys = self.prekeys.read().map_err(|_| poisoned())?;
        Ok(prekeys.get(&id).cloned())
    }

    fn save_prekey(&self, id: u16, record: &[u8]) -> StoreResult<()> {
        let mut prekeys = self.prekeys.write().map_err(|_| poisoned())?;
        prekeys.insert(id, record.to_vec());
        Ok(())
    }

    fn remove_prekey(&self, id: u16) -> StoreResult<()> {
        let mut prekeys = self.prekeys.write().map_err(|_| poisoned())?;
        prekeys.remove(&id);
        Ok(())
    }

    fn prekey_ids(&self) -> StoreResult<Vec<u16>> {
        let prekeys = self.prekeys.read().map_err(|_| poisoned())?;
        Ok(prekeys.keys().copied().collect())
    }
}

impl SessionStore for MemoryStore {
    fn load_session(&self, id: &str) -> StoreResult<Option<Vec<u8>>> {
        let sessions = self.sessions.read().map_err(|_| poisoned())?;
        Ok(sessions.get(id).cloned())
    }

    fn has_session(&self, id: &str) -> StoreResult<bool> {
        let sessions = self.sessions.read().map_err(|_| poisoned())?;
        Ok(sessions.contains_key(id))
    }

    fn save_session(&self, id: &str, record: &[u8]) -> StoreResult<()> {
        {
            let failing = self.failing_sessions.read().map_err(|_| poisoned())?;
            if failing.contains(id) {
                return Err(StoreError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!("injected write failure for session {id}"),
                )));
            }
        }
        let mut sessions = self.sessions.write().map_err(|_| poisoned())?;
        sessions.insert(id.to_string(), record.to_vec());
        self.session_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn delete_session(&self, id: &str) -> StoreResult<()> {
        let mut sessions = self.sessions.write().map_err(|_| poisoned())?;
        sessions.remove(id);
        Ok(())
    }

    fn session_ids(&self) -> StoreResult<Vec<String>> {
        let sessions = self.sessions.read().map_err(|_| poisoned())?;
        Ok(sessions.keys().cloned().collect())
    }
}
