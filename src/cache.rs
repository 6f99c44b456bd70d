//! Per-box session cache.
//!
//! Holds at most one live [`Session`] per id and the ordered set of ids whose
//! state has not been saved yet.

use std::collections::{BTreeSet, HashMap};

use log::{debug, warn};

use crate::engine::Engine;
use crate::error::Result;
use crate::session::Session;

#[derive(Default)]
pub(crate) struct SessionCache {
    sessions: HashMap<String, Session>,
    requires_save: BTreeSet<String>,
}

impl SessionCache {
    pub fn get(&self, id: &str) -> Option<Session> {
        self.sessions.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    /// Cache a session read back from storage. It starts clean.
    pub fn insert_loaded(&mut self, session: Session) {
        self.sessions.insert(session.id().to_string(), session);
    }

    /// Cache a freshly created session and schedule it for saving. Any
    /// previous instance for the same id is closed.
    pub fn insert_new(&mut self, session: Session) {
        let id = session.id().to_string();
        if let Some(previous) = self.sessions.insert(id.clone(), session) {
            previous.close();
            debug!("replaced cached session {id}");
        }
        self.requires_save.insert(id);
    }

    /// Drop a session from the cache without touching storage.
    pub fn evict(&mut self, id: &str) -> Option<Session> {
        self.requires_save.remove(id);
        self.sessions.remove(id)
    }

    pub fn require_save(&mut self, id: &str) {
        self.requires_save.insert(id.to_string());
    }

    pub fn mark_saved(&mut self, id: &str) {
        self.requires_save.remove(id);
    }

    pub fn requires_save_count(&self) -> usize {
        self.requires_save.len()
    }

    pub fn reset_requires_save(&mut self) {
        self.requires_save.clear();
    }

    /// Save every session in the requires-save set, in id order.
    ///
    /// Stops at the first failure. Ids that were saved are removed from the
    /// set; the failing id and those not yet attempted stay in it.
    pub fn save_all(&mut self, engine: &Engine) -> Result<usize> {
        let pending: Vec<String> = self.requires_save.iter().cloned().collect();
        let mut saved = 0;

        for id in pending {
            match self.sessions.get(&id) {
                Some(session) => {
                    if let Err(err) = session.persist(engine) {
                        warn!("saving session {id} failed: {err}");
                        return Err(err);
                    }
                    saved += 1;
                }
                None => debug!("session {id} no longer cached, skipping save"),
            }
            self.requires_save.remove(&id);
        }

        Ok(saved)
    }

    /// Close and drop every cached session.
    pub fn close_all(&mut self) -> usize {
        self.requires_save.clear();
        let sessions = std::mem::take(&mut self.sessions);
        sessions.values().filter(|s| s.close()).count()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Weak};

    use super::*;
    use crate::engine::ratchet::RatchetLimits;
    use crate::store::{MemoryStore, Store};

    fn session_pair(engine: &Engine, peer: &Engine, id: &str) -> Session {
        let prekey = peer.new_prekey(1).unwrap();
        let session = engine.session_init_from_prekey(id, &prekey).unwrap();
        Session::new(session, true, Weak::new())
    }

    fn engines() -> (Engine, Engine, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let engine = Engine::open(Arc::clone(&store) as Arc<dyn Store>, RatchetLimits::default()).unwrap();
        let peer = Engine::open(Arc::new(MemoryStore::new()), RatchetLimits::default()).unwrap();
        (engine, peer, store)
    }

    #[test]
    fn test_insert_new_replaces_and_closes_previous() {
        let (engine, peer, _) = engines();
        let mut cache = SessionCache::default();

        let first = session_pair(&engine, &peer, "a");
        cache.insert_new(first.clone());
        let second = session_pair(&engine, &peer, "a");
        cache.insert_new(second.clone());

        assert!(first.is_closed());
        assert!(cache.get("a").unwrap().ptr_eq(&second));
        assert_eq!(cache.requires_save_count(), 1);
    }

    #[test]
    fn test_save_all_is_idempotent() {
        let (engine, peer, store) = engines();
        let mut cache = SessionCache::default();
        cache.insert_new(session_pair(&engine, &peer, "a"));
        cache.insert_new(session_pair(&engine, &peer, "b"));

        assert_eq!(cache.save_all(&engine).unwrap(), 2);
        assert_eq!(cache.save_all(&engine).unwrap(), 0);
        assert_eq!(store.session_writes(), 2);
    }

    #[test]
    fn test_failed_save_keeps_remaining_ids() {
        let (engine, peer, store) = engines();
        let mut cache = SessionCache::default();
        for id in ["a", "b", "c"] {
            cache.insert_new(session_pair(&engine, &peer, id));
        }
        store.fail_session_writes("b").unwrap();

        assert!(cache.save_all(&engine).is_err());
        assert_eq!(cache.requires_save_count(), 2);

        store.clear_failures().unwrap();
        assert_eq!(cache.save_all(&engine).unwrap(), 2);
        assert_eq!(cache.requires_save_count(), 0);
    }

    #[test]
    fn test_evict_drops_pending_save() {
        let (engine, peer, _) = engines();
        let mut cache = SessionCache::default();
        cache.insert_new(session_pair(&engine, &peer, "a"));

        let evicted = cache.evict("a").unwrap();
        assert!(!evicted.is_closed());
        assert!(!cache.contains("a"));
        assert_eq!(cache.requires_save_count(), 0);
    }

    #[test]
    fn test_close_all_closes_every_session() {
        let (engine, peer, _) = engines();
        let mut cache = SessionCache::default();
        let a = session_pair(&engine, &peer, "a");
        cache.insert_new(a.clone());
        cache.insert_loaded(session_pair(&engine, &peer, "b"));

        assert_eq!(cache.close_all(), 2);
        assert!(a.is_closed());
        assert!(cache.get("b").is_none());
        assert_eq!(cache.requires_save_count(), 0);
    }
}
