//! The crypto box: identity, prekeys and the session cache behind one lock.
//!
//! Every call goes through a single mutex, so a box and all sessions derived
//! from it are serialised. Session encrypt and decrypt take the box lock
//! first and their own state lock inside it. A session never waits on the box
//! while holding its own lock.

use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info, warn};

use crate::cache::SessionCache;
use crate::config::BoxConfig;
use crate::engine::{self, Engine, IdentityMode};
use crate::error::{CryptoboxError, Result};
use crate::prekeys::{PreKey, PreKeys};
use crate::session::{Session, SessionMessage};
use crate::store::{FileStore, Store};

const CLOSED: CryptoboxError = CryptoboxError::IllegalState("crypto box is closed");

pub(crate) struct BoxInner {
    engine: Option<Engine>,
    prekeys: PreKeys,
    cache: SessionCache,
}

impl BoxInner {
    pub(crate) fn engine(&self) -> Result<&Engine> {
        self.engine.as_ref().ok_or(CLOSED)
    }

    pub(crate) fn require_save(&mut self, session: &Session) -> Result<()> {
        self.engine()?;
        if session.is_closed() {
            return Err(CryptoboxError::IllegalState("session is closed"));
        }
        self.cache.require_save(session.id());
        Ok(())
    }

    pub(crate) fn save_session(&mut self, session: &Session) -> Result<()> {
        let engine = self.engine.as_ref().ok_or(CLOSED)?;
        session.persist(engine)?;
        self.cache.mark_saved(session.id());
        debug!("saved session {}", session.id());
        Ok(())
    }
}

impl Drop for BoxInner {
    fn drop(&mut self) {
        self.cache.close_all();
    }
}

/// Local identity plus all sessions and prekeys derived from it.
pub struct CryptoBox {
    inner: Arc<Mutex<BoxInner>>,
    path: Option<PathBuf>,
}

fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(CryptoboxError::InvalidArgument("session id is empty".into()));
    }
    if id.contains('\0') {
        return Err(CryptoboxError::Nul);
    }
    Ok(())
}

impl CryptoBox {
    /// Open the box stored in `path`, creating a new identity if the
    /// directory is empty.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_config(&BoxConfig::default().with_path(path.as_ref()))
    }

    pub fn open_with_config(config: &BoxConfig) -> Result<Self> {
        let store = FileStore::open(&config.path)?.with_sync_writes(config.sync_writes);
        let engine = Engine::open(Arc::new(store), config.limits())?;
        info!("opened crypto box at {}", config.path.display());
        Ok(Self::from_engine(engine, Some(config.path.clone())))
    }

    /// Open the box in `path` with an identity exported by
    /// [`CryptoBox::identity_copy`]. With [`IdentityMode::Public`] only the
    /// public half is written to disk.
    pub fn open_with_identity(path: impl AsRef<Path>, identity: &[u8], mode: IdentityMode) -> Result<Self> {
        let config = BoxConfig::default().with_path(path.as_ref());
        let store = FileStore::open(&config.path)?.with_sync_writes(config.sync_writes);
        let engine = Engine::open_with(Arc::new(store), identity, mode, config.limits())?;
        info!("opened crypto box at {} with external identity", config.path.display());
        Ok(Self::from_engine(engine, Some(config.path)))
    }

    /// Open a box over any store.
    pub fn open_with_store(store: Arc<dyn Store>, config: &BoxConfig) -> Result<Self> {
        let engine = Engine::open(store, config.limits())?;
        Ok(Self::from_engine(engine, None))
    }

    fn from_engine(engine: Engine, path: Option<PathBuf>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BoxInner {
                engine: Some(engine),
                prekeys: PreKeys::default(),
                cache: SessionCache::default(),
            })),
            path,
        }
    }

    /// Storage directory, if the box is file backed.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> Result<MutexGuard<'_, BoxInner>> {
        self.inner.lock().map_err(|_| CryptoboxError::poisoned("crypto box"))
    }

    fn new_session(&self, engine: engine::EngineSession, dirty: bool) -> Session {
        Session::new(engine, dirty, Arc::downgrade(&self.inner))
    }

    /// Initiator flow: start a session with a peer from one of its prekeys.
    /// The session is cached and requires save; nothing is persisted yet.
    pub fn session_with_id(&self, id: &str, prekey: &PreKey) -> Result<Session> {
        validate_id(id)?;
        let mut inner = self.lock()?;
        let engine_session = inner.engine()?.session_init_from_prekey(id, prekey.data())?;

        let session = self.new_session(engine_session, true);
        inner.cache.insert_new(session.clone());
        debug!("created session {id} from prekey {}", prekey.id());
        Ok(session)
    }

    /// Initiator flow from a base64 encoded prekey.
    pub fn session_with_id_from_string_prekey(&self, id: &str, prekey: &str) -> Result<Session> {
        self.session_with_id(id, &PreKey::from_base64(prekey)?)
    }

    /// Responder flow: build a session from an incoming message and decrypt it.
    ///
    /// If a session with this id already exists, the message is decrypted
    /// through it instead. The consumed prekey is removed when the session is
    /// saved, so save before acknowledging the message.
    pub fn session_message_with_id(&self, id: &str, message: &[u8]) -> Result<SessionMessage> {
        validate_id(id)?;
        let mut inner = self.lock()?;
        inner.engine()?;

        let existing = match inner.cache.get(id) {
            Some(session) => Some(session),
            None => match inner.engine()?.session_load(id) {
                Ok(engine_session) => {
                    let session = self.new_session(engine_session, false);
                    inner.cache.insert_loaded(session.clone());
                    Some(session)
                }
                Err(CryptoboxError::SessionNotFound(_)) => None,
                Err(err) => return Err(err),
            },
        };

        if let Some(session) = existing {
            let plaintext = session.mutate(|s| s.decrypt(message))?;
            inner.cache.require_save(id);
            return Ok(SessionMessage { session, plaintext });
        }

        let (engine_session, plaintext) = inner.engine()?.session_init_from_message(id, message)?;
        let session = self.new_session(engine_session, true);
        inner.cache.insert_new(session.clone());
        debug!("created session {id} from incoming message");
        Ok(SessionMessage { session, plaintext })
    }

    /// The cached session for `id`, or the last saved state from storage.
    pub fn session_by_id(&self, id: &str) -> Result<Session> {
        validate_id(id)?;
        let mut inner = self.lock()?;
        if let Some(session) = inner.cache.get(id) {
            return Ok(session);
        }

        let engine_session = inner.engine()?.session_load(id)?;
        let session = self.new_session(engine_session, false);
        inner.cache.insert_loaded(session.clone());
        Ok(session)
    }

    /// Close the cached instance, if any, and delete the session from
    /// storage. Cannot be undone.
    pub fn delete_session_with_id(&self, id: &str) -> Result<bool> {
        validate_id(id)?;
        let mut inner = self.lock()?;
        let engine = inner.engine()?.clone();
        if let Some(session) = inner.cache.evict(id) {
            session.close();
        }
        engine.session_delete(id)?;
        info!("deleted session {id}");
        Ok(true)
    }

    /// Schedule a session for the next batch save.
    pub fn set_session_to_require_save(&self, session: &Session) -> Result<()> {
        self.lock()?.require_save(session)
    }

    /// Save every session scheduled for saving. Returns how many were saved.
    pub fn save_sessions_requiring_save(&self) -> Result<usize> {
        let mut inner = self.lock()?;
        let BoxInner { engine, cache, .. } = &mut *inner;
        let engine = engine.as_ref().ok_or(CLOSED)?;

        let saved = cache.save_all(engine)?;
        if saved > 0 {
            debug!("saved {saved} sessions");
        }
        Ok(saved)
    }

    /// Forget which sessions require saving, without saving them.
    pub fn reset_sessions_requiring_save(&self) -> Result<()> {
        let mut inner = self.lock()?;
        inner.engine()?;
        inner.cache.reset_requires_save();
        Ok(())
    }

    /// Drop unsaved changes of an outgoing session. The next lookup reads the
    /// last saved state back from storage.
    ///
    /// Only for sessions whose new state has not reached the peer. Never roll
    /// back after decrypting: the peer's ratchet has already moved on.
    pub fn rollback_session(&self, session: &Session) -> Result<()> {
        let mut inner = self.lock()?;
        inner.engine()?;
        self.release(&mut inner, session);
        debug!("rolled back session {}", session.id());
        Ok(())
    }

    /// Close a session and drop it from the cache. Storage is untouched.
    pub fn close_session(&self, session: &Session) -> Result<()> {
        let mut inner = self.lock()?;
        inner.engine()?;
        if self.release(&mut inner, session) && session.is_dirty() {
            warn!("closed session {} with unsaved changes", session.id());
        }
        Ok(())
    }

    fn release(&self, inner: &mut BoxInner, session: &Session) -> bool {
        if !session.belongs_to(&self.inner) {
            return false;
        }
        if inner.cache.get(session.id()).is_some_and(|cached| cached.ptr_eq(session)) {
            inner.cache.evict(session.id());
        }
        session.close()
    }

    pub fn close_all_sessions(&self) -> Result<()> {
        let mut inner = self.lock()?;
        inner.engine()?;
        let closed = inner.cache.close_all();
        debug!("closed {closed} sessions");
        Ok(())
    }

    /// Close every session and release the identity. Terminal.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.lock()?;
        inner.engine()?;
        inner.cache.close_all();
        inner.engine = None;
        info!("closed crypto box");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner
            .lock()
            .map(|inner| inner.engine.is_none())
            .unwrap_or(true)
    }

    /// Hex-encoded fingerprint of the local identity.
    pub fn local_fingerprint(&self) -> Result<Vec<u8>> {
        Ok(self.lock()?.engine()?.local_fingerprint().into_bytes())
    }

    /// Serialised copy of the complete local identity, for
    /// [`CryptoBox::open_with_identity`].
    pub fn identity_copy(&self) -> Result<Vec<u8>> {
        self.lock()?.engine()?.identity_copy()
    }

    pub fn last_prekey(&self) -> Result<PreKey> {
        let mut inner = self.lock()?;
        let BoxInner { engine, prekeys, .. } = &mut *inner;
        prekeys.last_resort(engine.as_ref().ok_or(CLOSED)?)
    }

    /// Generate one-time prekeys for every id in `range`. The range must lie
    /// within `[0, MAX_PREKEY_ID)`, otherwise nothing is generated.
    pub fn generate_prekeys(&self, range: Range<u32>) -> Result<Vec<PreKey>> {
        let inner = self.lock()?;
        inner.prekeys.generate(inner.engine()?, range)
    }

    pub fn random_bytes(&self, len: usize) -> Result<Vec<u8>> {
        self.lock()?.engine()?.random_bytes(len)
    }

    /// Ids of all sessions in storage.
    pub fn session_ids(&self) -> Result<Vec<String>> {
        self.lock()?.engine()?.session_ids()
    }

    pub fn requires_save_count(&self) -> Result<usize> {
        let inner = self.lock()?;
        inner.engine()?;
        Ok(inner.cache.requires_save_count())
    }

    pub fn is_cached(&self, id: &str) -> Result<bool> {
        let inner = self.lock()?;
        inner.engine()?;
        Ok(inner.cache.contains(id))
    }
}

impl std::fmt::Debug for CryptoBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoBox")
            .field("path", &self.path)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Id of a serialised prekey bundle, or an error if the bytes are not one.
pub fn is_prekey(prekey: &[u8]) -> Result<u16> {
    engine::is_prekey(prekey)
}

/// Hex-encoded fingerprint of the identity that signed a prekey bundle.
pub fn fingerprint_prekey(prekey: &[u8]) -> Result<Vec<u8>> {
    Ok(engine::fingerprint_prekey(prekey)?.into_bytes())
}
