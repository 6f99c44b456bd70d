//! Session handles.
//!
//! A [`Session`] is a cheap, clonable handle to one cached ratchet session.
//! Clones share state, so the cache can hand out the same instance to every
//! caller. The handle keeps only a weak reference to its box.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::cryptobox::BoxInner;
use crate::engine::{Engine, EngineSession};
use crate::error::{CryptoboxError, Result};

struct SessionState {
    engine: Option<EngineSession>,
    dirty: bool,
}

struct SessionInner {
    id: String,
    state: Mutex<SessionState>,
    owner: Weak<Mutex<BoxInner>>,
}

/// Encrypted session with one peer device.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

/// A session created from an incoming message, together with the payload
/// decrypted from that message.
#[derive(Debug, Clone)]
pub struct SessionMessage {
    pub session: Session,
    pub plaintext: Vec<u8>,
}

impl Session {
    pub(crate) fn new(engine: EngineSession, dirty: bool, owner: Weak<Mutex<BoxInner>>) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                id: engine.id().to_string(),
                state: Mutex::new(SessionState {
                    engine: Some(engine),
                    dirty,
                }),
                owner,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Encrypt a payload for the peer. Marks the session as requiring save.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.mutate_in_box(|s| s.encrypt(plaintext))
    }

    /// Decrypt a message from the peer. Marks the session as requiring save.
    /// A failed decryption leaves the session untouched.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.mutate_in_box(|s| s.decrypt(ciphertext))
    }

    /// Persist this session now.
    pub fn save(&self) -> Result<()> {
        let owner = self.owner()?;
        let mut inner = owner.lock().map_err(|_| CryptoboxError::poisoned("crypto box"))?;
        inner.save_session(self)
    }

    /// Hex-encoded fingerprint of the peer identity.
    pub fn remote_fingerprint(&self) -> Result<Vec<u8>> {
        let state = self.state()?;
        let engine = state
            .engine
            .as_ref()
            .ok_or(CryptoboxError::IllegalState("session is closed"))?;
        Ok(engine.remote_fingerprint().into_bytes())
    }

    pub fn is_closed(&self) -> bool {
        self.inner
            .state
            .lock()
            .map(|s| s.engine.is_none())
            .unwrap_or(true)
    }

    /// Whether the session holds mutations that were not saved yet.
    pub fn is_dirty(&self) -> bool {
        self.inner.state.lock().map(|s| s.dirty).unwrap_or(false)
    }

    /// Whether both handles refer to the same instance.
    pub fn ptr_eq(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn belongs_to(&self, owner: &Arc<Mutex<BoxInner>>) -> bool {
        std::ptr::eq(self.inner.owner.as_ptr(), Arc::as_ptr(owner))
    }

    /// Run a state-changing engine call and flag the session dirty on
    /// success. Does not touch the box.
    pub(crate) fn mutate<T>(&self, op: impl FnOnce(&mut EngineSession) -> Result<T>) -> Result<T> {
        let mut state = self.state()?;
        let engine = state
            .engine
            .as_mut()
            .ok_or(CryptoboxError::IllegalState("session is closed"))?;
        let out = op(engine)?;
        state.dirty = true;
        Ok(out)
    }

    pub(crate) fn persist(&self, engine: &Engine) -> Result<()> {
        let mut state = self.state()?;
        let session = state
            .engine
            .as_mut()
            .ok_or(CryptoboxError::IllegalState("session is closed"))?;
        engine.session_save(session)?;
        state.dirty = false;
        Ok(())
    }

    /// Release the engine handle. Returns false if it was already released.
    pub(crate) fn close(&self) -> bool {
        match self.inner.state.lock() {
            Ok(mut state) => state.engine.take().is_some(),
            Err(_) => false,
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, SessionState>> {
        self.inner
            .state
            .lock()
            .map_err(|_| CryptoboxError::poisoned("session"))
    }

    fn owner(&self) -> Result<Arc<Mutex<BoxInner>>> {
        self.inner
            .owner
            .upgrade()
            .ok_or(CryptoboxError::IllegalState("crypto box was dropped"))
    }

    /// [`Session::mutate`] with the box lock held for the whole call, so
    /// the change and its requires-save entry land together.
    fn mutate_in_box<T>(&self, op: impl FnOnce(&mut EngineSession) -> Result<T>) -> Result<T> {
        let owner = self.owner()?;
        let mut inner = owner.lock().map_err(|_| CryptoboxError::poisoned("crypto box"))?;
        inner.engine()?;
        let out = self.mutate(op)?;
        inner.require_save(self)?;
        Ok(out)
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Session {}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("closed", &self.is_closed())
            .field("dirty", &self.is_dirty())
            .finish()
    }
}
