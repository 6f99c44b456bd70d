//! Session engine.
//!
//! Owns the long-term identity and turns prekeys and incoming messages into
//! ratchet sessions. It knows nothing about caching or deferred saves: every
//! handle it returns is independent, and nothing is persisted until
//! [`Engine::session_save`] is called.

pub mod message;
pub mod prekey;
pub mod ratchet;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, info};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};

use crate::crypto::encoding::key32;
use crate::crypto::{Hkdf, IdentityKey, IdentityKeyPair, KeyPair};
use crate::error::{CryptoboxError, Result};
use crate::store::Store;

use message::{Envelope, Message, PreKeyMessage};
use prekey::{PreKeyBundle, PreKeyRecord, LAST_PREKEY_ID};
use ratchet::{RatchetLimits, RatchetState};

const SESSION_VERSION: u8 = 1;
const AGREEMENT_INFO: &[u8] = b"cryptobox key agreement";
/// Base keys of accepted prekey messages kept per session.
const MAX_ACCEPTED_BASE_KEYS: usize = 100;

/// How an externally supplied identity is kept in storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityMode {
    /// The full key pair is written to storage.
    Complete,
    /// Only the public half is written; the box must always be reopened
    /// with the external identity.
    Public,
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
enum IdentityRecord {
    Complete {
        #[serde(with = "key32")]
        signing: [u8; 32],
        #[serde(with = "key32")]
        dh: [u8; 32],
    },
    Public {
        identity: IdentityKey,
    },
}

impl IdentityRecord {
    fn complete(identity: &IdentityKeyPair) -> Self {
        IdentityRecord::Complete {
            signing: *identity.signing_secret(),
            dh: *identity.dh().private_key(),
        }
    }

    fn public_key(&self) -> IdentityKey {
        match self {
            IdentityRecord::Complete { signing, dh } => {
                IdentityKeyPair::from_secrets(*signing, *dh).public()
            }
            IdentityRecord::Public { identity } => *identity,
        }
    }

    fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(CryptoboxError::encode)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| CryptoboxError::Identity(e.to_string()))
    }
}

struct EngineContext {
    store: Arc<dyn Store>,
    identity: IdentityKeyPair,
    limits: RatchetLimits,
}

impl EngineContext {
    /// Responder half of the initial key agreement.
    fn accept(&self, message: &PreKeyMessage) -> Result<(RatchetState, Vec<u8>)> {
        let bytes = self
            .store
            .load_prekey(message.prekey_id)?
            .ok_or(CryptoboxError::PrekeyNotFound(message.prekey_id))?;
        let record = PreKeyRecord::decode(&bytes)?;

        let shared = agree(&[
            record.key_pair.dh(&message.identity.dh)?,
            self.identity.dh().dh(&message.base_key)?,
            record.key_pair.dh(&message.base_key)?,
        ]);
        RatchetState::init_responder(&shared, record.key_pair, &message.message, &self.limits)
    }
}

fn agree(secrets: &[[u8; 32]; 3]) -> [u8; 32] {
    let ikm = secrets.concat();
    let okm = Hkdf::derive(None, &ikm, AGREEMENT_INFO, 32);
    let mut shared = [0u8; 32];
    shared.copy_from_slice(&okm);
    shared
}

fn check_rng() -> Result<()> {
    let mut probe = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut probe)
        .map_err(|e| CryptoboxError::Init(format!("random source unavailable: {e}")))
}

/// Handle to an opened identity and its storage.
#[derive(Clone)]
pub struct Engine {
    ctx: Arc<EngineContext>,
}

impl Engine {
    /// Open storage, generating and persisting a new identity if none exists.
    pub fn open(store: Arc<dyn Store>, limits: RatchetLimits) -> Result<Self> {
        check_rng()?;

        let identity = match store.load_identity()? {
            Some(bytes) => match IdentityRecord::decode(&bytes)? {
                IdentityRecord::Complete { signing, dh } => IdentityKeyPair::from_secrets(signing, dh),
                IdentityRecord::Public { .. } => {
                    return Err(CryptoboxError::Identity(
                        "storage holds a public identity only; open it with the external identity"
                            .into(),
                    ))
                }
            },
            None => {
                let identity = IdentityKeyPair::generate();
                store.save_identity(&IdentityRecord::complete(&identity).encode()?)?;
                info!("generated new local identity {}", identity.public().fingerprint());
                identity
            }
        };

        Ok(Self::with_identity(store, identity, limits))
    }

    /// Open storage with an identity previously exported by
    /// [`Engine::identity_copy`].
    pub fn open_with(
        store: Arc<dyn Store>,
        identity: &[u8],
        mode: IdentityMode,
        limits: RatchetLimits,
    ) -> Result<Self> {
        check_rng()?;

        let identity = match IdentityRecord::decode(identity)? {
            IdentityRecord::Complete { signing, dh } => IdentityKeyPair::from_secrets(signing, dh),
            IdentityRecord::Public { .. } => {
                return Err(CryptoboxError::Identity("external identity must be complete".into()))
            }
        };

        match store.load_identity()? {
            Some(bytes) => {
                if IdentityRecord::decode(&bytes)?.public_key() != identity.public() {
                    return Err(CryptoboxError::Identity(
                        "external identity does not match the stored one".into(),
                    ));
                }
            }
            None => {
                let record = match mode {
                    IdentityMode::Complete => IdentityRecord::complete(&identity),
                    IdentityMode::Public => IdentityRecord::Public {
                        identity: identity.public(),
                    },
                };
                store.save_identity(&record.encode()?)?;
                debug!("stored external identity ({mode:?})");
            }
        }

        Ok(Self::with_identity(store, identity, limits))
    }

    fn with_identity(store: Arc<dyn Store>, identity: IdentityKeyPair, limits: RatchetLimits) -> Self {
        Self {
            ctx: Arc::new(EngineContext {
                store,
                identity,
                limits,
            }),
        }
    }

    /// Serialised copy of the complete local identity.
    pub fn identity_copy(&self) -> Result<Vec<u8>> {
        IdentityRecord::complete(&self.ctx.identity).encode()
    }

    pub fn local_identity(&self) -> IdentityKey {
        self.ctx.identity.public()
    }

    /// Hex-encoded fingerprint of the local identity.
    pub fn local_fingerprint(&self) -> String {
        self.ctx.identity.public().fingerprint()
    }

    /// Generate and store a prekey, replacing any prekey with the same id.
    /// Returns the serialised public bundle.
    pub fn new_prekey(&self, id: u16) -> Result<Vec<u8>> {
        let record = PreKeyRecord::generate(id);
        self.ctx.store.save_prekey(id, &record.encode()?)?;
        record.bundle(&self.ctx.identity).encode()
    }

    /// Public bundle of a stored prekey, if present.
    pub fn prekey_bundle(&self, id: u16) -> Result<Option<Vec<u8>>> {
        match self.ctx.store.load_prekey(id)? {
            Some(bytes) => {
                let record = PreKeyRecord::decode(&bytes)?;
                Ok(Some(record.bundle(&self.ctx.identity).encode()?))
            }
            None => Ok(None),
        }
    }

    /// Initiator flow: start a session from a peer's prekey bundle.
    pub fn session_init_from_prekey(&self, id: &str, prekey: &[u8]) -> Result<EngineSession> {
        let bundle = PreKeyBundle::decode(prekey)?;
        bundle.verify()?;

        let base = KeyPair::generate();
        let shared = agree(&[
            self.ctx.identity.dh().dh(&bundle.public_key)?,
            base.dh(&bundle.identity.dh)?,
            base.dh(&bundle.public_key)?,
        ]);
        let ratchet = RatchetState::init_initiator(&shared, &bundle.public_key)?;

        Ok(EngineSession::new(
            &self.ctx,
            SessionRecord::new(
                id,
                self.local_identity(),
                bundle.identity,
                Some(PendingPreKey {
                    prekey_id: bundle.prekey_id,
                    base_key: base.public,
                }),
                None,
                ratchet,
            ),
        ))
    }

    /// Responder flow: build a session from an incoming prekey message and
    /// return it together with the decrypted payload.
    pub fn session_init_from_message(&self, id: &str, message: &[u8]) -> Result<(EngineSession, Vec<u8>)> {
        let envelope = Envelope::decode(message)?;
        let prekey_message = match envelope.message {
            Message::PreKey(m) => m,
            Message::Cipher(_) => {
                return Err(CryptoboxError::InvalidMessage(
                    "expected a prekey message to start a session".into(),
                ))
            }
        };

        let (ratchet, plaintext) = self.ctx.accept(&prekey_message)?;
        let mut record = SessionRecord::new(
            id,
            self.local_identity(),
            prekey_message.identity,
            None,
            Some(prekey_message.prekey_id),
            ratchet,
        );
        record.remember_base_key(&prekey_message.base_key);
        Ok((EngineSession::new(&self.ctx, record), plaintext))
    }

    pub fn session_load(&self, id: &str) -> Result<EngineSession> {
        let bytes = self
            .ctx
            .store
            .load_session(id)?
            .ok_or_else(|| CryptoboxError::SessionNotFound(id.to_string()))?;
        let record: SessionRecord = serde_json::from_slice(&bytes)?;
        if record.version != SESSION_VERSION {
            return Err(CryptoboxError::Decode(format!(
                "unsupported session version {}",
                record.version
            )));
        }
        if record.local_identity != self.local_identity() {
            return Err(CryptoboxError::Identity(format!(
                "session {id} belongs to a different local identity"
            )));
        }
        Ok(EngineSession::new(&self.ctx, record))
    }

    /// Persist a session, then retire the one-time prekey it consumed.
    pub fn session_save(&self, session: &mut EngineSession) -> Result<()> {
        session.record.saved_at = Some(Utc::now());
        let bytes = serde_json::to_vec(&session.record).map_err(CryptoboxError::encode)?;
        self.ctx.store.save_session(&session.record.session_id, &bytes)?;

        if let Some(prekey_id) = session.record.retire_prekey.take() {
            if prekey_id != LAST_PREKEY_ID {
                self.ctx.store.remove_prekey(prekey_id)?;
                debug!("retired prekey {prekey_id}");
            }
        }
        Ok(())
    }

    pub fn session_delete(&self, id: &str) -> Result<()> {
        Ok(self.ctx.store.delete_session(id)?)
    }

    pub fn session_ids(&self) -> Result<Vec<String>> {
        Ok(self.ctx.store.session_ids()?)
    }

    pub fn random_bytes(&self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        OsRng
            .try_fill_bytes(&mut buf)
            .map_err(|e| CryptoboxError::Panic(format!("random source failed: {e}")))?;
        Ok(buf)
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("identity", &self.local_fingerprint())
            .field("limits", &self.ctx.limits)
            .finish()
    }
}

/// Id of a serialised prekey bundle.
pub fn is_prekey(prekey: &[u8]) -> Result<u16> {
    Ok(PreKeyBundle::decode(prekey)?.prekey_id)
}

/// Hex-encoded fingerprint of the identity that signed a prekey bundle.
pub fn fingerprint_prekey(prekey: &[u8]) -> Result<String> {
    Ok(PreKeyBundle::decode(prekey)?.identity.fingerprint())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct PendingPreKey {
    prekey_id: u16,
    #[serde(with = "key32")]
    base_key: [u8; 32],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionRecord {
    version: u8,
    session_id: String,
    local_identity: IdentityKey,
    remote_identity: IdentityKey,
    /// Set on the initiator until the peer answers.
    pending_prekey: Option<PendingPreKey>,
    /// Prekey consumed by the responder, removed on the next save.
    retire_prekey: Option<u16>,
    /// Hex base keys of prekey messages already accepted, oldest first.
    #[serde(default)]
    accepted_base_keys: Vec<String>,
    ratchet: RatchetState,
    created_at: DateTime<Utc>,
    saved_at: Option<DateTime<Utc>>,
}

impl SessionRecord {
    fn new(
        id: &str,
        local_identity: IdentityKey,
        remote_identity: IdentityKey,
        pending_prekey: Option<PendingPreKey>,
        retire_prekey: Option<u16>,
        ratchet: RatchetState,
    ) -> Self {
        Self {
            version: SESSION_VERSION,
            session_id: id.to_string(),
            local_identity,
            remote_identity,
            pending_prekey,
            retire_prekey,
            accepted_base_keys: Vec::new(),
            ratchet,
            created_at: Utc::now(),
            saved_at: None,
        }
    }

    fn has_accepted(&self, base_key: &[u8; 32]) -> bool {
        let key = hex::encode(base_key);
        self.accepted_base_keys.iter().any(|k| *k == key)
    }

    fn remember_base_key(&mut self, base_key: &[u8; 32]) {
        if self.has_accepted(base_key) {
            return;
        }
        self.accepted_base_keys.push(hex::encode(base_key));
        let excess = self.accepted_base_keys.len().saturating_sub(MAX_ACCEPTED_BASE_KEYS);
        self.accepted_base_keys.drain(..excess);
    }
}

/// One ratchet session. Not safe for concurrent use; callers serialise.
pub struct EngineSession {
    ctx: Arc<EngineContext>,
    record: SessionRecord,
}

impl EngineSession {
    fn new(ctx: &Arc<EngineContext>, record: SessionRecord) -> Self {
        Self {
            ctx: Arc::clone(ctx),
            record,
        }
    }

    pub fn id(&self) -> &str {
        &self.record.session_id
    }

    pub fn remote_identity(&self) -> IdentityKey {
        self.record.remote_identity
    }

    /// Hex-encoded fingerprint of the peer identity.
    pub fn remote_fingerprint(&self) -> String {
        self.record.remote_identity.fingerprint()
    }

    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let message = self.record.ratchet.encrypt(plaintext)?;
        let message = match self.record.pending_prekey {
            Some(pending) => Message::PreKey(PreKeyMessage {
                prekey_id: pending.prekey_id,
                base_key: pending.base_key,
                identity: self.record.local_identity,
                message,
            }),
            None => Message::Cipher(message),
        };
        Envelope::new(message).encode()
    }

    /// Decrypt a message. On error the session state is unchanged.
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let envelope = Envelope::decode(ciphertext)?;
        let limits = self.ctx.limits;

        let plaintext = match &envelope.message {
            Message::Cipher(m) => self.record.ratchet.decrypt(m, &limits)?,
            Message::PreKey(m) => {
                if m.identity != self.record.remote_identity {
                    return Err(CryptoboxError::RemoteIdentityChanged);
                }
                if self.record.ratchet.knows_ratchet_key(&m.message.ratchet_key) {
                    self.record.ratchet.decrypt(&m.message, &limits)?
                } else if self.record.has_accepted(&m.base_key) {
                    // A handshake this session already went through, whose
                    // chain has since been dropped.
                    return Err(CryptoboxError::OutdatedMessage);
                } else {
                    // The peer started over from one of our prekeys.
                    let (ratchet, plaintext) = self.ctx.accept(m)?;
                    self.record.ratchet = ratchet;
                    self.record.retire_prekey = Some(m.prekey_id);
                    self.record.remember_base_key(&m.base_key);
                    plaintext
                }
            }
        };

        self.record.pending_prekey = None;
        Ok(plaintext)
    }
}

impl std::fmt::Debug for EngineSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineSession")
            .field("id", &self.record.session_id)
            .field("remote", &self.remote_fingerprint())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn engine() -> Engine {
        Engine::open(Arc::new(MemoryStore::new()), RatchetLimits::default()).unwrap()
    }

    #[test]
    fn test_open_reuses_stored_identity() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let first = Engine::open(Arc::clone(&store), RatchetLimits::default()).unwrap();
        let second = Engine::open(store, RatchetLimits::default()).unwrap();
        assert_eq!(first.local_fingerprint(), second.local_fingerprint());
    }

    #[test]
    fn test_prekey_message_round_trip_and_retirement() {
        let alice = engine();
        let bob = engine();

        let prekey = bob.new_prekey(7).unwrap();
        assert_eq!(is_prekey(&prekey).unwrap(), 7);
        assert_eq!(fingerprint_prekey(&prekey).unwrap(), bob.local_fingerprint());

        let mut a = alice.session_init_from_prekey("bob", &prekey).unwrap();
        let first = a.encrypt(b"hello bob").unwrap();

        let (mut b, plain) = bob.session_init_from_message("alice", &first).unwrap();
        assert_eq!(plain, b"hello bob");
        assert_eq!(b.remote_fingerprint(), alice.local_fingerprint());

        assert!(bob.prekey_bundle(7).unwrap().is_some());
        bob.session_save(&mut b).unwrap();
        assert!(bob.prekey_bundle(7).unwrap().is_none());

        let reply = b.encrypt(b"hi alice").unwrap();
        assert!(!Envelope::decode(&reply).unwrap().is_prekey_message());
        assert_eq!(a.decrypt(&reply).unwrap(), b"hi alice");

        let next = a.encrypt(b"plain cipher message now").unwrap();
        assert!(!Envelope::decode(&next).unwrap().is_prekey_message());
    }

    #[test]
    fn test_last_resort_prekey_survives_save() {
        let alice = engine();
        let bob = engine();

        let prekey = bob.new_prekey(LAST_PREKEY_ID).unwrap();
        let mut a = alice.session_init_from_prekey("bob", &prekey).unwrap();
        let (mut b, _) = bob
            .session_init_from_message("alice", &a.encrypt(b"x").unwrap())
            .unwrap();
        bob.session_save(&mut b).unwrap();

        assert!(bob.prekey_bundle(LAST_PREKEY_ID).unwrap().is_some());
    }

    #[test]
    fn test_accepted_handshake_is_not_replayed() {
        let limits = RatchetLimits {
            max_counter_gap: 1000,
            max_recv_chains: 1,
        };
        let alice = engine();
        let bob = Engine::open(Arc::new(MemoryStore::new()), limits).unwrap();

        let prekey = bob.new_prekey(LAST_PREKEY_ID).unwrap();
        let mut a = alice.session_init_from_prekey("bob", &prekey).unwrap();
        let first = a.encrypt(b"first").unwrap();
        let (mut b, _) = bob.session_init_from_message("alice", &first).unwrap();

        a.decrypt(&b.encrypt(b"ack").unwrap()).unwrap();
        b.decrypt(&a.encrypt(b"second").unwrap()).unwrap();

        assert!(matches!(b.decrypt(&first), Err(CryptoboxError::OutdatedMessage)));
        assert_eq!(b.decrypt(&a.encrypt(b"third").unwrap()).unwrap(), b"third");

        // A record saved and loaded again still knows the handshake.
        bob.session_save(&mut b).unwrap();
        let mut loaded = bob.session_load("alice").unwrap();
        assert!(matches!(loaded.decrypt(&first), Err(CryptoboxError::OutdatedMessage)));
    }

    #[test]
    fn test_cipher_message_cannot_start_a_session() {
        let alice = engine();
        let bob = engine();

        let prekey = bob.new_prekey(1).unwrap();
        let mut a = alice.session_init_from_prekey("bob", &prekey).unwrap();
        let (mut b, _) = bob
            .session_init_from_message("alice", &a.encrypt(b"x").unwrap())
            .unwrap();
        let reply = b.encrypt(b"y").unwrap();

        let err = alice.session_init_from_message("bob-again", &reply).unwrap_err();
        assert!(matches!(err, CryptoboxError::InvalidMessage(_)));
    }

    #[test]
    fn test_consumed_prekey_is_not_found() {
        let alice = engine();
        let bob = engine();

        let prekey = bob.new_prekey(3).unwrap();
        let first = alice
            .session_init_from_prekey("bob", &prekey)
            .unwrap()
            .encrypt(b"x")
            .unwrap();
        let (mut b, _) = bob.session_init_from_message("alice", &first).unwrap();
        bob.session_save(&mut b).unwrap();

        let err = bob.session_init_from_message("alice-2", &first).unwrap_err();
        assert!(matches!(err, CryptoboxError::PrekeyNotFound(3)));
    }

    #[test]
    fn test_external_identity_modes() {
        let source = engine();
        let exported = source.identity_copy().unwrap();

        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let opened = Engine::open_with(
            Arc::clone(&store),
            &exported,
            IdentityMode::Public,
            RatchetLimits::default(),
        )
        .unwrap();
        assert_eq!(opened.local_fingerprint(), source.local_fingerprint());

        let err = Engine::open(Arc::clone(&store), RatchetLimits::default()).unwrap_err();
        assert!(matches!(err, CryptoboxError::Identity(_)));

        let other = engine().identity_copy().unwrap();
        let err = Engine::open_with(store, &other, IdentityMode::Complete, RatchetLimits::default())
            .unwrap_err();
        assert!(matches!(err, CryptoboxError::Identity(_)));
    }

    #[test]
    fn test_random_bytes_have_requested_length() {
        let engine = engine();
        assert_eq!(engine.random_bytes(16).unwrap().len(), 16);
        assert!(engine.random_bytes(0).unwrap().is_empty());
    }
}
