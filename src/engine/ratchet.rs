//! Double ratchet state.
//!
//! The root key is advanced by a DH step whenever the peer presents a new
//! ratchet key. Each chain key is advanced by an HMAC step per message:
//! `0x01` yields the message key and `0x02` the next chain key. Message keys
//! are used once.
//!
//! A bounded number of receive chains is retained so that late messages
//! from an earlier peer turn still decrypt. Within a chain, keys for
//! skipped counters are cached up to `max_counter_gap` entries.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::crypto::encoding::key32;
use crate::crypto::{derive_key_pair, hmac_step, Cipher, KeyPair};
use crate::engine::message::CipherMessage;
use crate::error::{CryptoboxError, Result};

const ROOT_INFO: &[u8] = b"cryptobox ratchet root";
const MESSAGE_KEY_STEP: u8 = 0x01;
const CHAIN_KEY_STEP: u8 = 0x02;

/// Window limits applied when receiving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatchetLimits {
    /// Largest forward jump in counters accepted within one chain.
    pub max_counter_gap: u32,
    /// Number of receive chains kept for late messages.
    pub max_recv_chains: usize,
}

impl Default for RatchetLimits {
    fn default() -> Self {
        Self {
            max_counter_gap: 1000,
            max_recv_chains: 5,
        }
    }
}

fn kdf_rk(root_key: &[u8; 32], dh_output: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    derive_key_pair(Some(root_key), dh_output, ROOT_INFO)
}

fn kdf_ck(chain_key: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    (
        hmac_step(chain_key, CHAIN_KEY_STEP),
        hmac_step(chain_key, MESSAGE_KEY_STEP),
    )
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SendChain {
    ratchet: KeyPair,
    #[serde(with = "key32")]
    chain_key: [u8; 32],
    counter: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SkippedKey {
    counter: u32,
    #[serde(with = "key32")]
    key: [u8; 32],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RecvChain {
    #[serde(with = "key32")]
    ratchet_key: [u8; 32],
    #[serde(with = "key32")]
    chain_key: [u8; 32],
    counter: u32,
    /// Ascending by counter.
    skipped: Vec<SkippedKey>,
}

impl RecvChain {
    fn new(ratchet_key: [u8; 32], chain_key: [u8; 32]) -> Self {
        Self {
            ratchet_key,
            chain_key,
            counter: 0,
            skipped: Vec::new(),
        }
    }

    /// The message key for `counter`, advancing the chain as needed.
    fn message_key(&mut self, counter: u32, limits: &RatchetLimits) -> Result<[u8; 32]> {
        if counter < self.counter {
            // Only a counter older than every retained skipped key is outdated.
            if matches!(self.skipped.first(), Some(oldest) if counter < oldest.counter) {
                return Err(CryptoboxError::OutdatedMessage);
            }
            return match self.skipped.iter().position(|k| k.counter == counter) {
                Some(idx) => Ok(self.skipped.remove(idx).key),
                None => Err(CryptoboxError::DuplicateMessage),
            };
        }

        if counter - self.counter > limits.max_counter_gap {
            return Err(CryptoboxError::TooDistantFuture);
        }

        while self.counter < counter {
            let (next, mk) = kdf_ck(&self.chain_key);
            self.skipped.push(SkippedKey {
                counter: self.counter,
                key: mk,
            });
            self.chain_key = next;
            self.counter += 1;
        }
        let excess = self.skipped.len().saturating_sub(limits.max_counter_gap as usize);
        self.skipped.drain(..excess);

        let (next, mk) = kdf_ck(&self.chain_key);
        self.chain_key = next;
        self.counter += 1;
        Ok(mk)
    }
}

/// Ratchet state of one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatchetState {
    #[serde(with = "key32")]
    root_key: [u8; 32],
    send: SendChain,
    /// Newest first.
    recv_chains: VecDeque<RecvChain>,
}

impl RatchetState {
    /// State of the side that starts the session from a peer prekey.
    pub fn init_initiator(shared_secret: &[u8; 32], their_ratchet: &[u8; 32]) -> Result<Self> {
        let ratchet = KeyPair::generate();
        let (root_key, chain_key) = kdf_rk(shared_secret, &ratchet.dh(their_ratchet)?);

        Ok(Self {
            root_key,
            send: SendChain {
                ratchet,
                chain_key,
                counter: 0,
            },
            recv_chains: VecDeque::new(),
        })
    }

    /// State of the side that owns the prekey, built from the first message
    /// received. Returns the state together with the decrypted plaintext.
    pub fn init_responder(
        shared_secret: &[u8; 32],
        prekey: KeyPair,
        first: &CipherMessage,
        limits: &RatchetLimits,
    ) -> Result<(Self, Vec<u8>)> {
        let mut state = Self {
            root_key: *shared_secret,
            send: SendChain {
                ratchet: prekey,
                chain_key: [0u8; 32],
                counter: 0,
            },
            recv_chains: VecDeque::new(),
        };
        let plaintext = state.decrypt(first, limits)?;
        Ok((state, plaintext))
    }

    /// Whether `ratchet_key` belongs to one of the retained receive chains.
    pub fn knows_ratchet_key(&self, ratchet_key: &[u8; 32]) -> bool {
        self.recv_chains.iter().any(|c| &c.ratchet_key == ratchet_key)
    }

    /// Whether the peer has answered since the session was created.
    pub fn has_received(&self) -> bool {
        !self.recv_chains.is_empty()
    }

    /// Counter the next outgoing message will carry.
    pub fn send_counter(&self) -> u32 {
        self.send.counter
    }

    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<CipherMessage> {
        let (next, mk) = kdf_ck(&self.send.chain_key);
        let ratchet_key = self.send.ratchet.public;
        let counter = self.send.counter;

        let ad = CipherMessage::associated_data(&ratchet_key, counter);
        let ciphertext = Cipher::for_message_key(&mk)
            .encrypt(plaintext, &ad)
            .map_err(CryptoboxError::encode)?;

        self.send.chain_key = next;
        self.send.counter = counter
            .checked_add(1)
            .ok_or_else(|| CryptoboxError::InvalidMessage("send counter exhausted".into()))?;

        Ok(CipherMessage {
            ratchet_key,
            counter,
            ciphertext,
        })
    }

    /// Decrypt one message. The state is only changed if decryption succeeds.
    pub fn decrypt(&mut self, message: &CipherMessage, limits: &RatchetLimits) -> Result<Vec<u8>> {
        let mut next = self.clone();
        let plaintext = next.decrypt_in_place(message, limits)?;
        *self = next;
        Ok(plaintext)
    }

    fn decrypt_in_place(&mut self, message: &CipherMessage, limits: &RatchetLimits) -> Result<Vec<u8>> {
        let idx = match self
            .recv_chains
            .iter()
            .position(|c| c.ratchet_key == message.ratchet_key)
        {
            Some(idx) => idx,
            None => {
                self.ratchet_step(&message.ratchet_key, limits)?;
                0
            }
        };

        let mk = self.recv_chains[idx].message_key(message.counter, limits)?;
        let ad = CipherMessage::associated_data(&message.ratchet_key, message.counter);
        Cipher::for_message_key(&mk)
            .decrypt(&message.ciphertext, &ad)
            .map_err(|_| CryptoboxError::InvalidSignature)
    }

    fn ratchet_step(&mut self, their_ratchet: &[u8; 32], limits: &RatchetLimits) -> Result<()> {
        let (root_key, recv_chain_key) = kdf_rk(&self.root_key, &self.send.ratchet.dh(their_ratchet)?);

        let ratchet = KeyPair::generate();
        let (root_key, send_chain_key) = kdf_rk(&root_key, &ratchet.dh(their_ratchet)?);

        self.root_key = root_key;
        self.send = SendChain {
            ratchet,
            chain_key: send_chain_key,
            counter: 0,
        };
        self.recv_chains
            .push_front(RecvChain::new(*their_ratchet, recv_chain_key));
        self.recv_chains.truncate(limits.max_recv_chains.max(1));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (RatchetState, KeyPair, [u8; 32]) {
        let shared = [42u8; 32];
        let prekey = KeyPair::generate();
        let alice = RatchetState::init_initiator(&shared, &prekey.public).unwrap();
        (alice, prekey, shared)
    }

    #[test]
    fn test_conversation_in_both_directions() {
        let limits = RatchetLimits::default();
        let (mut alice, prekey, shared) = pair();

        let first = alice.encrypt(b"hello").unwrap();
        let (mut bob, plain) = RatchetState::init_responder(&shared, prekey, &first, &limits).unwrap();
        assert_eq!(plain, b"hello");

        let reply = bob.encrypt(b"hi alice").unwrap();
        assert_eq!(alice.decrypt(&reply, &limits).unwrap(), b"hi alice");
        assert!(alice.has_received());

        let again = alice.encrypt(b"new turn").unwrap();
        assert_ne!(again.ratchet_key, first.ratchet_key);
        assert_eq!(bob.decrypt(&again, &limits).unwrap(), b"new turn");
    }

    #[test]
    fn test_out_of_order_then_duplicate() {
        let limits = RatchetLimits::default();
        let (mut alice, prekey, shared) = pair();

        let m0 = alice.encrypt(b"0").unwrap();
        let m1 = alice.encrypt(b"1").unwrap();
        let m2 = alice.encrypt(b"2").unwrap();

        let (mut bob, _) = RatchetState::init_responder(&shared, prekey, &m0, &limits).unwrap();
        assert_eq!(bob.decrypt(&m2, &limits).unwrap(), b"2");
        assert_eq!(bob.decrypt(&m1, &limits).unwrap(), b"1");
        assert!(matches!(bob.decrypt(&m1, &limits), Err(CryptoboxError::DuplicateMessage)));
    }

    #[test]
    fn test_redelivery_without_skipped_keys_is_duplicate() {
        let limits = RatchetLimits::default();
        let (mut alice, prekey, shared) = pair();

        let m0 = alice.encrypt(b"0").unwrap();
        let m1 = alice.encrypt(b"1").unwrap();
        let (mut bob, _) = RatchetState::init_responder(&shared, prekey, &m0, &limits).unwrap();
        assert!(matches!(bob.decrypt(&m0, &limits), Err(CryptoboxError::DuplicateMessage)));

        assert_eq!(bob.decrypt(&m1, &limits).unwrap(), b"1");
        assert!(matches!(bob.decrypt(&m1, &limits), Err(CryptoboxError::DuplicateMessage)));
    }

    #[test]
    fn test_counter_older_than_skipped_keys_is_outdated() {
        let limits = RatchetLimits {
            max_counter_gap: 2,
            max_recv_chains: 5,
        };
        let (mut alice, prekey, shared) = pair();

        let m0 = alice.encrypt(b"0").unwrap();
        let m1 = alice.encrypt(b"1").unwrap();
        let m2 = alice.encrypt(b"2").unwrap();
        let m3 = alice.encrypt(b"3").unwrap();
        let m4 = alice.encrypt(b"4").unwrap();

        let (mut bob, _) = RatchetState::init_responder(&shared, prekey, &m0, &limits).unwrap();
        assert_eq!(bob.decrypt(&m3, &limits).unwrap(), b"3");
        // Keys for 1 and 2 are now held as skipped keys.
        assert_eq!(bob.decrypt(&m4, &limits).unwrap(), b"4");
        assert_eq!(bob.decrypt(&m1, &limits).unwrap(), b"1");
        assert!(matches!(bob.decrypt(&m0, &limits), Err(CryptoboxError::OutdatedMessage)));
        assert_eq!(bob.decrypt(&m2, &limits).unwrap(), b"2");
    }

    #[test]
    fn test_large_gap_is_too_distant() {
        let limits = RatchetLimits {
            max_counter_gap: 3,
            max_recv_chains: 5,
        };
        let (mut alice, prekey, shared) = pair();

        let m0 = alice.encrypt(b"0").unwrap();
        let (mut bob, _) = RatchetState::init_responder(&shared, prekey, &m0, &limits).unwrap();
        let mut last = None;
        for _ in 0..5 {
            last = Some(alice.encrypt(b"x").unwrap());
        }
        let far = last.unwrap();
        assert!(matches!(bob.decrypt(&far, &limits), Err(CryptoboxError::TooDistantFuture)));
    }

    #[test]
    fn test_tampered_ciphertext_leaves_state_untouched() {
        let limits = RatchetLimits::default();
        let (mut alice, prekey, shared) = pair();

        let m0 = alice.encrypt(b"0").unwrap();
        let (mut bob, _) = RatchetState::init_responder(&shared, prekey, &m0, &limits).unwrap();

        let mut m1 = alice.encrypt(b"1").unwrap();
        let genuine = m1.clone();
        m1.ciphertext[0] ^= 0xff;
        assert!(matches!(bob.decrypt(&m1, &limits), Err(CryptoboxError::InvalidSignature)));
        assert_eq!(bob.decrypt(&genuine, &limits).unwrap(), b"1");
    }

    #[test]
    fn test_state_survives_serialization() {
        let limits = RatchetLimits::default();
        let (mut alice, prekey, shared) = pair();
        let m0 = alice.encrypt(b"0").unwrap();

        let restored: RatchetState =
            serde_json::from_slice(&serde_json::to_vec(&alice).unwrap()).unwrap();
        assert_eq!(restored.send_counter(), 1);

        let (_, plain) = RatchetState::init_responder(&shared, prekey, &m0, &limits).unwrap();
        assert_eq!(plain, b"0");
    }
}
