//! Key pair utilities.
//!
//! Curve25519 key pairs drive the key agreement and the ratchet. A long-term
//! identity pairs an Ed25519 signing key (prekey signatures, fingerprints)
//! with a Curve25519 key used in the initial key agreement.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::crypto::encoding::key32;
use crate::error::{CryptoboxError, Result};

/// A Curve25519 key pair.
#[derive(Clone)]
pub struct KeyPair {
    /// Public key (32 bytes)
    pub public: [u8; 32],
    private: [u8; 32],
}

impl KeyPair {
    /// Generate a new random key pair.
    pub fn generate() -> Self {
        let mut private = [0u8; 32];
        OsRng.fill_bytes(&mut private);

        // Curve25519 clamping (RFC 7748)
        private[0] &= 248;
        private[31] &= 127;
        private[31] |= 64;

        Self::from_private_key(private)
    }

    /// Create a key pair from an existing private key.
    pub fn from_private_key(private: [u8; 32]) -> Self {
        let secret = StaticSecret::from(private);
        let public = PublicKey::from(&secret);

        Self {
            public: *public.as_bytes(),
            private,
        }
    }

    /// Get the private key as bytes.
    pub fn private_key(&self) -> &[u8; 32] {
        &self.private
    }

    /// Perform X25519 Diffie-Hellman key agreement.
    ///
    /// Fails with `DegeneratedKey` when the peer key is a low-order point and
    /// the shared secret carries no contribution from our side.
    pub fn dh(&self, their_public: &[u8; 32]) -> Result<[u8; 32]> {
        let secret = StaticSecret::from(self.private);
        let their_key = PublicKey::from(*their_public);
        let shared = secret.diffie_hellman(&their_key);
        if !shared.was_contributory() {
            return Err(CryptoboxError::DegeneratedKey);
        }
        Ok(*shared.as_bytes())
    }
}

impl PartialEq for KeyPair {
    fn eq(&self, other: &Self) -> bool {
        self.public == other.public
    }
}

impl Eq for KeyPair {}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &hex::encode(self.public))
            .field("private", &"[REDACTED]")
            .finish()
    }
}

// Persisted as the private half only; the public half is recomputed.
impl Serialize for KeyPair {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        key32::serialize(&self.private, serializer)
    }
}

impl<'de> Deserialize<'de> for KeyPair {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        key32::deserialize(deserializer).map(KeyPair::from_private_key)
    }
}

/// Public half of a long-term identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityKey {
    /// Ed25519 verifying key
    #[serde(with = "key32")]
    pub signing: [u8; 32],
    /// Curve25519 key used in the initial key agreement
    #[serde(with = "key32")]
    pub dh: [u8; 32],
}

impl IdentityKey {
    /// Verify an Ed25519 signature made by this identity.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<()> {
        let key = VerifyingKey::from_bytes(&self.signing)
            .map_err(|_| CryptoboxError::InvalidSignature)?;
        let signature: [u8; 64] = signature
            .try_into()
            .map_err(|_| CryptoboxError::InvalidSignature)?;
        key.verify(message, &Signature::from_bytes(&signature))
            .map_err(|_| CryptoboxError::InvalidSignature)
    }

    /// Hex-encoded fingerprint of the signing key.
    pub fn fingerprint(&self) -> String {
        hex::encode(self.signing)
    }
}

/// A complete long-term identity.
#[derive(Clone)]
pub struct IdentityKeyPair {
    signing: [u8; 32],
    dh: KeyPair,
}

impl IdentityKeyPair {
    /// Generate a fresh identity.
    pub fn generate() -> Self {
        let mut signing = [0u8; 32];
        OsRng.fill_bytes(&mut signing);
        Self {
            signing,
            dh: KeyPair::generate(),
        }
    }

    /// Rebuild an identity from its secret halves.
    pub fn from_secrets(signing: [u8; 32], dh: [u8; 32]) -> Self {
        Self {
            signing,
            dh: KeyPair::from_private_key(dh),
        }
    }

    /// The Ed25519 secret key.
    pub fn signing_secret(&self) -> &[u8; 32] {
        &self.signing
    }

    /// The Curve25519 key pair.
    pub fn dh(&self) -> &KeyPair {
        &self.dh
    }

    /// Public half of this identity.
    pub fn public(&self) -> IdentityKey {
        IdentityKey {
            signing: SigningKey::from_bytes(&self.signing).verifying_key().to_bytes(),
            dh: self.dh.public,
        }
    }

    /// Sign a message with the Ed25519 identity key.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        SigningKey::from_bytes(&self.signing).sign(message).to_bytes()
    }
}

impl std::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("public", &self.public())
            .field("private", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_pair_generation() {
        let kp = KeyPair::generate();
        assert_ne!(kp.public, [0u8; 32]);
        assert_ne!(*kp.private_key(), [0u8; 32]);
    }

    #[test]
    fn test_dh_agreement() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();

        let alice_shared = alice.dh(&bob.public).unwrap();
        let bob_shared = bob.dh(&alice.public).unwrap();

        assert_eq!(alice_shared, bob_shared);
    }

    #[test]
    fn test_dh_rejects_low_order_point() {
        let alice = KeyPair::generate();
        let err = alice.dh(&[0u8; 32]).unwrap_err();
        assert!(matches!(err, CryptoboxError::DegeneratedKey));
    }

    #[test]
    fn test_identity_signature() {
        let identity = IdentityKeyPair::generate();
        let public = identity.public();
        let signature = identity.sign(b"prekey");

        public.verify(b"prekey", &signature).unwrap();
        assert!(matches!(
            public.verify(b"other", &signature),
            Err(CryptoboxError::InvalidSignature)
        ));
        assert!(matches!(
            public.verify(b"prekey", &signature[..10]),
            Err(CryptoboxError::InvalidSignature)
        ));
    }

    #[test]
    fn test_identity_roundtrips_through_secrets() {
        let identity = IdentityKeyPair::generate();
        let restored =
            IdentityKeyPair::from_secrets(*identity.signing_secret(), *identity.dh().private_key());
        assert_eq!(identity.public(), restored.public());
        assert_eq!(identity.public().fingerprint().len(), 64);
    }

    #[test]
    fn test_debug_redacts_private_key() {
        let kp = KeyPair::generate();
        let rendered = format!("{kp:?}");
        assert!(rendered.contains("REDACTED"));
        assert!(!rendered.contains(&hex::encode(kp.private_key())));
    }
}
