//! Cryptographic primitives used by the session engine.
//!
//! - Curve25519 key agreement and Ed25519 identity signatures
//! - HKDF-SHA256 key derivation
//! - AES-256-GCM payload encryption

mod cipher;
pub mod encoding;
mod hkdf;
mod keypair;

pub use cipher::{Cipher, CipherError};
pub use hkdf::{derive_key_pair, hmac_step, Hkdf};
pub use keypair::{IdentityKey, IdentityKeyPair, KeyPair};
