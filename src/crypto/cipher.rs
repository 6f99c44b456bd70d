//! AES-GCM cipher for message payloads.
//!
//! Each ratchet message key is used exactly once. The AEAD key and nonce are
//! both expanded from it, so nonces never repeat under one key.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use thiserror::Error;

use crate::crypto::Hkdf;

const MESSAGE_KEY_INFO: &[u8] = b"cryptobox message keys";

/// AES-256-GCM cipher bound to one message key.
pub struct Cipher {
    key: [u8; 32],
    nonce: [u8; 12],
}

impl Cipher {
    /// Create a cipher with an explicit key and nonce.
    pub fn new(key: [u8; 32], nonce: [u8; 12]) -> Self {
        Self { key, nonce }
    }

    /// Expand a ratchet message key into an AEAD key and nonce.
    pub fn for_message_key(message_key: &[u8; 32]) -> Self {
        let okm = Hkdf::derive(None, message_key, MESSAGE_KEY_INFO, 44);
        let mut key = [0u8; 32];
        let mut nonce = [0u8; 12];
        key.copy_from_slice(&okm[..32]);
        nonce.copy_from_slice(&okm[32..44]);
        Self::new(key, nonce)
    }

    /// Encrypt data, authenticating `ad` alongside it.
    pub fn encrypt(&self, plaintext: &[u8], ad: &[u8]) -> Result<Vec<u8>, CipherError> {
        let cipher = Aes256Gcm::new_from_slice(&self.key).map_err(|_| CipherError::InvalidKey)?;

        cipher
            .encrypt(Nonce::from_slice(&self.nonce), Payload { msg: plaintext, aad: ad })
            .map_err(|_| CipherError::EncryptionFailed)
    }

    /// Decrypt data, verifying `ad` alongside it.
    pub fn decrypt(&self, ciphertext: &[u8], ad: &[u8]) -> Result<Vec<u8>, CipherError> {
        let cipher = Aes256Gcm::new_from_slice(&self.key).map_err(|_| CipherError::InvalidKey)?;

        cipher
            .decrypt(Nonce::from_slice(&self.nonce), Payload { msg: ciphertext, aad: ad })
            .map_err(|_| CipherError::DecryptionFailed)
    }
}

/// Cipher errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CipherError {
    #[error("invalid key")]
    InvalidKey,
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("decryption failed")]
    DecryptionFailed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt() {
        let cipher = Cipher::for_message_key(&[0xab; 32]);

        let plaintext = b"Hello, peer!";
        let ad = b"additional data";

        let ciphertext = cipher.encrypt(plaintext, ad).unwrap();
        let decrypted = cipher.decrypt(&ciphertext, ad).unwrap();

        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_decrypt_wrong_ad_fails() {
        let cipher = Cipher::for_message_key(&[0xab; 32]);

        let ciphertext = cipher.encrypt(b"Hello, peer!", b"correct ad").unwrap();
        let result = cipher.decrypt(&ciphertext, b"wrong ad");

        assert_eq!(result, Err(CipherError::DecryptionFailed));
    }

    #[test]
    fn test_distinct_message_keys_give_distinct_ciphertexts() {
        let a = Cipher::for_message_key(&[1; 32]).encrypt(b"same", b"").unwrap();
        let b = Cipher::for_message_key(&[2; 32]).encrypt(b"same", b"").unwrap();
        assert_ne!(a, b);
    }
}
