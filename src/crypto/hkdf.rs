//! HKDF (HMAC-based Key Derivation Function).
//!
//! Used for root key, chain key and message key derivation.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// HKDF-SHA256 key derivation.
pub struct Hkdf {
    prk: [u8; 32],
}

impl Hkdf {
    /// Create a new HKDF instance with the given input key material and salt.
    pub fn new(salt: Option<&[u8]>, ikm: &[u8]) -> Self {
        // HKDF-Extract
        let salt = salt.unwrap_or(&[0u8; 32]);
        let mut mac = HmacSha256::new_from_slice(salt).expect("HMAC can take key of any size");
        mac.update(ikm);
        let prk: [u8; 32] = mac.finalize().into_bytes().into();

        Self { prk }
    }

    /// Expand the key to the desired length with optional info.
    pub fn expand(&self, info: &[u8], length: usize) -> Vec<u8> {
        let mut output = Vec::with_capacity(length);
        let mut t = Vec::new();
        let mut counter = 1u8;

        while output.len() < length {
            let mut mac =
                HmacSha256::new_from_slice(&self.prk).expect("HMAC can take key of any size");
            mac.update(&t);
            mac.update(info);
            mac.update(&[counter]);
            t = mac.finalize().into_bytes().to_vec();

            let remaining = length - output.len();
            let to_copy = remaining.min(t.len());
            output.extend_from_slice(&t[..to_copy]);

            counter += 1;
        }

        output.truncate(length);
        output
    }

    /// Convenience function to extract and expand in one call.
    pub fn derive(salt: Option<&[u8]>, ikm: &[u8], info: &[u8], length: usize) -> Vec<u8> {
        let hkdf = Self::new(salt, ikm);
        hkdf.expand(info, length)
    }
}

/// Derive two independent 32-byte keys from one input.
pub fn derive_key_pair(salt: Option<&[u8]>, ikm: &[u8], info: &[u8]) -> ([u8; 32], [u8; 32]) {
    let derived = Hkdf::derive(salt, ikm, info, 64);
    let mut key1 = [0u8; 32];
    let mut key2 = [0u8; 32];
    key1.copy_from_slice(&derived[0..32]);
    key2.copy_from_slice(&derived[32..64]);
    (key1, key2)
}

/// One HMAC-SHA256 step, keyed by `key` over a single constant byte.
pub fn hmac_step(key: &[u8; 32], constant: u8) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(&[constant]);
    mac.finalize().into_bytes().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hkdf_rfc5869_case_1() {
        let ikm = [0x0b; 22];
        let salt: Vec<u8> = (0x00..=0x0c).collect();
        let info: Vec<u8> = (0xf0..=0xf9).collect();

        let output = Hkdf::derive(Some(&salt), &ikm, &info, 42);
        assert_eq!(
            hex::encode(output),
            "3cb25f25faacd57a90434f64d0362f2a2d2d0a90cf1a5a4c5db02d56ecc4c5bf34007208d5b887185865"
        );
    }

    #[test]
    fn test_hkdf_no_salt() {
        let ikm = b"input key material";
        let output = Hkdf::derive(None, ikm, b"info", 32);
        assert_eq!(output.len(), 32);
    }

    #[test]
    fn test_derive_key_pair() {
        let (key1, key2) = derive_key_pair(Some(&[0xcd; 32]), &[0xab; 32], b"root");

        assert_ne!(key1, [0u8; 32]);
        assert_ne!(key2, [0u8; 32]);
        assert_ne!(key1, key2);
    }

    #[test]
    fn test_hmac_step_separates_constants() {
        let key = [7u8; 32];
        assert_ne!(hmac_step(&key, 0x01), hmac_step(&key, 0x02));
        assert_eq!(hmac_step(&key, 0x01), hmac_step(&key, 0x01));
    }
}
