//! Message envelopes.
//!
//! A `CipherMessage` carries one ratchet step. Until the initiator hears back
//! from its peer, every outgoing message is wrapped in a `PreKeyMessage` so
//! the responder can derive the session from it.

use serde::{Deserialize, Serialize};

use crate::crypto::encoding::{bytes, key32};
use crate::crypto::IdentityKey;
use crate::error::{CryptoboxError, Result};

const ENVELOPE_VERSION: u8 = 1;

/// One encrypted ratchet message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CipherMessage {
    #[serde(with = "key32")]
    pub ratchet_key: [u8; 32],
    pub counter: u32,
    #[serde(with = "bytes")]
    pub ciphertext: Vec<u8>,
}

impl CipherMessage {
    /// Header bytes authenticated with the payload.
    pub(crate) fn associated_data(ratchet_key: &[u8; 32], counter: u32) -> Vec<u8> {
        let mut ad = Vec::with_capacity(1 + 32 + 4);
        ad.push(ENVELOPE_VERSION);
        ad.extend_from_slice(ratchet_key);
        ad.extend_from_slice(&counter.to_be_bytes());
        ad
    }
}

/// A cipher message plus what the responder needs to build the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyMessage {
    pub prekey_id: u16,
    #[serde(with = "key32")]
    pub base_key: [u8; 32],
    pub identity: IdentityKey,
    pub message: CipherMessage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    PreKey(PreKeyMessage),
    Cipher(CipherMessage),
}

/// Versioned wire envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u8,
    pub message: Message,
}

impl Envelope {
    pub fn new(message: Message) -> Self {
        Self {
            version: ENVELOPE_VERSION,
            message,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(CryptoboxError::encode)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let envelope: Envelope = serde_json::from_slice(data)?;
        if envelope.version != ENVELOPE_VERSION {
            return Err(CryptoboxError::Decode(format!(
                "unsupported envelope version {}",
                envelope.version
            )));
        }
        Ok(envelope)
    }

    /// The ratchet message inside this envelope.
    pub fn cipher_message(&self) -> &CipherMessage {
        match &self.message {
            Message::PreKey(m) => &m.message,
            Message::Cipher(m) => m,
        }
    }

    pub fn is_prekey_message(&self) -> bool {
        matches!(self.message, Message::PreKey(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::IdentityKeyPair;

    fn cipher_message(counter: u32) -> CipherMessage {
        CipherMessage {
            ratchet_key: [9; 32],
            counter,
            ciphertext: vec![1, 2, 3],
        }
    }

    #[test]
    fn test_prekey_envelope_exposes_inner_message() {
        let envelope = Envelope::new(Message::PreKey(PreKeyMessage {
            prekey_id: 3,
            base_key: [5; 32],
            identity: IdentityKeyPair::generate().public(),
            message: cipher_message(2),
        }));

        let decoded = Envelope::decode(&envelope.encode().unwrap()).unwrap();
        assert!(decoded.is_prekey_message());
        assert_eq!(decoded.cipher_message().counter, 2);
    }

    #[test]
    fn test_unknown_version_is_rejected() {
        let mut envelope = Envelope::new(Message::Cipher(cipher_message(0)));
        envelope.version = 9;
        let bytes = serde_json::to_vec(&envelope).unwrap();

        assert!(matches!(Envelope::decode(&bytes), Err(CryptoboxError::Decode(_))));
    }

    #[test]
    fn test_associated_data_binds_counter() {
        assert_ne!(
            CipherMessage::associated_data(&[1; 32], 0),
            CipherMessage::associated_data(&[1; 32], 1)
        );
    }
}
