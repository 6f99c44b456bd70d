//! Prekey records and public prekey bundles.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::encoding::{bytes, key32};
use crate::crypto::{IdentityKey, IdentityKeyPair, KeyPair};
use crate::error::{CryptoboxError, Result};

/// Id of the last-resort prekey, which is never removed.
pub const LAST_PREKEY_ID: u16 = 0xFFFF;

/// Exclusive upper bound of ids handed out for one-time prekeys.
pub const MAX_PREKEY_ID: u16 = LAST_PREKEY_ID;

const BUNDLE_VERSION: u8 = 1;

/// Private prekey material as kept in the prekey store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct PreKeyRecord {
    pub id: u16,
    pub key_pair: KeyPair,
    pub created_at: DateTime<Utc>,
}

impl PreKeyRecord {
    pub fn generate(id: u16) -> Self {
        Self {
            id,
            key_pair: KeyPair::generate(),
            created_at: Utc::now(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(CryptoboxError::encode)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// The signed public bundle a peer needs to start a session.
    pub fn bundle(&self, identity: &IdentityKeyPair) -> PreKeyBundle {
        PreKeyBundle {
            version: BUNDLE_VERSION,
            prekey_id: self.id,
            public_key: self.key_pair.public,
            identity: identity.public(),
            signature: identity.sign(&self.key_pair.public).to_vec(),
        }
    }
}

/// Public prekey material published for peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyBundle {
    pub version: u8,
    pub prekey_id: u16,
    #[serde(with = "key32")]
    pub public_key: [u8; 32],
    pub identity: IdentityKey,
    #[serde(with = "bytes")]
    pub signature: Vec<u8>,
}

impl PreKeyBundle {
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(CryptoboxError::encode)
    }

    /// Decode a bundle, rejecting unknown versions.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let bundle: PreKeyBundle = serde_json::from_slice(data)?;
        if bundle.version != BUNDLE_VERSION {
            return Err(CryptoboxError::Decode(format!(
                "unsupported prekey version {}",
                bundle.version
            )));
        }
        Ok(bundle)
    }

    /// Check that the prekey was signed by the identity it claims.
    pub fn verify(&self) -> Result<()> {
        self.identity.verify(&self.public_key, &self.signature)
    }

    pub fn is_last_resort(&self) -> bool {
        self.prekey_id == LAST_PREKEY_ID
    }
}
