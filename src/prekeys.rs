//! Prekey generation.

use std::ops::Range;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use log::info;

use crate::engine::prekey::{LAST_PREKEY_ID, MAX_PREKEY_ID};
use crate::engine::{is_prekey, Engine};
use crate::error::{CryptoboxError, Result};

/// A public prekey bundle ready to be published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreKey {
    id: u16,
    data: Vec<u8>,
}

impl PreKey {
    /// Wrap a serialised bundle, reading its id.
    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        let id = is_prekey(&data)?;
        Ok(Self { id, data })
    }

    pub fn from_base64(text: &str) -> Result<Self> {
        Self::from_bytes(STANDARD.decode(text.trim())?)
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.data)
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn is_last_resort(&self) -> bool {
        self.id == LAST_PREKEY_ID
    }
}

/// Hands out one-time prekeys and the last-resort prekey.
#[derive(Debug, Default)]
pub(crate) struct PreKeys {
    last_resort: Option<PreKey>,
}

impl PreKeys {
    /// Generate one prekey per id in `range`, which must lie within
    /// `[0, MAX_PREKEY_ID)`. The range is checked before any key is made.
    pub fn generate(&self, engine: &Engine, range: Range<u32>) -> Result<Vec<PreKey>> {
        if range.start > range.end || range.end > u32::from(MAX_PREKEY_ID) {
            return Err(CryptoboxError::InvalidArgument(format!(
                "prekey range {}..{} outside 0..{MAX_PREKEY_ID}",
                range.start, range.end
            )));
        }

        let prekeys = range
            .map(|id| -> Result<PreKey> {
                // Bounded by MAX_PREKEY_ID above.
                let id = id as u16;
                Ok(PreKey {
                    id,
                    data: engine.new_prekey(id)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        if let (Some(first), Some(last)) = (prekeys.first(), prekeys.last()) {
            info!("generated prekeys {}..={}", first.id, last.id);
        }
        Ok(prekeys)
    }

    /// The last-resort prekey, created on first use and reused afterwards.
    pub fn last_resort(&mut self, engine: &Engine) -> Result<PreKey> {
        if let Some(prekey) = &self.last_resort {
            return Ok(prekey.clone());
        }

        let data = match engine.prekey_bundle(LAST_PREKEY_ID)? {
            Some(data) => data,
            None => {
                info!("generating last-resort prekey");
                engine.new_prekey(LAST_PREKEY_ID)?
            }
        };
        let prekey = PreKey {
            id: LAST_PREKEY_ID,
            data,
        };
        self.last_resort = Some(prekey.clone());
        Ok(prekey)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::engine::ratchet::RatchetLimits;
    use crate::store::MemoryStore;

    fn engine() -> Engine {
        Engine::open(Arc::new(MemoryStore::new()), RatchetLimits::default()).unwrap()
    }

    #[test]
    fn test_range_yields_sequential_ids() {
        let engine = engine();
        let prekeys = PreKeys::default().generate(&engine, 0..10).unwrap();

        let ids: Vec<u16> = prekeys.iter().map(PreKey::id).collect();
        assert_eq!(ids, (0..10).collect::<Vec<u16>>());
        assert!(prekeys.iter().all(|p| !p.is_last_resort()));
    }

    #[test]
    fn test_range_may_not_reach_last_resort_id() {
        let engine = engine();
        let pool = PreKeys::default();

        let err = pool.generate(&engine, 0xFFF0..0x10000).unwrap_err();
        assert!(matches!(err, CryptoboxError::InvalidArgument(_)));
        assert!(engine.prekey_bundle(0xFFF0).unwrap().is_none());

        let top = pool.generate(&engine, 0xFFFE..0xFFFF).unwrap();
        assert_eq!(top[0].id(), 0xFFFE);
    }

    #[test]
    fn test_empty_range_is_empty() {
        assert!(PreKeys::default().generate(&engine(), 5..5).unwrap().is_empty());
    }

    #[test]
    fn test_last_resort_is_stable() {
        let engine = engine();
        let first = PreKeys::default().last_resort(&engine).unwrap();
        // A fresh pool reads the stored key back instead of generating one.
        let second = PreKeys::default().last_resort(&engine).unwrap();

        assert!(first.is_last_resort());
        assert_eq!(first, second);
    }

    #[test]
    fn test_base64_round_trip() {
        let engine = engine();
        let prekey = PreKeys::default().generate(&engine, 3..4).unwrap().remove(0);
        let parsed = PreKey::from_base64(&prekey.to_base64()).unwrap();
        assert_eq!(parsed, prekey);

        assert!(matches!(
            PreKey::from_base64("%%%"),
            Err(CryptoboxError::Decode(_))
        ));
    }
}
