use std::{fs, path::Path, path::PathBuf};

use serde::{Deserialize, Serialize};

use crate::engine::ratchet::RatchetLimits;
use crate::error::Result;

/// Configuration used when opening a crypto box.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BoxConfig {
    /// Directory holding the identity, prekeys and sessions.
    pub path: PathBuf,
    /// Largest forward jump in message counters accepted within one chain.
    pub max_counter_gap: u32,
    /// Number of receive chains kept for late messages.
    pub max_recv_chains: usize,
    /// Flush every record to disk before it is renamed into place.
    pub sync_writes: bool,
}

impl Default for BoxConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/cryptobox"),
            max_counter_gap: 1000,
            max_recv_chains: 5,
            sync_writes: true,
        }
    }
}

impl BoxConfig {
    /// Load a configuration from a JSON file. Missing fields take defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let data = fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Override the storage directory.
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = path.into();
        self
    }

    /// Override the accepted counter gap.
    pub fn with_max_counter_gap(mut self, gap: u32) -> Self {
        self.max_counter_gap = gap;
        self
    }

    /// Override the number of retained receive chains.
    pub fn with_max_recv_chains(mut self, chains: usize) -> Self {
        self.max_recv_chains = chains;
        self
    }

    /// Toggle fsync before rename.
    pub fn with_sync_writes(mut self, sync_writes: bool) -> Self {
        self.sync_writes = sync_writes;
        self
    }

    pub(crate) fn limits(&self) -> RatchetLimits {
        RatchetLimits {
            max_counter_gap: self.max_counter_gap,
            max_recv_chains: self.max_recv_chains,
        }
    }
}
