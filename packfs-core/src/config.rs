//! Repository configuration stored at `<root>/config.json`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::{Result, StoreError};

fn default_pack_max_objects() -> usize {
    2048
}

fn default_pack_max_size() -> u64 {
    64 * 1024 * 1024
}

fn default_compression() -> bool {
    true
}

fn default_zip_minimum_size() -> usize {
    512
}

fn default_open_pack_cache() -> usize {
    32
}

/// Tunables for a repository, persisted alongside its data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoConfig {
    /// A packfile is full at this many objects.
    #[serde(default = "default_pack_max_objects")]
    pub pack_max_objects: usize,
    /// A packfile is full at this many bytes.
    #[serde(default = "default_pack_max_size")]
    pub pack_max_size: u64,
    /// Whether payloads are considered for compression at all.
    #[serde(default = "default_compression")]
    pub compression: bool,
    /// Payloads below this size are never compressed.
    #[serde(default = "default_zip_minimum_size")]
    pub zip_minimum_size: usize,
    /// Bound on simultaneously open packfile handles.
    #[serde(default = "default_open_pack_cache")]
    pub open_pack_cache: usize,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            pack_max_objects: default_pack_max_objects(),
            pack_max_size: default_pack_max_size(),
            compression: default_compression(),
            zip_minimum_size: default_zip_minimum_size(),
            open_pack_cache: default_open_pack_cache(),
        }
    }
}

impl RepoConfig {
    /// Load the config from a repository root; absent file means defaults.
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join("config.json");
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(&path)?;
        serde_json::from_str(&data)
            .map_err(|e| StoreError::Serialization(format!("config.json: {}", e)))
    }

    /// Save the config to a repository root.
    pub fn save(&self, root: &Path) -> Result<()> {
        let data = serde_json::to_string_pretty(self)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        fs::write(root.join("config.json"), data)?;
        Ok(())
    }
}
