//! Store and garbage collection configuration
//!
//! Loaded from TOML:
//! ```toml
//! root = "/var/lib/contentrepo"
//! lock_timeout_ms = 5000
//!
//! [gc]
//! grace_period_secs = 300
//! ignorable_files = [".DS_Store", "Thumbs.db", "desktop.ini"]
//! ```

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Store configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Store root holding the two-level shard tree
    pub root: PathBuf,
    /// How long a reader waits on a location held by a removal (default: 5s)
    pub lock_timeout_ms: u64,
    /// Staging area inside the root; never a valid shard name
    pub tmp_dir_name: String,
    pub gc: GcConfig,
}

impl StoreConfig {
    /// Defaults rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.gc.grace_period_secs = grace.as_secs();
        self
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("content"),
            lock_timeout_ms: 5000,
            tmp_dir_name: "tmp".to_string(),
            gc: GcConfig::default(),
        }
    }
}

/// Garbage collection configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Minimum age of a mark before the marked directory is deleted (default: 5 min)
    pub grace_period_secs: u64,
    /// File names that never count as content (OS metadata)
    pub ignorable_files: Vec<String>,
}

impl GcConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    /// Deny-listed names plus AppleDouble `._*` files
    pub fn is_ignorable(&self, file_name: &str) -> bool {
        file_name.starts_with("._") || self.ignorable_files.iter().any(|name| name == file_name)
    }
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: 300,
            ignorable_files: vec![
                ".DS_Store".to_string(),
                "Thumbs.db".to_string(),
                "desktop.ini".to_string(),
            ],
        }
    }
}
