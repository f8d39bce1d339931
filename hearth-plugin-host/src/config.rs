//! Host configuration, read from `~/.hearth/host.toml`.

use crate::error::PluginHostError;
use hearth_store::{MemoryBackend, SqliteBackend, StorageBackend};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Where plugin records and data are stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file.
    pub path: PathBuf,
    /// Keep everything in memory; nothing survives a restart.
    pub in_memory: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: dirs_path().join("plugins.db"),
            in_memory: false,
        }
    }
}

/// Remote plugin fetching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            user_agent: format!("Hearth/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginsConfig {
    /// Id reserved for the plugin under development. Never updated remotely
    /// and never auto-started.
    pub dev_mode_id: String,
    /// Check update sources during `start_all`.
    pub auto_update: bool,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            dev_mode_id: "dev-mode".to_string(),
            auto_update: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub storage: StorageConfig,
    pub fetch: FetchConfig,
    pub plugins: PluginsConfig,
}

impl HostConfig {
    /// Loads `~/.hearth/host.toml` if it exists.
    pub fn load() -> Self {
        Self::load_from(dirs_path().join("host.toml"))
    }

    /// Loads from an explicit path. A missing, unreadable or malformed file
    /// yields the defaults.
    pub fn load_from(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            info!("No host config at {:?}, using defaults", path);
            return Self::default();
        }

        match std::fs::read_to_string(path) {
            Ok(contents) => match Self::from_toml_str(&contents) {
                Ok(config) => {
                    info!("Loaded host config from {:?}", path);
                    config
                }
                Err(e) => {
                    warn!("{e}. Falling back to defaults for {:?}", path);
                    Self::default()
                }
            },
            Err(e) => {
                warn!("Failed to read host config {:?}: {}", path, e);
                Self::default()
            }
        }
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, PluginHostError> {
        toml::from_str(contents)
            .map_err(|e| PluginHostError::Config(format!("failed to parse host config: {e}")))
    }

    /// Builds the configured storage backend.
    pub fn open_backend(&self) -> Arc<dyn StorageBackend> {
        if self.storage.in_memory {
            Arc::new(MemoryBackend::new())
        } else {
            Arc::new(SqliteBackend::new(&self.storage.path))
        }
    }
}

fn dirs_path() -> PathBuf {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(".hearth")
}
