//! Error types for the plugin host.

use crate::ledger::RevocationError;
use hearth_store::StoreError;
use std::any::Any;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PluginHostError {
    #[error("plugin not found: {0}")]
    PluginNotFound(String),

    #[error("plugin already running: {0}")]
    PluginAlreadyRunning(String),

    #[error("plugin not running: {0}")]
    PluginNotRunning(String),

    #[error("plugin id invalid or taken: {0}")]
    InvalidPluginId(String),

    #[error("plugin storage is not connected, cannot start plugin '{0}'")]
    StorageNotConnected(String),

    #[error("plugin '{0}' has no settings")]
    NoSettings(String),

    #[error("plugin crashed: {plugin_id}: {message}")]
    PluginCrashed {
        plugin_id: String,
        message: String,
    },

    #[error("revoking capabilities of plugin '{plugin_id}' failed: {source}")]
    RevocationFailed {
        plugin_id: String,
        #[source]
        source: RevocationError,
    },

    #[error("capability '{capability}' could not be granted: {message}")]
    Capability {
        capability: &'static str,
        message: String,
    },

    #[error("failed to update plugin {plugin_id}: {message}")]
    UpdateFailed {
        plugin_id: String,
        message: String,
    },

    #[error("network error: {0}")]
    NetworkError(String),

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}
