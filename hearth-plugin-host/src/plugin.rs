//! The contract every plugin implements.

use serde_json::Value;
use std::sync::Arc;

/// A settings panel a plugin exposes to the host.
pub trait SettingsPanel: Send + Sync {
    /// Renders the panel as a host-defined document.
    fn render(&self) -> Value;
}

/// A loaded plugin instance.
///
/// Everything a plugin may touch outside itself goes through the
/// [`PluginApi`](crate::PluginApi) handed to its loader; the host undoes all of
/// it on stop whether or not `on_unload` cleans up.
pub trait Plugin: Send {
    fn on_load(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_unload(&mut self) -> anyhow::Result<()>;

    fn settings(&self) -> Option<Arc<dyn SettingsPanel>> {
        None
    }
}
