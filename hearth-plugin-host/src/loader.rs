//! Turning a plugin code document into a running [`Plugin`].

use crate::api::PluginApi;
use crate::plugin::Plugin;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// Evaluates plugin code against its capability-bound API.
///
/// The loader receives the API and nothing else from the host; whatever the
/// plugin registers through it is recorded for revocation.
pub trait PluginLoader: Send + Sync {
    fn load(&self, plugin_id: &str, code: &str, api: PluginApi) -> anyhow::Result<Box<dyn Plugin>>;
}

type Factory = Arc<dyn Fn(PluginApi) -> anyhow::Result<Box<dyn Plugin>> + Send + Sync>;

/// Loader for plugins compiled into the host application.
///
/// The code document names an entry point; each entry is registered with a
/// factory up front.
#[derive(Clone, Default)]
pub struct NativeLoader {
    factories: Arc<RwLock<HashMap<String, Factory>>>,
}

impl NativeLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `factory` under `entry`, replacing any earlier one.
    pub fn register<F>(&self, entry: impl Into<String>, factory: F)
    where
        F: Fn(PluginApi) -> anyhow::Result<Box<dyn Plugin>> + Send + Sync + 'static,
    {
        let entry = entry.into();
        debug!(entry = %entry, "Registered native plugin entry");
        self.factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entry, Arc::new(factory));
    }

    /// Registered entry names, sorted.
    pub fn entries(&self) -> Vec<String> {
        let mut entries: Vec<String> = self
            .factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        entries.sort();
        entries
    }
}

impl PluginLoader for NativeLoader {
    fn load(&self, plugin_id: &str, code: &str, api: PluginApi) -> anyhow::Result<Box<dyn Plugin>> {
        let entry = code.trim();
        let factory = self
            .factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(entry)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no native entry '{entry}' for plugin '{plugin_id}'"))?;
        // Lock released before running plugin code.
        factory(api)
    }
}
