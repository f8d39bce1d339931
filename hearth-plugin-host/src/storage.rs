//! Per-plugin key/value storage.
//!
//! Each plugin gets one JSON object kept under its id in the `plugins-data`
//! partition. Mutations edit the in-memory object and schedule a single
//! write-through of the whole object.

use crate::error::PluginHostError;
use hearth_store::ReactiveStore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::warn;

/// Partition holding every plugin's data object.
pub const DATA_PARTITION: &str = "plugins-data";

pub type DataObject = Map<String, Value>;

struct Inner {
    plugin_id: String,
    data: Mutex<DataObject>,
    backing: ReactiveStore<DataObject>,
    flush_pending: AtomicBool,
}

/// Storage handle given to a plugin. Clones share the same data.
#[derive(Clone)]
pub struct PluginStore {
    inner: Arc<Inner>,
}

impl PluginStore {
    /// Loads the data object of `plugin_id`. The backing partition must
    /// already be connected, otherwise the object would start out empty and
    /// the first write would clobber what is on disk.
    pub fn open(
        plugin_id: &str,
        backing: &ReactiveStore<DataObject>,
    ) -> Result<Self, PluginHostError> {
        if !backing.is_connected() {
            return Err(PluginHostError::StorageNotConnected(plugin_id.to_string()));
        }
        let data = backing.get(plugin_id).unwrap_or_default();
        Ok(Self {
            inner: Arc::new(Inner {
                plugin_id: plugin_id.to_string(),
                data: Mutex::new(data),
                backing: backing.clone(),
                flush_pending: AtomicBool::new(false),
            }),
        })
    }

    pub fn plugin_id(&self) -> &str {
        &self.inner.plugin_id
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.lock().get(key).cloned()
    }

    /// Reads `key` as `T`; `None` when absent or of a different shape.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get(key)?;
        match serde_json::from_value(value) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(plugin_id = %self.inner.plugin_id, key, error = %e, "Stored plugin value has unexpected shape");
                None
            }
        }
    }

    pub fn set(&self, key: impl Into<String>, value: impl Serialize) -> Result<(), PluginHostError> {
        let value = serde_json::to_value(value)?;
        self.lock().insert(key.into(), value);
        self.schedule_flush();
        Ok(())
    }

    pub fn delete(&self, key: &str) -> Option<Value> {
        let removed = self.lock().remove(key);
        if removed.is_some() {
            self.schedule_flush();
        }
        removed
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    /// Writes the whole object to the backing store now.
    pub fn flush(&self) {
        self.inner.flush_pending.store(false, Ordering::SeqCst);
        let snapshot = self.lock().clone();
        self.inner.backing.set(self.inner.plugin_id.clone(), snapshot);
    }

    /// Flushes and waits until the write is durable.
    pub async fn persist(&self) -> Result<(), PluginHostError> {
        self.flush();
        self.inner.backing.flush().await?;
        Ok(())
    }

    fn schedule_flush(&self) {
        if self.inner.flush_pending.swap(true, Ordering::SeqCst) {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let store = self.clone();
                handle.spawn(async move {
                    // Only the first of a burst of writes gets here.
                    if store.inner.flush_pending.load(Ordering::SeqCst) {
                        store.flush();
                    }
                });
            }
            Err(_) => self.flush(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DataObject> {
        self.inner.data.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
