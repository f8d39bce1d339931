//! Durable table of installed plugins.

use crate::record::PluginRecord;
use hearth_store::{ConnectionBroker, ReactiveStore, StoreResult};

/// Partition holding one [`PluginRecord`] per plugin id.
pub const RECORDS_PARTITION: &str = "plugins-internal";

/// Plugin records keyed by id, persisted through a [`ReactiveStore`].
#[derive(Clone)]
pub struct PluginRegistry {
    records: ReactiveStore<PluginRecord>,
}

impl PluginRegistry {
    pub fn new(broker: &ConnectionBroker) -> Self {
        Self {
            records: ReactiveStore::new(broker, RECORDS_PARTITION),
        }
    }

    /// Installed ids in installation order.
    pub fn list(&self) -> Vec<String> {
        self.records.keys()
    }

    pub fn get(&self, id: &str) -> Option<PluginRecord> {
        self.records.get(id)
    }

    pub fn put(&self, id: &str, record: PluginRecord) {
        self.records.set(id, record);
    }

    pub fn remove(&self, id: &str) {
        self.records.delete(id);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains(id)
    }

    pub fn is_connected(&self) -> bool {
        self.records.is_connected()
    }

    pub async fn connected(&self) -> StoreResult<()> {
        self.records.connected().await
    }

    pub async fn flush(&self) -> StoreResult<()> {
        self.records.flush().await
    }

    /// Applies `f` to the current record of `id` and stores the result.
    /// Returns `false` when there is no record.
    pub(crate) fn modify(&self, id: &str, f: impl FnOnce(&mut PluginRecord)) -> bool {
        match self.records.get(id) {
            Some(mut record) => {
                f(&mut record);
                self.records.set(id, record);
                true
            }
            None => false,
        }
    }
}
