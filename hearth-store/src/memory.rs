//! In-process backend.
//!
//! Data lives as long as the `MemoryBackend` (or any clone of it), not as long
//! as a connection, so reopening sees earlier writes. Opens can be paused and
//! failed on demand, which is what the store tests rely on.

use crate::backend::{validate_partition, BackendConnection, Connection, StorageBackend};
use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Semaphore;

#[derive(Default)]
struct MemoryState {
    partitions: HashMap<String, Vec<(String, Value)>>,
    opens: Vec<(Vec<String>, u64)>,
    fail_next_open: Option<String>,
    fail_next_entries: Option<String>,
}

/// Backend keeping every partition in memory.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
    gate: Option<Arc<Semaphore>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend whose opens wait until [`MemoryBackend::resume`].
    pub fn paused() -> Self {
        Self {
            state: Arc::default(),
            gate: Some(Arc::new(Semaphore::new(0))),
        }
    }

    /// Lets pending and future opens complete.
    pub fn resume(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(1);
        }
    }

    /// Makes the next open fail with `message`.
    pub fn fail_next_open(&self, message: impl Into<String>) {
        self.lock().fail_next_open = Some(message.into());
    }

    /// Makes the next full partition read fail with `message`.
    pub fn fail_next_entries(&self, message: impl Into<String>) {
        self.lock().fail_next_entries = Some(message.into());
    }

    /// Number of opens issued so far, failed ones included.
    pub fn open_count(&self) -> usize {
        self.lock().opens.len()
    }

    /// Partition batches and versions of every open, oldest first.
    pub fn open_log(&self) -> Vec<(Vec<String>, u64)> {
        self.lock().opens.clone()
    }

    /// Writes a value directly, bypassing any connection.
    pub fn seed(&self, partition: &str, key: &str, value: Value) {
        let mut state = self.lock();
        let rows = state.partitions.entry(partition.to_string()).or_default();
        upsert(rows, key, value);
    }

    /// Reads a value directly, bypassing any connection.
    pub fn value(&self, partition: &str, key: &str) -> Option<Value> {
        self.lock()
            .partitions
            .get(partition)
            .and_then(|rows| rows.iter().find(|(k, _)| k == key))
            .map(|(_, v)| v.clone())
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn upsert(rows: &mut Vec<(String, Value)>, key: &str, value: Value) {
    match rows.iter_mut().find(|(k, _)| k == key) {
        Some(row) => row.1 = value,
        None => rows.push((key.to_string(), value)),
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn open(&self, partitions: Vec<String>, version: u64) -> StoreResult<Connection> {
        for name in &partitions {
            validate_partition(name)?;
        }

        if let Some(gate) = &self.gate {
            let _permit = gate
                .acquire()
                .await
                .map_err(|_| StoreError::Connection("backend shut down".into()))?;
        }

        let mut state = self.lock();
        state.opens.push((partitions.clone(), version));
        if let Some(message) = state.fail_next_open.take() {
            return Err(StoreError::Connection(message));
        }
        for name in partitions {
            state.partitions.entry(name).or_default();
        }
        drop(state);

        Ok(Arc::new(MemoryConnection {
            state: Arc::clone(&self.state),
        }))
    }
}

struct MemoryConnection {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryConnection {
    fn with_partition<R>(
        &self,
        partition: &str,
        f: impl FnOnce(&mut Vec<(String, Value)>) -> R,
    ) -> StoreResult<R> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .partitions
            .get_mut(partition)
            .map(f)
            .ok_or_else(|| StoreError::UnknownPartition(partition.to_string()))
    }
}

#[async_trait]
impl BackendConnection for MemoryConnection {
    async fn get(&self, partition: &str, key: &str) -> StoreResult<Option<Value>> {
        self.with_partition(partition, |rows| {
            rows.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone())
        })
    }

    async fn put(&self, partition: &str, key: &str, value: Value) -> StoreResult<()> {
        self.with_partition(partition, |rows| upsert(rows, key, value))
    }

    async fn delete(&self, partition: &str, key: &str) -> StoreResult<()> {
        self.with_partition(partition, |rows| rows.retain(|(k, _)| k != key))
    }

    async fn entries(&self, partition: &str) -> StoreResult<Vec<(String, Value)>> {
        let failure = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .fail_next_entries
            .take();
        if let Some(message) = failure {
            return Err(StoreError::Connection(message));
        }
        self.with_partition(partition, |rows| rows.clone())
    }
}
