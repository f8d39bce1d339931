//! Batches connection opens across partitions.
//!
//! The backend needs every partition declared in the open that creates it.
//! Partitions requested while a batch is still collecting join that batch and
//! share its open. The batch closes the moment its open starts running.
//! Anything requested afterwards starts a new batch with a higher version.

use crate::backend::{Connection, StorageBackend};
use crate::error::{StoreError, StoreResult};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error};

type SharedOpen = Shared<BoxFuture<'static, Result<Connection, String>>>;

#[derive(Default)]
struct BrokerState {
    /// Partitions of the batch that has not started opening yet.
    batch: Vec<String>,
    /// Open future of that batch.
    collecting: Option<SharedOpen>,
    version: u64,
}

/// Hands out backend connections, one open per batch of partitions.
///
/// Cloning is cheap; clones share the same batching state.
#[derive(Clone)]
pub struct ConnectionBroker {
    backend: Arc<dyn StorageBackend>,
    state: Arc<Mutex<BrokerState>>,
}

impl ConnectionBroker {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            backend,
            state: Arc::default(),
        }
    }

    /// Requests a connection that serves `partition`.
    ///
    /// The partition joins the current batch synchronously, before this
    /// returns. The returned future resolves with the batch's connection, or
    /// with the open error every waiter of the batch receives.
    pub fn open(&self, partition: &str) -> BoxFuture<'static, StoreResult<Connection>> {
        let open = {
            let mut state = self.lock();
            if !state.batch.iter().any(|p| p == partition) {
                state.batch.push(partition.to_string());
            }
            match &state.collecting {
                Some(open) => open.clone(),
                None => {
                    let open = self.batch_open();
                    state.collecting = Some(open.clone());
                    open
                }
            }
        };

        async move { open.await.map_err(StoreError::Connection) }.boxed()
    }

    /// Version of the newest open started so far.
    pub fn version(&self) -> u64 {
        self.lock().version
    }

    fn batch_open(&self) -> SharedOpen {
        let backend = Arc::clone(&self.backend);
        let state = Arc::clone(&self.state);

        async move {
            let (partitions, version) = {
                let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
                state.collecting = None;
                state.version += 1;
                (std::mem::take(&mut state.batch), state.version)
            };

            debug!(?partitions, version, "Opening storage backend");
            backend.open(partitions, version).await.map_err(|e| {
                error!(version, error = %e, "Storage backend open failed");
                match e {
                    StoreError::Connection(message) => message,
                    other => other.to_string(),
                }
            })
        }
        .boxed()
        .shared()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
