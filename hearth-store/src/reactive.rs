//! Reactive key/value store with synchronous reads over an async backend.
//!
//! Every key maps to a cell backed by a `watch` channel. Reads and writes hit
//! the cell immediately; persistence is queued to a single worker task per
//! store, which applies it in call order once the connection is up.
//!
//! Until the connection resolves, unknown keys read as absent. On connect the
//! worker hydrates every cell that was not written locally in the meantime,
//! so a value a reader has already seen is never replaced by a stale one.

use crate::backend::Connection;
use crate::broker::ConnectionBroker;
use crate::error::{StoreError, StoreResult};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, warn};

/// Bounds every stored value type satisfies.
pub trait StoreValue: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> StoreValue for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// Connection state of a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Pending,
    Connected,
    Failed(String),
}

type Waiter = Box<dyn FnOnce() + Send>;

struct Cell<T> {
    value: watch::Sender<Option<T>>,
    /// Position in iteration order, assigned when the cell gains a value.
    seq: u64,
    /// Written locally; hydration must leave it alone.
    touched: bool,
}

impl<T> Cell<T> {
    fn absent() -> Self {
        Self {
            value: watch::channel(None).0,
            seq: 0,
            touched: false,
        }
    }

    fn is_present(&self) -> bool {
        self.value.borrow().is_some()
    }
}

struct StoreState<T> {
    cells: HashMap<String, Cell<T>>,
    next_seq: u64,
    waiters: Vec<Waiter>,
}

impl<T> StoreState<T> {
    fn bump_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

struct StoreShared<T> {
    partition: String,
    state: Mutex<StoreState<T>>,
    status: watch::Sender<ConnectionStatus>,
}

impl<T: StoreValue> StoreShared<T> {
    fn lock(&self) -> MutexGuard<'_, StoreState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_connected(&self) -> bool {
        *self.status.borrow() == ConnectionStatus::Connected
    }

    fn decode(&self, key: &str, value: Value) -> Option<T> {
        match serde_json::from_value(value) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(partition = %self.partition, key, error = %e, "Skipping undecodable stored value");
                None
            }
        }
    }

    /// Fills `key` from the backend unless it was written locally.
    fn hydrate_cell(state: &mut StoreState<T>, key: &str, value: T) {
        if state
            .cells
            .get(key)
            .is_some_and(|cell| cell.touched || cell.is_present())
        {
            return;
        }
        let seq = state.bump_seq();
        let cell = state.cells.entry(key.to_string()).or_insert_with(Cell::absent);
        cell.seq = seq;
        cell.value.send_replace(Some(value));
    }

    /// Fills every cell from the persisted entries and renumbers iteration
    /// order: persisted keys first in backend order, then keys only written
    /// locally in the order they were written.
    fn hydrate_all(state: &mut StoreState<T>, entries: Vec<(String, T)>) {
        let mut local: Vec<(u64, String)> = state
            .cells
            .iter()
            .filter(|(_, cell)| cell.is_present())
            .map(|(key, cell)| (cell.seq, key.clone()))
            .collect();
        local.sort_unstable();

        let mut order = Vec::with_capacity(entries.len() + local.len());
        for (key, value) in entries {
            let cell = state.cells.entry(key.clone()).or_insert_with(Cell::absent);
            if !cell.touched && !cell.is_present() {
                cell.value.send_replace(Some(value));
            }
            if cell.is_present() {
                order.push(key);
            }
        }
        let persisted: HashSet<String> = order.iter().cloned().collect();
        order.extend(
            local
                .into_iter()
                .map(|(_, key)| key)
                .filter(|key| !persisted.contains(key)),
        );

        state.next_seq = 0;
        for key in order {
            let seq = state.bump_seq();
            if let Some(cell) = state.cells.get_mut(&key) {
                cell.seq = seq;
            }
        }
    }

    /// Loads every persisted entry, then flips the store to connected and
    /// runs the queued `on_connected` callbacks. A store whose entries cannot
    /// be read is never reported connected.
    async fn connect(&self, conn: &Connection) -> StoreResult<()> {
        let entries = conn.entries(&self.partition).await?;
        let decoded: Vec<(String, T)> = entries
            .into_iter()
            .filter_map(|(k, v)| self.decode(&k, v).map(|v| (k, v)))
            .collect();

        let waiters = {
            let mut state = self.lock();
            Self::hydrate_all(&mut state, decoded);
            self.status.send_replace(ConnectionStatus::Connected);
            std::mem::take(&mut state.waiters)
        };
        debug!(partition = %self.partition, "Store connected");

        for waiter in waiters {
            waiter();
        }
        Ok(())
    }

    /// Marks the store failed and answers every later flush with `message`.
    /// Queued writes are dropped so nothing overwrites rows that were never
    /// read.
    async fn fail(&self, message: String, ops: &mut mpsc::UnboundedReceiver<StoreOp<T>>) {
        error!(partition = %self.partition, error = %message, "Store failed to connect");
        self.status
            .send_replace(ConnectionStatus::Failed(message.clone()));

        while let Some(op) = ops.recv().await {
            if let StoreOp::Flush(reply) = op {
                let _ = reply.send(Err(StoreError::Connection(message.clone())));
            }
        }
    }
}

enum StoreOp<T> {
    Put(String, T),
    Delete(String),
    Hydrate(String),
    Flush(oneshot::Sender<StoreResult<()>>),
}

/// Reactive, asynchronously persisted key/value store over one partition.
///
/// Cloning yields another handle to the same cells.
pub struct ReactiveStore<T> {
    shared: Arc<StoreShared<T>>,
    ops: mpsc::UnboundedSender<StoreOp<T>>,
}

impl<T> Clone for ReactiveStore<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            ops: self.ops.clone(),
        }
    }
}

impl<T: StoreValue> ReactiveStore<T> {
    /// Creates a store over `partition` and starts connecting it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(broker: &ConnectionBroker, partition: impl Into<String>) -> Self {
        let partition = partition.into();
        let open = broker.open(&partition);
        let (ops, rx) = mpsc::unbounded_channel();

        let shared = Arc::new(StoreShared {
            partition,
            state: Mutex::new(StoreState {
                cells: HashMap::new(),
                next_seq: 0,
                waiters: Vec::new(),
            }),
            status: watch::channel(ConnectionStatus::Pending).0,
        });

        tokio::spawn(run_worker(Arc::clone(&shared), open, rx));
        Self { shared, ops }
    }

    pub fn partition(&self) -> &str {
        &self.shared.partition
    }

    /// Returns the current value of `key` without blocking.
    pub fn get(&self, key: &str) -> Option<T> {
        let mut state = self.shared.lock();
        if let Some(cell) = state.cells.get(key) {
            return cell.value.borrow().clone();
        }
        self.track(&mut state, key);
        None
    }

    /// Whether `key` currently holds a value.
    pub fn contains(&self, key: &str) -> bool {
        self.shared
            .lock()
            .cells
            .get(key)
            .is_some_and(Cell::is_present)
    }

    /// Keys holding a value, in first-insertion order. Persisted keys come
    /// before keys first written while the store was still connecting.
    pub fn keys(&self) -> Vec<String> {
        let state = self.shared.lock();
        let mut present: Vec<(u64, &String)> = state
            .cells
            .iter()
            .filter(|(_, cell)| cell.is_present())
            .map(|(key, cell)| (cell.seq, key))
            .collect();
        present.sort_unstable_by_key(|(seq, _)| *seq);
        present.into_iter().map(|(_, key)| key.clone()).collect()
    }

    /// Stores `value` under `key`. Visible to readers immediately; the durable
    /// write is queued behind every earlier operation on this store.
    pub fn set(&self, key: impl Into<String>, value: T) {
        let key = key.into();
        {
            let mut state = self.shared.lock();
            let fresh = !state.cells.get(&key).is_some_and(Cell::is_present);
            let seq = fresh.then(|| state.bump_seq());
            let cell = state.cells.entry(key.clone()).or_insert_with(Cell::absent);
            if let Some(seq) = seq {
                cell.seq = seq;
            }
            cell.touched = true;
            cell.value.send_replace(Some(value.clone()));
        }
        self.enqueue(StoreOp::Put(key, value));
    }

    /// Clears `key` immediately and queues the durable delete.
    pub fn delete(&self, key: &str) {
        {
            let mut state = self.shared.lock();
            let cell = state.cells.entry(key.to_string()).or_insert_with(Cell::absent);
            cell.touched = true;
            cell.value.send_replace(None);
        }
        self.enqueue(StoreOp::Delete(key.to_string()));
    }

    /// Subscribes to changes of `key`.
    pub fn watch(&self, key: &str) -> watch::Receiver<Option<T>> {
        let mut state = self.shared.lock();
        if !state.cells.contains_key(key) {
            self.track(&mut state, key);
        }
        match state.cells.get(key) {
            Some(cell) => cell.value.subscribe(),
            None => watch::channel(None).1,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.status.borrow().clone()
    }

    /// Runs `callback` once the store is connected, right away if it already is.
    pub fn on_connected(&self, callback: impl FnOnce() + Send + 'static) {
        let mut state = self.shared.lock();
        if self.shared.is_connected() {
            drop(state);
            callback();
        } else {
            state.waiters.push(Box::new(callback));
        }
    }

    /// Waits until the store is connected.
    pub async fn connected(&self) -> StoreResult<()> {
        let mut rx = self.shared.status.subscribe();
        let status = rx
            .wait_for(|s| *s != ConnectionStatus::Pending)
            .await
            .map_err(|_| StoreError::Closed)?
            .clone();
        match status {
            ConnectionStatus::Failed(message) => Err(StoreError::Connection(message)),
            _ => Ok(()),
        }
    }

    /// Waits until every write issued before this call has reached the
    /// backend. Reports the first write failure since the previous flush.
    pub async fn flush(&self) -> StoreResult<()> {
        let (tx, rx) = oneshot::channel();
        self.ops
            .send(StoreOp::Flush(tx))
            .map_err(|_| StoreError::Closed)?;
        rx.await.map_err(|_| StoreError::Closed)?
    }

    /// Writes each fallback whose key is still absent once the store has
    /// connected, so persisted values are never overwritten.
    pub fn set_defaults(&self, fallbacks: impl IntoIterator<Item = (String, T)>) {
        let fallbacks: Vec<(String, T)> = fallbacks.into_iter().collect();
        let store = self.clone();
        self.on_connected(move || {
            for (key, value) in fallbacks {
                if !store.contains(&key) {
                    store.set(key, value);
                }
            }
        });
    }

    /// Creates an absent cell for `key`; once connected it is hydrated from
    /// the backend.
    fn track(&self, state: &mut StoreState<T>, key: &str) {
        state.cells.insert(key.to_string(), Cell::absent());
        if self.shared.is_connected() {
            self.enqueue(StoreOp::Hydrate(key.to_string()));
        }
    }

    fn enqueue(&self, op: StoreOp<T>) {
        if self.ops.send(op).is_err() {
            warn!(partition = %self.shared.partition, "Store worker stopped; operation dropped");
        }
    }
}

async fn run_worker<T: StoreValue>(
    shared: Arc<StoreShared<T>>,
    open: BoxFuture<'static, StoreResult<Connection>>,
    mut ops: mpsc::UnboundedReceiver<StoreOp<T>>,
) {
    let connected = match open.await {
        Ok(conn) => {
            let loaded = shared.connect(&conn).await;
            loaded.map(|()| conn)
        }
        Err(e) => Err(e),
    };
    let conn = match connected {
        Ok(conn) => conn,
        Err(e) => {
            let message = match e {
                StoreError::Connection(message) => message,
                other => other.to_string(),
            };
            shared.fail(message, &mut ops).await;
            return;
        }
    };

    let partition = shared.partition.clone();
    let mut failure: Option<StoreError> = None;

    while let Some(op) = ops.recv().await {
        let result = match op {
            StoreOp::Put(key, value) => match serde_json::to_value(&value) {
                Ok(value) => conn.put(&partition, &key, value).await,
                Err(e) => Err(e.into()),
            },
            StoreOp::Delete(key) => conn.delete(&partition, &key).await,
            StoreOp::Hydrate(key) => match conn.get(&partition, &key).await {
                Ok(Some(raw)) => {
                    if let Some(value) = shared.decode(&key, raw) {
                        let mut state = shared.lock();
                        StoreShared::hydrate_cell(&mut state, &key, value);
                    }
                    Ok(())
                }
                Ok(None) => Ok(()),
                Err(e) => Err(e),
            },
            StoreOp::Flush(reply) => {
                let _ = reply.send(failure.take().map_or(Ok(()), Err));
                continue;
            }
        };

        if let Err(e) = result {
            error!(partition = %partition, error = %e, "Store backend operation failed");
            failure.get_or_insert(e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn store_over(backend: &MemoryBackend, partition: &str) -> ReactiveStore<i64> {
        let broker = ConnectionBroker::new(Arc::new(backend.clone()));
        ReactiveStore::new(&broker, partition)
    }

    #[tokio::test]
    async fn set_is_visible_before_connect() {
        let backend = MemoryBackend::paused();
        let store = store_over(&backend, "p");

        assert_eq!(store.get("k"), None);
        store.set("k", 1);
        assert_eq!(store.get("k"), Some(1));
        assert!(!store.is_connected());

        backend.resume();
        store.connected().await.unwrap();
        store.flush().await.unwrap();
        assert_eq!(backend.value("p", "k"), Some(json!(1)));
    }

    #[tokio::test]
    async fn local_write_wins_over_hydration() {
        let backend = MemoryBackend::paused();
        backend.seed("p", "k", json!(10));
        let store = store_over(&backend, "p");

        store.set("k", 20);
        backend.resume();
        store.connected().await.unwrap();

        assert_eq!(store.get("k"), Some(20));
        store.flush().await.unwrap();
        assert_eq!(backend.value("p", "k"), Some(json!(20)));
    }

    #[tokio::test]
    async fn delete_before_connect_is_not_resurrected() {
        let backend = MemoryBackend::paused();
        backend.seed("p", "k", json!(10));
        let store = store_over(&backend, "p");

        store.delete("k");
        backend.resume();
        store.connected().await.unwrap();

        assert_eq!(store.get("k"), None);
        store.flush().await.unwrap();
        assert_eq!(backend.value("p", "k"), None);
    }

    #[tokio::test]
    async fn writes_apply_in_call_order() {
        let backend = MemoryBackend::paused();
        let store = store_over(&backend, "p");

        store.set("k", 1);
        store.delete("k");
        store.set("k", 3);
        backend.resume();
        store.flush().await.unwrap();

        assert_eq!(backend.value("p", "k"), Some(json!(3)));
    }

    #[tokio::test]
    async fn unknown_key_after_connect_is_hydrated() {
        let backend = MemoryBackend::new();
        let store = store_over(&backend, "p");
        store.connected().await.unwrap();

        backend.seed("p", "late", json!(7));
        assert_eq!(store.get("late"), None);
        store.flush().await.unwrap();
        assert_eq!(store.get("late"), Some(7));
    }

    #[tokio::test]
    async fn on_connected_runs_immediately_once_connected() {
        let backend = MemoryBackend::paused();
        let store = store_over(&backend, "p");

        let (tx, rx) = std::sync::mpsc::channel();
        let early = tx.clone();
        store.on_connected(move || early.send("early").unwrap());
        assert!(rx.try_recv().is_err());

        backend.resume();
        store.connected().await.unwrap();
        assert_eq!(rx.try_recv().unwrap(), "early");

        store.on_connected(move || tx.send("late").unwrap());
        assert_eq!(rx.try_recv().unwrap(), "late");
    }

    #[tokio::test]
    async fn keys_follow_insertion_order() {
        let backend = MemoryBackend::new();
        backend.seed("p", "b", json!(1));
        backend.seed("p", "a", json!(2));
        let store = store_over(&backend, "p");
        store.connected().await.unwrap();

        store.set("c", 3);
        store.set("b", 4);
        assert_eq!(store.keys(), vec!["b", "a", "c"]);

        store.delete("a");
        store.set("a", 5);
        assert_eq!(store.keys(), vec!["b", "c", "a"]);
    }

    #[tokio::test]
    async fn watch_sees_updates() {
        let backend = MemoryBackend::new();
        let store = store_over(&backend, "p");

        let mut rx = store.watch("k");
        assert_eq!(*rx.borrow(), None);
        store.set("k", 9);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), Some(9));
    }

    #[tokio::test]
    async fn defaults_do_not_overwrite_persisted_values() {
        let backend = MemoryBackend::paused();
        backend.seed("p", "kept", json!(1));
        let store = store_over(&backend, "p");

        store.set_defaults([("kept".to_string(), 100), ("fresh".to_string(), 200)]);
        assert_eq!(store.get("fresh"), None);

        backend.resume();
        store.connected().await.unwrap();
        assert_eq!(store.get("kept"), Some(1));
        assert_eq!(store.get("fresh"), Some(200));
    }

    #[tokio::test]
    async fn failed_connection_reports_to_waiters() {
        let backend = MemoryBackend::new();
        backend.fail_next_open("locked");
        let store = store_over(&backend, "p");

        store.set("k", 1);
        assert!(matches!(store.connected().await, Err(StoreError::Connection(_))));
        assert!(matches!(store.flush().await, Err(StoreError::Connection(_))));
        assert_eq!(store.status(), ConnectionStatus::Failed("locked".into()));
        assert_eq!(store.get("k"), Some(1));
    }

    #[tokio::test]
    async fn unreadable_entries_fail_the_store() {
        let backend = MemoryBackend::new();
        backend.seed("p", "k", json!(1));
        backend.fail_next_entries("disk read");
        let store = store_over(&backend, "p");

        assert_eq!(store.get("k"), None);
        assert!(matches!(store.connected().await, Err(StoreError::Connection(_))));
        assert_eq!(store.status(), ConnectionStatus::Failed("disk read".into()));
        assert!(!store.is_connected());

        store.set("k", 99);
        assert!(matches!(store.flush().await, Err(StoreError::Connection(_))));
        assert_eq!(backend.value("p", "k"), Some(json!(1)));
    }

    #[tokio::test]
    async fn persisted_keys_precede_keys_written_while_connecting() {
        let backend = MemoryBackend::paused();
        backend.seed("p", "old-1", json!(1));
        backend.seed("p", "old-2", json!(2));
        let store = store_over(&backend, "p");

        store.set("new", 3);
        store.set("old-2", 20);
        assert_eq!(store.keys(), vec!["new", "old-2"]);

        backend.resume();
        store.connected().await.unwrap();
        assert_eq!(store.keys(), vec!["old-1", "old-2", "new"]);
        assert_eq!(store.get("old-2"), Some(20));

        store.set("newer", 4);
        assert_eq!(store.keys(), vec!["old-1", "old-2", "new", "newer"]);
    }

    #[tokio::test]
    async fn undecodable_values_are_skipped() {
        let backend = MemoryBackend::new();
        backend.seed("p", "bad", json!("not a number"));
        backend.seed("p", "good", json!(3));
        let store = store_over(&backend, "p");
        store.connected().await.unwrap();

        assert_eq!(store.get("bad"), None);
        assert_eq!(store.get("good"), Some(3));
    }
}
