//! Reactive key/value storage for Hearth.
//!
//! Stores read and write synchronously; persistence happens in the background
//! over a backend connection shared by every store that asked for one in the
//! same batch.
//!
//! # Architecture
//!
//! - [`StorageBackend`] opens connections declaring a fixed set of partitions
//!   ([`SqliteBackend`] for disk, [`MemoryBackend`] for tests and ephemeral hosts)
//! - [`ConnectionBroker`] batches partition requests into as few opens as possible
//! - [`ReactiveStore`] keeps one watchable cell per key and replays writes to the
//!   backend in call order

mod backend;
mod broker;
mod error;
mod memory;
mod reactive;
mod sqlite;

pub use backend::{validate_partition, BackendConnection, Connection, StorageBackend};
pub use broker::ConnectionBroker;
pub use error::{StoreError, StoreResult};
pub use memory::MemoryBackend;
pub use reactive::{ConnectionStatus, ReactiveStore, StoreValue};
pub use sqlite::SqliteBackend;
