//! Storage backend abstraction.
//!
//! A backend is opened with the complete list of partitions it has to serve,
//! the same way a schema-versioned database declares its tables up front.
//! Adding a partition later means opening again with a higher version.

use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// A resolved backend connection, shared by every store of one open batch.
pub type Connection = Arc<dyn BackendConnection>;

/// Opens connections to a persistence backend.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Opens a connection whose schema declares every partition in
    /// `partitions`. `version` grows with every open issued by a broker.
    async fn open(&self, partitions: Vec<String>, version: u64) -> StoreResult<Connection>;
}

/// Flat key/value access to the partitions of an open connection.
#[async_trait]
pub trait BackendConnection: Send + Sync {
    /// Reads one key.
    async fn get(&self, partition: &str, key: &str) -> StoreResult<Option<Value>>;

    /// Inserts or replaces one key.
    async fn put(&self, partition: &str, key: &str, value: Value) -> StoreResult<()>;

    /// Deletes one key. Deleting a missing key is not an error.
    async fn delete(&self, partition: &str, key: &str) -> StoreResult<()>;

    /// Returns every entry of a partition in first-insertion order.
    async fn entries(&self, partition: &str) -> StoreResult<Vec<(String, Value)>>;
}

/// Checks that a partition name is safe to use as a table name.
pub fn validate_partition(name: &str) -> StoreResult<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidPartition(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_names() {
        assert!(validate_partition("plugins-internal").is_ok());
        assert!(validate_partition("plugins_data2").is_ok());
        assert!(validate_partition("").is_err());
        assert!(validate_partition("a b").is_err());
        assert!(matches!(
            validate_partition("x\"; DROP TABLE y"),
            Err(StoreError::InvalidPartition(_))
        ));
    }
}
