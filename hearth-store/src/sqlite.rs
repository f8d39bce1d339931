//! SQLite backend.
//!
//! One table per partition. Every open runs its `CREATE TABLE IF NOT EXISTS`
//! statements in a single transaction and bumps `PRAGMA user_version`, so a
//! database file always records the newest schema that touched it.

use crate::backend::{validate_partition, BackendConnection, Connection, StorageBackend};
use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use rusqlite::{params, OptionalExtension};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

fn table_name(partition: &str) -> String {
    format!("\"kv_{partition}\"")
}

/// Backend storing partitions as tables of a SQLite database file.
#[derive(Debug, Clone)]
pub struct SqliteBackend {
    path: PathBuf,
}

impl SqliteBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    async fn open(&self, partitions: Vec<String>, version: u64) -> StoreResult<Connection> {
        for name in &partitions {
            validate_partition(name)?;
        }
        let path = self.path.clone();

        let conn = tokio::task::spawn_blocking(move || -> StoreResult<rusqlite::Connection> {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            let mut conn = rusqlite::Connection::open(&path)?;
            conn.busy_timeout(BUSY_TIMEOUT)?;

            let tx = conn.transaction()?;
            for name in &partitions {
                tx.execute_batch(&format!(
                    "CREATE TABLE IF NOT EXISTS {} (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
                    table_name(name)
                ))?;
            }
            let current: i64 = tx.query_row("PRAGMA user_version", [], |row| row.get(0))?;
            let version = i64::try_from(version).unwrap_or(i64::MAX);
            if version > current {
                tx.pragma_update(None, "user_version", version)?;
            }
            tx.commit()?;
            Ok(conn)
        })
        .await??;

        Ok(Arc::new(SqliteConnection {
            conn: Arc::new(Mutex::new(conn)),
        }))
    }
}

struct SqliteConnection {
    conn: Arc<Mutex<rusqlite::Connection>>,
}

impl SqliteConnection {
    async fn run<R, F>(&self, partition: &str, f: F) -> StoreResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&rusqlite::Connection, &str) -> StoreResult<R> + Send + 'static,
    {
        validate_partition(partition)?;
        let table = table_name(partition);
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&conn, &table)
        })
        .await?
    }
}

#[async_trait]
impl BackendConnection for SqliteConnection {
    async fn get(&self, partition: &str, key: &str) -> StoreResult<Option<Value>> {
        let key = key.to_string();
        self.run(partition, move |conn, table| {
            let raw: Option<String> = conn
                .query_row(
                    &format!("SELECT value FROM {table} WHERE key = ?1"),
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;
            raw.map(|s| serde_json::from_str::<Value>(&s).map_err(StoreError::from))
                .transpose()
        })
        .await
    }

    async fn put(&self, partition: &str, key: &str, value: Value) -> StoreResult<()> {
        let key = key.to_string();
        self.run(partition, move |conn, table| {
            let raw = serde_json::to_string(&value)?;
            conn.execute(
                &format!(
                    "INSERT INTO {table} (key, value) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value"
                ),
                params![key, raw],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, partition: &str, key: &str) -> StoreResult<()> {
        let key = key.to_string();
        self.run(partition, move |conn, table| {
            conn.execute(&format!("DELETE FROM {table} WHERE key = ?1"), params![key])?;
            Ok(())
        })
        .await
    }

    async fn entries(&self, partition: &str) -> StoreResult<Vec<(String, Value)>> {
        self.run(partition, |conn, table| {
            let mut stmt = conn.prepare(&format!("SELECT key, value FROM {table} ORDER BY rowid"))?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;

            let mut out = Vec::new();
            for row in rows {
                let (key, raw) = row?;
                out.push((key, serde_json::from_str(&raw)?));
            }
            Ok(out)
        })
        .await
    }
}
