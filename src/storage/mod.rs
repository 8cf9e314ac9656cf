//! Key-value persistence backing the investigation cache.

pub mod schema;

use anyhow::Result;
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("value for '{key}' is {size} bytes, over the {limit} byte quota")]
    QuotaExceeded { key: String, size: usize, limit: usize },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

impl From<r2d2::Error> for StoreError {
    fn from(e: r2d2::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

/// Synchronous string key-value store.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
    /// All keys starting with `prefix`.
    fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &str) -> Result<Pool> {
    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// `KvStore` over the `kv_store` SQLite table.
#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool,
    max_value_bytes: usize,
}

impl SqliteStore {
    pub fn new(pool: Pool, max_value_bytes: usize) -> Self {
        Self {
            pool,
            max_value_bytes,
        }
    }

    /// Open a pool at `path` and wrap it.
    pub fn open(path: &str, max_value_bytes: usize) -> Result<Self> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(Self::new(open_pool(path)?, max_value_bytes))
    }
}

impl KvStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.pool.get()?;
        let value = conn
            .query_row(
                "SELECT value FROM kv_store WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        if value.len() > self.max_value_bytes {
            return Err(StoreError::QuotaExceeded {
                key: key.to_string(),
                size: value.len(),
                limit: self.max_value_bytes,
            });
        }
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO kv_store (key, value, updated_at) VALUES (?1, ?2, datetime('now'))
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value],
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        conn.execute("DELETE FROM kv_store WHERE key = ?1", params![key])?;
        Ok(())
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT key FROM kv_store WHERE substr(key, 1, ?2) = ?1 ORDER BY key")?;
        let rows = stmt.query_map(params![prefix, prefix.chars().count() as i64], |row| {
            row.get::<_, String>(0)
        })?;

        let mut keys = Vec::new();
        for r in rows {
            keys.push(r?);
        }
        Ok(keys)
    }
}

/// In-process store, optionally bounded to emulate a quota.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
    max_value_bytes: Option<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(max_value_bytes: usize) -> Self {
        Self {
            entries: Mutex::default(),
            max_value_bytes: Some(max_value_bytes),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>, StoreError> {
        self.entries
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        if let Some(limit) = self.max_value_bytes {
            if value.len() > limit {
                return Err(StoreError::QuotaExceeded {
                    key: key.to_string(),
                    size: value.len(),
                    limit,
                });
            }
        }
        self.lock()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.lock()?.remove(key);
        Ok(())
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys: Vec<String> = self
            .lock()?
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(store: &dyn KvStore) -> Result<()> {
        assert_eq!(store.get("a:1")?, None);
        store.set("a:1", "one")?;
        store.set("a:2", "two")?;
        store.set("b:1", "other")?;
        store.set("a:1", "uno")?;
        assert_eq!(store.get("a:1")?.as_deref(), Some("uno"));
        assert_eq!(store.keys("a:")?, vec!["a:1".to_string(), "a:2".to_string()]);
        store.remove("a:1")?;
        assert_eq!(store.keys("a:")?, vec!["a:2".to_string()]);
        // Removing a missing key is not an error.
        store.remove("a:1")?;
        Ok(())
    }

    #[test]
    fn test_memory_store() -> Result<()> {
        exercise(&MemoryStore::new())
    }

    #[test]
    fn test_sqlite_store() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("kv.db");
        let store = SqliteStore::open(path.to_str().unwrap(), 1024)?;
        exercise(&store)
    }

    #[test]
    fn test_quota_is_enforced() {
        let store = MemoryStore::with_quota(4);
        assert!(matches!(
            store.set("k", "too long"),
            Err(StoreError::QuotaExceeded { size: 8, limit: 4, .. })
        ));
        assert!(store.set("k", "ok").is_ok());
    }

    #[test]
    fn test_sqlite_like_wildcards_in_prefix_are_literal() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = SqliteStore::open(dir.path().join("kv.db").to_str().unwrap(), 1024)?;
        store.set("a_b", "1")?;
        store.set("axb", "2")?;
        assert_eq!(store.keys("a_")?, vec!["a_b".to_string()]);
        Ok(())
    }
}
