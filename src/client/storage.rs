//! Durable client-side key/value storage, independent of the medium.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

use super::migrations;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error("json serialization: {0}")]
    Json(#[from] serde_json::Error),

    #[error("filesystem: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Config(String),
}

pub trait QueueStorage: Send {
    fn load(&self, key: &str) -> Result<Option<String>, StorageError>;

    fn save(&self, key: &str, value: &str) -> Result<(), StorageError>;

    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// SQLite file holding one row per key.
pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut conn = Connection::open(path)?;
        migrations::migrate(&mut conn)
            .map_err(|e| StorageError::Config(format!("migration failed: {e}")))?;
        Ok(Self { conn })
    }

    pub fn default_path() -> Result<PathBuf, StorageError> {
        let home = dirs::home_dir()
            .ok_or_else(|| StorageError::Config("failed to determine home directory".to_string()))?;
        Ok(home.join(".mailsync").join("client.db"))
    }
}

impl QueueStorage for SqliteStorage {
    fn load(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self
            .conn
            .query_row(
                "SELECT value FROM client_state WHERE key = ?1 LIMIT 1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn save(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.conn.execute(
            r#"
            INSERT INTO client_state (key, value, updated_at)
            VALUES (?1, ?2, strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
            params![key, value],
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.conn
            .execute("DELETE FROM client_state WHERE key = ?1", params![key])?;
        Ok(())
    }
}

/// Shared in-memory storage; clones see the same entries, which lets a test
/// drop a queue and load it again as a page reload would.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    entries: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>, StorageError> {
        self.entries
            .lock()
            .map_err(|_| StorageError::Config("memory storage lock poisoned".to_string()))
    }
}

impl QueueStorage for MemoryStorage {
    fn load(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.entries()?.get(key).cloned())
    }

    fn save(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.entries()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.entries()?.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use uuid::Uuid;

    use super::{MemoryStorage, QueueStorage, SqliteStorage};

    fn temp_db_path() -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("mailsync-client-{}.db", Uuid::new_v4()));
        path
    }

    #[test]
    fn sqlite_storage_survives_reopen() {
        let path = temp_db_path();
        {
            let storage = SqliteStorage::open(&path).expect("open storage");
            storage.save("k", "v1").expect("save");
            storage.save("k", "v2").expect("overwrite");
        }

        let storage = SqliteStorage::open(&path).expect("reopen storage");
        assert_eq!(storage.load("k").expect("load").as_deref(), Some("v2"));
        storage.remove("k").expect("remove");
        assert_eq!(storage.load("k").expect("load"), None);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn memory_storage_clones_share_entries() {
        let storage = MemoryStorage::new();
        let reloaded = storage.clone();
        storage.save("k", "v").expect("save");
        assert_eq!(reloaded.load("k").expect("load").as_deref(), Some("v"));
    }
}
