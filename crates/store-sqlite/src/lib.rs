use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::Utc;
use core_model::{KvStore, StorageError};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;

pub struct SqliteKvStore {
    conn: Connection,
}

#[derive(Debug, Clone)]
pub struct KvEntry {
    pub key: String,
    pub bytes: usize,
    pub updated_at: String,
}

impl SqliteKvStore {
    pub fn default_path() -> PathBuf {
        let base = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        base.join("chatdex").join("chatdex.db")
    }

    pub fn open_default() -> anyhow::Result<Self> {
        Self::open_at(Self::default_path())
    }

    pub fn open_at(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating parent dir for {}", path.display()))?;
        }
        Self::open(path)
    }

    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("opening sqlite db {}", path.as_ref().display()))?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        Ok(Self { conn })
    }

    pub fn init_schema(&self) -> anyhow::Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
              key TEXT PRIMARY KEY,
              value TEXT NOT NULL,
              updated_at TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    pub fn entries(&self) -> anyhow::Result<Vec<KvEntry>> {
        let mut stmt = self
            .conn
            .prepare("SELECT key, length(CAST(value AS BLOB)), updated_at FROM kv ORDER BY key ASC")?;
        let rows = stmt.query_map([], |r| {
            let bytes: i64 = r.get(1)?;
            Ok(KvEntry {
                key: r.get(0)?,
                bytes: bytes.max(0) as usize,
                updated_at: r.get(2)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Into::into)
    }

    pub fn integrity_check(&self) -> anyhow::Result<String> {
        self.conn
            .query_row("PRAGMA integrity_check;", [], |r| r.get(0))
            .map_err(Into::into)
    }
}

impl KvStore for SqliteKvStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |r| {
                r.get(0)
            })
            .optional()
            .map_err(backend)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.conn
            .execute(
                r#"INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
                ON CONFLICT(key) DO UPDATE SET value=excluded.value, updated_at=excluded.updated_at"#,
                params![key, value, Utc::now().to_rfc3339()],
            )
            .map_err(backend)?;
        debug!(key, bytes = value.len(), "kv set");
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.conn
            .execute("DELETE FROM kv WHERE key = ?1", params![key])
            .map_err(backend)?;
        debug!(key, "kv remove");
        Ok(())
    }
}

fn backend(err: rusqlite::Error) -> StorageError {
    StorageError::Backend(err.to_string())
}
