// Durable key-value storage
// SQLite-backed `auth_kv` table with an in-memory fallback

use anyhow::{Context, Result};
use dashmap::DashMap;
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

const PROBE_KEY: &str = "__probe__";

/// Minimal key-value facility the credential store persists into
pub trait Storage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;

    /// Round-trip a throwaway key to prove the storage is writable
    fn probe(&self) -> Result<()> {
        self.set(PROBE_KEY, PROBE_KEY)?;
        self.remove(PROBE_KEY)
    }

    /// Human-readable name for logs
    fn describe(&self) -> String;
}

/// SQLite storage backed by a single `auth_kv (key, value)` table
pub struct SqliteStorage {
    conn: Mutex<Connection>,
    label: String,
}

impl SqliteStorage {
    /// Open (or create) the database file
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create storage directory: {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database: {}", path.display()))?;
        Self::init(conn, path.display().to_string())
    }

    /// Private in-memory database, mostly for tests
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory SQLite")?;
        Self::init(conn, ":memory:".to_string())
    }

    fn init(conn: Connection, label: String) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS auth_kv (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
            [],
        )
        .context("Failed to create auth_kv table")?;

        Ok(Self {
            conn: Mutex::new(conn),
            label,
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow::anyhow!("SQLite connection lock poisoned"))?;
        f(&conn).with_context(|| format!("SQLite operation failed on {}", self.label))
    }
}

impl Storage for SqliteStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            conn.query_row("SELECT value FROM auth_kv WHERE key = ?", [key], |row| {
                row.get(0)
            })
            .optional()
        })
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO auth_kv (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                [key, value],
            )
            .map(|_| ())
        })
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.with_conn(|conn| conn.execute("DELETE FROM auth_kv WHERE key = ?", [key]).map(|_| ()))
    }

    fn describe(&self) -> String {
        format!("sqlite:{}", self.label)
    }
}

/// Process-lifetime storage used when nothing durable is available
#[derive(Default)]
pub struct MemoryStorage {
    entries: DashMap<String, String>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

/// Open durable storage at `path`, falling back to memory when it cannot be used
pub fn open_or_fallback(path: Option<&Path>) -> Box<dyn Storage> {
    let Some(path) = path else {
        tracing::warn!("No storage path configured, session will not survive restarts");
        return Box::new(MemoryStorage::new());
    };

    match SqliteStorage::open(path).and_then(|s| s.probe().map(|_| s)) {
        Ok(storage) => {
            tracing::debug!("Using durable session storage at {}", path.display());
            Box::new(storage)
        }
        Err(e) => {
            tracing::warn!(
                "Durable storage unavailable ({:#}), falling back to in-memory session storage",
                e
            );
            Box::new(MemoryStorage::new())
        }
    }
}
