//! Shared key-value storage for the distributed bus backend.
//!
//! [`KvStore`] models the hash/list/set/expiry surface the shared backend
//! persists through, so the key layout stays bit-compatible regardless of
//! the store behind it. [`SqliteKv`] implements it over a single SQLite
//! file shared by every worker process; SQLite's file locking arbitrates
//! concurrent writers.

use crate::error::KvError;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

/// Key-value operations required by the shared bus backend.
///
/// Implementations must be safe to call from multiple processes; the store
/// is the single source of truth and local caches are never authoritative.
pub trait KvStore: Send + Sync {
    /// Set fields on a hash, creating it if absent.
    fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> Result<(), KvError>;

    /// All fields of a hash, or `None` if the key does not exist.
    fn hash_get_all(&self, key: &str) -> Result<Option<HashMap<String, String>>, KvError>;

    /// Remove a key of any kind.
    fn delete(&self, key: &str) -> Result<(), KvError>;

    /// Expire a key `ttl_secs` from now.
    fn expire(&self, key: &str, ttl_secs: i64) -> Result<(), KvError>;

    /// Push a value onto the front of a list.
    fn list_push_front(&self, key: &str, value: &str) -> Result<(), KvError>;

    /// Pop the value at the back of a list, if any.
    fn list_pop_back(&self, key: &str) -> Result<Option<String>, KvError>;

    /// Keep only the first `max_len` entries of a list.
    fn list_trim(&self, key: &str, max_len: usize) -> Result<(), KvError>;

    /// Up to `limit` entries from the front of a list.
    fn list_range(&self, key: &str, limit: usize) -> Result<Vec<String>, KvError>;

    /// Add a member to a set.
    fn set_add(&self, key: &str, member: &str) -> Result<(), KvError>;

    /// Remove a member from a set.
    fn set_remove(&self, key: &str, member: &str) -> Result<(), KvError>;

    /// All members of a set.
    fn set_members(&self, key: &str) -> Result<Vec<String>, KvError>;

    /// Atomically increment a counter, returning the new value.
    fn incr(&self, key: &str) -> Result<u64, KvError>;
}

/// SQLite-file [`KvStore`].
pub struct SqliteKv {
    conn: Mutex<Connection>,
}

impl SqliteKv {
    /// Open or create the store at `path`.
    pub fn open(path: &Path) -> Result<Self, KvError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| KvError::Backend(format!("create {}: {e}", parent.display())))?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv_hash (
                key TEXT NOT NULL,
                field TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (key, field)
            );

            CREATE TABLE IF NOT EXISTS kv_list (
                key TEXT NOT NULL,
                seq INTEGER NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (key, seq)
            );

            CREATE TABLE IF NOT EXISTS kv_set (
                key TEXT NOT NULL,
                member TEXT NOT NULL,
                PRIMARY KEY (key, member)
            );

            CREATE TABLE IF NOT EXISTS kv_counter (
                key TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS kv_expiry (
                key TEXT PRIMARY KEY,
                expires_at INTEGER NOT NULL
            );
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Drop rows for keys whose TTL has elapsed.
    fn purge_expired(conn: &Connection) -> Result<(), rusqlite::Error> {
        let now = chrono::Utc::now().timestamp();
        let mut stmt = conn.prepare("SELECT key FROM kv_expiry WHERE expires_at <= ?1")?;
        let expired: Vec<String> = stmt
            .query_map(params![now], |row| row.get(0))?
            .collect::<Result<_, _>>()?;
        drop(stmt);

        for key in expired {
            conn.execute("DELETE FROM kv_hash WHERE key = ?1", params![key])?;
            conn.execute("DELETE FROM kv_list WHERE key = ?1", params![key])?;
            conn.execute("DELETE FROM kv_set WHERE key = ?1", params![key])?;
            conn.execute("DELETE FROM kv_expiry WHERE key = ?1", params![key])?;
        }
        Ok(())
    }
}

impl KvStore for SqliteKv {
    fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> Result<(), KvError> {
        let conn = self.lock();
        for (field, value) in fields {
            conn.execute(
                "INSERT INTO kv_hash (key, field, value) VALUES (?1, ?2, ?3) \
                 ON CONFLICT (key, field) DO UPDATE SET value = excluded.value",
                params![key, field, value],
            )?;
        }
        Ok(())
    }

    fn hash_get_all(&self, key: &str) -> Result<Option<HashMap<String, String>>, KvError> {
        let conn = self.lock();
        Self::purge_expired(&conn)?;

        let mut stmt = conn.prepare("SELECT field, value FROM kv_hash WHERE key = ?1")?;
        let fields: HashMap<String, String> = stmt
            .query_map(params![key], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<_, _>>()?;

        if fields.is_empty() {
            Ok(None)
        } else {
            Ok(Some(fields))
        }
    }

    fn delete(&self, key: &str) -> Result<(), KvError> {
        let conn = self.lock();
        conn.execute("DELETE FROM kv_hash WHERE key = ?1", params![key])?;
        conn.execute("DELETE FROM kv_list WHERE key = ?1", params![key])?;
        conn.execute("DELETE FROM kv_set WHERE key = ?1", params![key])?;
        conn.execute("DELETE FROM kv_expiry WHERE key = ?1", params![key])?;
        Ok(())
    }

    fn expire(&self, key: &str, ttl_secs: i64) -> Result<(), KvError> {
        let expires_at = chrono::Utc::now().timestamp() + ttl_secs;
        let conn = self.lock();
        conn.execute(
            "INSERT INTO kv_expiry (key, expires_at) VALUES (?1, ?2) \
             ON CONFLICT (key) DO UPDATE SET expires_at = excluded.expires_at",
            params![key, expires_at],
        )?;
        Ok(())
    }

    fn list_push_front(&self, key: &str, value: &str) -> Result<(), KvError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO kv_list (key, seq, value) VALUES (
                ?1,
                COALESCE((SELECT MIN(seq) FROM kv_list WHERE key = ?1), 0) - 1,
                ?2
            )",
            params![key, value],
        )?;
        Ok(())
    }

    fn list_pop_back(&self, key: &str) -> Result<Option<String>, KvError> {
        let conn = self.lock();
        let back: Option<(i64, String)> = conn
            .query_row(
                "SELECT seq, value FROM kv_list WHERE key = ?1 \
                 ORDER BY seq DESC LIMIT 1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match back {
            Some((seq, value)) => {
                conn.execute(
                    "DELETE FROM kv_list WHERE key = ?1 AND seq = ?2",
                    params![key, seq],
                )?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn list_trim(&self, key: &str, max_len: usize) -> Result<(), KvError> {
        let conn = self.lock();
        conn.execute(
            "DELETE FROM kv_list WHERE key = ?1 AND seq NOT IN (
                SELECT seq FROM kv_list WHERE key = ?1 ORDER BY seq ASC LIMIT ?2
            )",
            params![key, max_len as i64],
        )?;
        Ok(())
    }

    fn list_range(&self, key: &str, limit: usize) -> Result<Vec<String>, KvError> {
        let conn = self.lock();
        Self::purge_expired(&conn)?;

        let mut stmt = conn.prepare(
            "SELECT value FROM kv_list WHERE key = ?1 ORDER BY seq ASC LIMIT ?2",
        )?;
        let values: Vec<String> = stmt
            .query_map(params![key, limit as i64], |row| row.get(0))?
            .collect::<Result<_, _>>()?;
        Ok(values)
    }

    fn set_add(&self, key: &str, member: &str) -> Result<(), KvError> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR IGNORE INTO kv_set (key, member) VALUES (?1, ?2)",
            params![key, member],
        )?;
        Ok(())
    }

    fn set_remove(&self, key: &str, member: &str) -> Result<(), KvError> {
        let conn = self.lock();
        conn.execute(
            "DELETE FROM kv_set WHERE key = ?1 AND member = ?2",
            params![key, member],
        )?;
        Ok(())
    }

    fn set_members(&self, key: &str) -> Result<Vec<String>, KvError> {
        let conn = self.lock();
        Self::purge_expired(&conn)?;

        let mut stmt = conn.prepare("SELECT member FROM kv_set WHERE key = ?1")?;
        let members: Vec<String> = stmt
            .query_map(params![key], |row| row.get(0))?
            .collect::<Result<_, _>>()?;
        Ok(members)
    }

    fn incr(&self, key: &str) -> Result<u64, KvError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO kv_counter (key, value) VALUES (?1, 1) \
             ON CONFLICT (key) DO UPDATE SET value = value + 1",
            params![key],
        )?;
        let value: i64 = conn.query_row(
            "SELECT value FROM kv_counter WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )?;
        Ok(value as u64)
    }
}
