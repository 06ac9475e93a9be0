use std::path::Path;
use anyhow::{Context, Result};
use rusqlite::{Connection, params, OptionalExtension};
use chrono::Utc;

/// A live key/value pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub key: String,
    pub value: String,
}

/// SQLite-backed key/value table where every key carries a deadline.
///
/// Keys whose deadline has passed are invisible to reads and writes that
/// expect an existing key, and are physically removed by `take_expired`.
/// All timestamps are unix milliseconds supplied by the caller.
pub struct KvDb {
    conn: Connection,
}

impl KvDb {
    /// Open or create the SQLite database with WAL mode enabled
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .context("Failed to enable WAL mode")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS entries (
                key         TEXT PRIMARY KEY,
                value       TEXT NOT NULL,
                expires_at  INTEGER NOT NULL,
                updated_at  TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_expires_at ON entries(expires_at);
            "#,
        )
        .context("Failed to create database schema")?;

        Ok(Self { conn })
    }

    /// Value of a live key
    pub fn get(&self, key: &str, now: i64) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM entries WHERE key = ?1 AND expires_at > ?2",
                params![key, now],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query entry")?;

        Ok(value)
    }

    /// Write or overwrite a key with a new value and deadline
    pub fn put(&self, key: &str, value: &str, expires_at: i64) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO entries (key, value, expires_at, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                expires_at = excluded.expires_at,
                updated_at = excluded.updated_at
            "#,
            params![key, value, expires_at, Utc::now().to_rfc3339()],
        )
        .context("Failed to put entry")?;

        Ok(())
    }

    /// Move the deadline of a live key, leaving its value untouched.
    /// Returns the value, or `None` if the key is absent or already expired.
    pub fn refresh(&self, key: &str, expires_at: i64, now: i64) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row(
                "UPDATE entries SET expires_at = ?1
                 WHERE key = ?2 AND expires_at > ?3
                 RETURNING value",
                params![expires_at, key, now],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to refresh entry")?;

        Ok(value)
    }

    /// Delete a live key. Returns false if it was absent or already expired;
    /// an expired key is left for `take_expired` to report.
    pub fn delete(&self, key: &str, now: i64) -> Result<bool> {
        let count = self
            .conn
            .execute(
                "DELETE FROM entries WHERE key = ?1 AND expires_at > ?2",
                params![key, now],
            )
            .context("Failed to delete entry")?;

        Ok(count > 0)
    }

    /// All live entries whose key starts with `prefix`, ordered by key
    pub fn list_prefix(&self, prefix: &str, now: i64) -> Result<Vec<KvEntry>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT key, value FROM entries
                 WHERE substr(key, 1, length(?1)) = ?1 AND expires_at > ?2
                 ORDER BY key"
            )
            .context("Failed to prepare query")?;

        let entries = stmt
            .query_map(params![prefix, now], |row| {
                Ok(KvEntry {
                    key: row.get(0)?,
                    value: row.get(1)?,
                })
            })
            .context("Failed to query entries by prefix")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to collect entries")?;

        Ok(entries)
    }

    /// Remove every key whose deadline has passed and return those keys
    pub fn take_expired(&self, now: i64) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("DELETE FROM entries WHERE expires_at <= ?1 RETURNING key")
            .context("Failed to prepare expiry")?;

        let mut keys = stmt
            .query_map(params![now], |row| row.get::<_, String>(0))
            .context("Failed to expire entries")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to collect expired keys")?;

        keys.sort();
        Ok(keys)
    }
}
