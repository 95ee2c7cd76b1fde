//! SQLite store backend
//!
//! Lets handlers in separate processes share one coordination store. Every
//! conditional write is a single guarded statement (or a transaction whose
//! first statement is the guarded write), so SQLite's write lock provides the
//! atomicity the coordination layer relies on.
//!
//! Expiry uses wall-clock milliseconds because the file may be shared across
//! processes. Expired rows are purged lazily before list operations and are
//! filtered out of every value read.

use super::{Store, StreamEntry};
use crate::time::now_millis;
use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Store backed by a SQLite database file
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

fn expiry_millis(ttl: Option<Duration>) -> Option<i64> {
    ttl.map(|t| now_millis() + t.as_millis() as i64)
}

impl SqliteStore {
    /// Open (creating if needed) the store database at `db_path`
    pub async fn open(db_path: &Path) -> Result<Self> {
        let newly_created = !db_path.exists();

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        // WAL lets readers proceed while a CAS holds the write lock; the busy
        // timeout makes contending writers wait instead of failing
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", db_path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;

        if newly_created {
            info!("Initialized new store database: {}", db_path.display());
        } else {
            info!("Opened existing store database: {}", db_path.display());
        }

        let store = Self { pool };
        store.create_tables().await?;
        Ok(store)
    }

    async fn create_tables(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                expires_at INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS list_items (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                key TEXT NOT NULL,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_list_items_key ON list_items (key, id)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS list_expiry (
                key TEXT PRIMARY KEY,
                expires_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS stream_entries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                stream TEXT NOT NULL,
                created_ms INTEGER NOT NULL,
                fields TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Drop expired value and list rows for `key`
    async fn purge_expired(&self, key: &str) -> Result<()> {
        let now = now_millis();
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM kv WHERE key = ? AND expires_at IS NOT NULL AND expires_at <= ?")
            .bind(key)
            .bind(now)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            DELETE FROM list_items
            WHERE key = ?
              AND EXISTS (SELECT 1 FROM list_expiry WHERE key = ? AND expires_at <= ?)
            "#,
        )
        .bind(key)
        .bind(key)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM list_expiry WHERE key = ? AND expires_at <= ?")
            .bind(key)
            .bind(now)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// The guarded write shared by both CAS flavours; returns rows affected
    async fn guarded_write(
        tx: &mut Transaction<'_, Sqlite>,
        key: &str,
        expected: Option<&str>,
        value: &str,
        expires_at: Option<i64>,
    ) -> Result<u64> {
        let now = now_millis();
        let result = match expected {
            // Insert when absent; overwrite only a row that has already expired
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO kv (key, value, expires_at) VALUES (?, ?, ?)
                    ON CONFLICT(key) DO UPDATE SET
                        value = excluded.value,
                        expires_at = excluded.expires_at
                    WHERE kv.expires_at IS NOT NULL AND kv.expires_at <= ?
                    "#,
                )
                .bind(key)
                .bind(value)
                .bind(expires_at)
                .bind(now)
                .execute(&mut **tx)
                .await?
            }
            Some(expected) => {
                sqlx::query(
                    r#"
                    UPDATE kv SET value = ?, expires_at = ?
                    WHERE key = ? AND value = ?
                      AND (expires_at IS NULL OR expires_at > ?)
                    "#,
                )
                .bind(value)
                .bind(expires_at)
                .bind(key)
                .bind(expected)
                .bind(now)
                .execute(&mut **tx)
                .await?
            }
        };
        Ok(result.rows_affected())
    }
}

#[async_trait::async_trait]
impl Store for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let value = sqlx::query_scalar::<_, String>(
            "SELECT value FROM kv WHERE key = ? AND (expires_at IS NULL OR expires_at > ?)",
        )
        .bind(key)
        .bind(now_millis())
        .fetch_optional(&self.pool)
        .await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO kv (key, value, expires_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(expiry_millis(ttl))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let written = Self::guarded_write(&mut tx, key, expected, value, expiry_millis(ttl)).await?;
        tx.commit().await?;
        Ok(written == 1)
    }

    async fn compare_and_set_with(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        extra: &[(String, String)],
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let written = Self::guarded_write(&mut tx, key, expected, value, None).await?;
        if written != 1 {
            tx.rollback().await?;
            return Ok(false);
        }

        for (k, v) in extra {
            sqlx::query(
                r#"
                INSERT INTO kv (key, value, expires_at) VALUES (?, ?, NULL)
                ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    expires_at = NULL
                "#,
            )
            .bind(k)
            .bind(v)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn delete(&self, keys: &[String]) -> Result<usize> {
        let mut removed = 0;
        for key in keys {
            self.purge_expired(key).await?;

            let mut tx = self.pool.begin().await?;
            let values = sqlx::query("DELETE FROM kv WHERE key = ?")
                .bind(key)
                .execute(&mut *tx)
                .await?
                .rows_affected();
            let items = sqlx::query("DELETE FROM list_items WHERE key = ?")
                .bind(key)
                .execute(&mut *tx)
                .await?
                .rows_affected();
            sqlx::query("DELETE FROM list_expiry WHERE key = ?")
                .bind(key)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;

            if values > 0 || items > 0 {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn expire(&self, keys: &[String], ttl: Duration) -> Result<()> {
        let expires_at = now_millis() + ttl.as_millis() as i64;
        for key in keys {
            self.purge_expired(key).await?;

            sqlx::query("UPDATE kv SET expires_at = ? WHERE key = ?")
                .bind(expires_at)
                .bind(key)
                .execute(&self.pool)
                .await?;

            sqlx::query(
                r#"
                INSERT INTO list_expiry (key, expires_at)
                SELECT ?, ? WHERE EXISTS (SELECT 1 FROM list_items WHERE key = ?)
                ON CONFLICT(key) DO UPDATE SET expires_at = excluded.expires_at
                "#,
            )
            .bind(key)
            .bind(expires_at)
            .bind(key)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn list_push(&self, key: &str, value: &str) -> Result<usize> {
        self.purge_expired(key).await?;

        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT INTO list_items (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(value)
            .execute(&mut *tx)
            .await?;
        let len: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM list_items WHERE key = ?")
            .bind(key)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(len as usize)
    }

    async fn list_len(&self, key: &str) -> Result<usize> {
        self.purge_expired(key).await?;

        let len: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM list_items WHERE key = ?")
            .bind(key)
            .fetch_one(&self.pool)
            .await?;
        Ok(len as usize)
    }

    async fn list_range(&self, key: &str, start: usize, end: usize) -> Result<Vec<String>> {
        if start >= end {
            return Ok(Vec::new());
        }
        self.purge_expired(key).await?;

        let values = sqlx::query_scalar::<_, String>(
            "SELECT value FROM list_items WHERE key = ? ORDER BY id LIMIT ? OFFSET ?",
        )
        .bind(key)
        // -1 is SQLite's "no limit"
        .bind(i64::try_from(end - start).unwrap_or(-1))
        .bind(start as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(values)
    }

    async fn list_drain(&self, key: &str) -> Result<Vec<String>> {
        self.purge_expired(key).await?;

        let mut tx = self.pool.begin().await?;
        // Single statement: a concurrent push lands either before (drained) or after (kept)
        let mut rows = sqlx::query_as::<_, (i64, String)>(
            "DELETE FROM list_items WHERE key = ? RETURNING id, value",
        )
        .bind(key)
        .fetch_all(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM list_expiry WHERE key = ?")
            .bind(key)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        rows.sort_by_key(|(id, _)| *id);
        Ok(rows.into_iter().map(|(_, value)| value).collect())
    }

    async fn stream_append(&self, stream: &str, fields: &[(String, String)]) -> Result<String> {
        let created_ms = now_millis();
        let encoded = serde_json::to_string(fields)?;

        let id: i64 = sqlx::query_scalar(
            "INSERT INTO stream_entries (stream, created_ms, fields) VALUES (?, ?, ?) RETURNING id",
        )
        .bind(stream)
        .bind(created_ms)
        .bind(&encoded)
        .fetch_one(&self.pool)
        .await?;

        Ok(format!("{}-{}", created_ms, id))
    }

    async fn stream_range(&self, stream: &str) -> Result<Vec<StreamEntry>> {
        let rows = sqlx::query_as::<_, (i64, i64, String)>(
            "SELECT id, created_ms, fields FROM stream_entries WHERE stream = ? ORDER BY id",
        )
        .bind(stream)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(id, created_ms, fields)| {
                Ok(StreamEntry {
                    id: format!("{}-{}", created_ms, id),
                    fields: serde_json::from_str(&fields)?,
                })
            })
            .collect()
    }
}
