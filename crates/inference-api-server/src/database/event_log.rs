use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::info;

/// Append-only persistent mirror of emitted events. A superset of every
/// session's history until its own time-based GC, enabling resume across
/// buffer eviction and process restarts. Strictly best-effort: callers log
/// and ignore every error, the in-memory buffer stays authoritative.
pub struct EventLog {
    pool: SqlitePool,
}

impl EventLog {
    pub async fn connect(path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let log = Self::with_options(options).await?;
        info!("Durable event log ready at {}", path);
        Ok(log)
    }

    pub async fn in_memory() -> Result<Self> {
        Self::with_options(SqliteConnectOptions::from_str("sqlite::memory:")?).await
    }

    async fn with_options(options: SqliteConnectOptions) -> Result<Self> {
        // Single connection keeps a single-writer discipline and makes the
        // in-memory database shared across all calls.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sessions (
                session_id TEXT PRIMARY KEY,
                created INTEGER NOT NULL,
                finished INTEGER NOT NULL DEFAULT 0
            )",
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS events (
                session_id TEXT NOT NULL,
                idx INTEGER NOT NULL,
                data TEXT NOT NULL,
                created INTEGER NOT NULL,
                PRIMARY KEY (session_id, idx)
            )",
        )
        .execute(&pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_session ON events(session_id, idx)")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    /// Idempotent: re-registering an existing session keeps its original row.
    pub async fn ensure_session(&self, session_id: &str, created: i64) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO sessions (session_id, created, finished) VALUES (?, ?, 0)")
            .bind(session_id)
            .bind(created)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Idempotent upsert keyed by (session_id, idx); retries are safe.
    pub async fn append_event(&self, session_id: &str, idx: i64, data: &str) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO events (session_id, idx, data, created) VALUES (?, ?, ?, ?)",
        )
        .bind(session_id)
        .bind(idx)
        .bind(data)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn events_after(&self, session_id: &str, last_idx: i64) -> Result<Vec<(i64, String)>> {
        let rows = sqlx::query(
            "SELECT idx, data FROM events WHERE session_id = ? AND idx > ? ORDER BY idx ASC",
        )
        .bind(session_id)
        .bind(last_idx)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| (row.get::<i64, _>(0), row.get::<String, _>(1)))
            .collect())
    }

    pub async fn mark_finished(&self, session_id: &str) -> Result<()> {
        sqlx::query("UPDATE sessions SET finished = 1 WHERE session_id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Delete finished sessions older than the TTL, cascading their events.
    pub async fn gc(&self, ttl: Duration) -> Result<()> {
        let cutoff = chrono::Utc::now().timestamp() - ttl.as_secs() as i64;
        sqlx::query(
            "DELETE FROM events WHERE session_id IN
                (SELECT session_id FROM sessions WHERE finished = 1 AND created < ?)",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        sqlx::query("DELETE FROM sessions WHERE finished = 1 AND created < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
