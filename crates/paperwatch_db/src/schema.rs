//! Database schema creation for the ingestion state tables.
//!
//! All CREATE TABLE statements live here - single source of truth.

use crate::error::{DbError, Result};
use crate::StateDb;
use tracing::{debug, info};

/// Version written to `meta.schema_version` by this build.
pub const SCHEMA_VERSION: i64 = 1;

pub(crate) const META_SCHEMA_VERSION: &str = "schema_version";

impl StateDb {
    /// Ensure all tables exist and stamp the schema version.
    pub(crate) async fn ensure_schema(&self) -> Result<()> {
        // WAL lets read-only handles query while the worker writes
        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&self.pool)
            .await?;
        sqlx::query("PRAGMA synchronous=NORMAL")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        self.check_schema_version().await?;

        self.create_file_tables().await?;
        self.create_queue_tables().await?;

        sqlx::query(
            r#"INSERT INTO meta (key, value) VALUES (?, ?)
               ON CONFLICT(key) DO UPDATE SET value = excluded.value"#,
        )
        .bind(META_SCHEMA_VERSION)
        .bind(SCHEMA_VERSION.to_string())
        .execute(&self.pool)
        .await?;

        info!(version = SCHEMA_VERSION, "State schema verified");
        Ok(())
    }

    /// Reject databases written by a newer schema.
    pub(crate) async fn check_schema_version(&self) -> Result<()> {
        let stored: Option<String> = sqlx::query_scalar("SELECT value FROM meta WHERE key = ?")
            .bind(META_SCHEMA_VERSION)
            .fetch_optional(&self.pool)
            .await
            .or_else(|e| match e {
                // Fresh read-only handle on a database without meta yet
                sqlx::Error::Database(db_err) if db_err.message().contains("no such table") => {
                    Ok(None)
                }
                other => Err(other),
            })?;

        let Some(stored) = stored else {
            debug!("No schema version recorded yet");
            return Ok(());
        };

        let version: i64 = stored.parse().map_err(|_| {
            DbError::invalid_state(format!("Unreadable schema version '{}'", stored))
        })?;
        if version > SCHEMA_VERSION {
            return Err(DbError::invalid_state(format!(
                "Database schema version {} is newer than supported version {}",
                version, SCHEMA_VERSION
            )));
        }
        Ok(())
    }

    /// Files and directory stamps (change detection)
    async fn create_file_tables(&self) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS files (
                path TEXT PRIMARY KEY,
                mtime_ns INTEGER NOT NULL,
                size INTEGER NOT NULL,
                sha1 TEXT,
                last_seen_at INTEGER NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS directory_state (
                dir_path TEXT PRIMARY KEY,
                aggregated_mtime_ns INTEGER NOT NULL,
                last_seen_at INTEGER NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_files_last_seen_at ON files(last_seen_at)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Resolved bindings and the retry queue
    async fn create_queue_tables(&self) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS zotero_attachment (
                attachment_key TEXT PRIMARY KEY,
                parent_item_key TEXT NOT NULL,
                file_path TEXT NOT NULL UNIQUE,
                mtime_ns INTEGER NOT NULL,
                size INTEGER NOT NULL,
                sha1 TEXT,
                last_seen_at INTEGER NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS pending (
                file_path TEXT PRIMARY KEY,
                first_seen_at INTEGER NOT NULL,
                last_attempt_at INTEGER,
                next_attempt_at INTEGER NOT NULL,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_zotero_attachment_last_seen_at ON zotero_attachment(last_seen_at)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_zotero_attachment_parent ON zotero_attachment(parent_item_key)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_pending_next_attempt_at ON pending(next_attempt_at)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
