//! Durable ingestion state for paperwatch.
//!
//! One SQLite database holds everything the ingestion worker needs to resume
//! after a restart:
//!
//! - `files`: last observed fingerprint per path
//! - `zotero_attachment`: resolved bindings (path → library attachment)
//! - `pending`: the retry queue for unresolved paths
//! - `directory_state`: aggregated mtime stamps used to skip untouched subtrees
//! - `meta`: schema version and bookkeeping
//!
//! # Usage
//!
//! ```rust,ignore
//! use paperwatch_db::StateDb;
//!
//! // The ingestion worker owns the only writer.
//! let db = StateDb::open("~/.paperwatch/paperwatch.sqlite3").await?;
//!
//! // Inspection commands open their own read-only handle.
//! let reader = StateDb::open_read_only("~/.paperwatch/paperwatch.sqlite3").await?;
//! let status = reader.status(None).await?;
//! ```

mod error;
mod schema;
mod types;

// Method implementations organized by table
mod attachments;
mod directories;
mod files;
mod meta;
mod pending;

pub use error::{DbError, Result};
pub use meta::META_LAST_FULL_SCAN_AT;
pub use schema::SCHEMA_VERSION;
pub use types::*;

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use std::path::Path;
use tracing::info;

/// Database access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Exclusive writer used by the ingestion worker
    ReadWrite,
    /// Short-lived inspection queries
    ReadOnly,
}

/// Handle to the ingestion state database.
///
/// A `ReadWrite` handle is backed by a single-connection pool, so every write
/// is serialized through one connection. `ReadOnly` handles use a separate
/// pool and never block the writer for longer than one query (WAL mode).
#[derive(Clone)]
pub struct StateDb {
    pool: SqlitePool,
    access_mode: AccessMode,
}

impl std::fmt::Debug for StateDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateDb")
            .field("backend", &"SQLite")
            .field("access_mode", &self.access_mode)
            .finish()
    }
}

impl StateDb {
    /// Open or create the database at the given path as the exclusive writer.
    ///
    /// Creates all tables if they don't exist.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let url = format!("sqlite:{}?mode=rwc", path.display());

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(&url)
            .await?;

        let db = Self {
            pool,
            access_mode: AccessMode::ReadWrite,
        };
        db.ensure_schema().await?;

        info!(path = %path.display(), "State database opened");

        Ok(db)
    }

    /// Open an existing database for inspection (fails if not exists).
    pub async fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(DbError::not_found(format!(
                "Database not found: {}",
                path.display()
            )));
        }

        let url = format!("sqlite:{}?mode=ro", path.display());

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect(&url)
            .await?;

        let db = Self {
            pool,
            access_mode: AccessMode::ReadOnly,
        };
        db.check_schema_version().await?;

        Ok(db)
    }

    /// Open a private in-memory database (tests and dry runs).
    pub async fn open_in_memory() -> Result<Self> {
        // The single connection must never be recycled or the data goes with it.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        let db = Self {
            pool,
            access_mode: AccessMode::ReadWrite,
        };
        db.ensure_schema().await?;
        Ok(db)
    }

    /// Access mode this handle was opened with.
    pub fn access_mode(&self) -> AccessMode {
        self.access_mode
    }

    /// Get the underlying connection pool (escape hatch for complex queries).
    ///
    /// Prefer using the typed methods instead.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the database connection.
    pub async fn close(self) {
        self.pool.close().await;
    }

    pub(crate) fn require_write(&self) -> Result<()> {
        match self.access_mode {
            AccessMode::ReadWrite => Ok(()),
            AccessMode::ReadOnly => Err(DbError::ReadOnly),
        }
    }
}

// Timestamp utilities
impl StateDb {
    /// Current time as milliseconds since Unix epoch.
    pub fn now_millis() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    /// Convert milliseconds to DateTime.
    pub fn millis_to_datetime(millis: i64) -> chrono::DateTime<chrono::Utc> {
        chrono::DateTime::from_timestamp_millis(millis).unwrap_or_else(chrono::Utc::now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_open_creates_database() {
        let tmp = TempDir::new().unwrap();
        let db_path = tmp.path().join("nested").join("state.db");

        let db = StateDb::open(&db_path).await.unwrap();
        assert!(db_path.exists());
        assert_eq!(db.access_mode(), AccessMode::ReadWrite);

        db.close().await;
    }

    #[tokio::test]
    async fn test_open_read_only_fails_if_not_exists() {
        let tmp = TempDir::new().unwrap();
        let db_path = tmp.path().join("nonexistent.db");

        let result = StateDb::open_read_only(&db_path).await;
        assert!(matches!(result, Err(DbError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_read_only_handle_rejects_writes() {
        let tmp = TempDir::new().unwrap();
        let db_path = tmp.path().join("state.db");

        let writer = StateDb::open(&db_path).await.unwrap();
        let reader = StateDb::open_read_only(&db_path).await.unwrap();

        let err = reader.set_meta("k", "v").await.unwrap_err();
        assert!(matches!(err, DbError::ReadOnly));

        writer.set_meta("k", "v").await.unwrap();
        assert_eq!(reader.get_meta("k").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_in_memory_survives_multiple_queries() {
        let db = StateDb::open_in_memory().await.unwrap();
        db.set_meta("a", "1").await.unwrap();
        db.set_meta("b", "2").await.unwrap();
        assert_eq!(db.get_meta("a").await.unwrap().as_deref(), Some("1"));
        assert_eq!(db.get_meta("b").await.unwrap().as_deref(), Some("2"));
    }
}
