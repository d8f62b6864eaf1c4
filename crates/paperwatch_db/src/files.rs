//! File fingerprint operations (`files` table).

use crate::attachments::row_to_binding;
use crate::error::Result;
use crate::pending::row_to_pending;
use crate::types::{FileRecord, ObservedState};
use crate::StateDb;
use sqlx::Row;

const UPSERT_FILE: &str = r#"
    INSERT INTO files (path, mtime_ns, size, sha1, last_seen_at)
    VALUES (?, ?, ?, ?, ?)
    ON CONFLICT(path) DO UPDATE SET
        mtime_ns = excluded.mtime_ns,
        size = excluded.size,
        sha1 = excluded.sha1,
        last_seen_at = excluded.last_seen_at
"#;

impl StateDb {
    /// Insert or update a file fingerprint
    pub async fn upsert_file(&self, record: &FileRecord) -> Result<()> {
        self.require_write()?;
        sqlx::query(UPSERT_FILE)
            .bind(&record.path)
            .bind(record.mtime_ns)
            .bind(record.size as i64)
            .bind(&record.sha1)
            .bind(record.last_seen_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Get a file fingerprint by path
    pub async fn get_file(&self, path: &str) -> Result<Option<FileRecord>> {
        let row = sqlx::query(
            "SELECT path, mtime_ns, size, sha1, last_seen_at FROM files WHERE path = ?",
        )
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(row_to_file))
    }

    /// Record a freshly observed fingerprint and return the path's queue state.
    ///
    /// Runs as one transaction. Bindings whose hash differs from the observed
    /// one are removed. When `content_changed` is set, any pending entry starts
    /// over (attempt_count = 0, due at `now`). A binding that still matches the
    /// content has its `last_seen_at` refreshed.
    pub async fn observe_file(
        &self,
        record: &FileRecord,
        content_changed: bool,
        now: i64,
    ) -> Result<ObservedState> {
        self.require_write()?;
        let mut tx = self.pool.begin().await?;

        sqlx::query(UPSERT_FILE)
            .bind(&record.path)
            .bind(record.mtime_ns)
            .bind(record.size as i64)
            .bind(&record.sha1)
            .bind(record.last_seen_at)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "DELETE FROM zotero_attachment WHERE file_path = ? AND (sha1 IS NULL OR sha1 IS NOT ?)",
        )
        .bind(&record.path)
        .bind(&record.sha1)
        .execute(&mut *tx)
        .await?;

        if content_changed {
            sqlx::query(
                r#"UPDATE pending SET
                    attempt_count = 0,
                    next_attempt_at = ?,
                    last_error = NULL
                WHERE file_path = ?"#,
            )
            .bind(now)
            .bind(&record.path)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            "UPDATE zotero_attachment SET last_seen_at = ? WHERE file_path = ? AND sha1 IS ?",
        )
        .bind(record.last_seen_at)
        .bind(&record.path)
        .bind(&record.sha1)
        .execute(&mut *tx)
        .await?;

        let binding = sqlx::query(
            r#"SELECT attachment_key, parent_item_key, file_path, mtime_ns, size, sha1, last_seen_at
               FROM zotero_attachment WHERE file_path = ?"#,
        )
        .bind(&record.path)
        .fetch_optional(&mut *tx)
        .await?
        .as_ref()
        .map(row_to_binding);

        let pending = sqlx::query(
            r#"SELECT file_path, first_seen_at, last_attempt_at, next_attempt_at, attempt_count, last_error
               FROM pending WHERE file_path = ?"#,
        )
        .bind(&record.path)
        .fetch_optional(&mut *tx)
        .await?
        .as_ref()
        .map(row_to_pending);

        tx.commit().await?;

        Ok(ObservedState { binding, pending })
    }
}

fn row_to_file(row: &sqlx::sqlite::SqliteRow) -> FileRecord {
    FileRecord {
        path: row.get("path"),
        mtime_ns: row.get("mtime_ns"),
        size: row.get::<i64, _>("size") as u64,
        sha1: row.get("sha1"),
        last_seen_at: row.get("last_seen_at"),
    }
}
