//! Retry queue operations (`pending` table).

use crate::error::Result;
use crate::types::PendingEntry;
use crate::StateDb;
use sqlx::Row;

const PENDING_COLUMNS: &str =
    "file_path, first_seen_at, last_attempt_at, next_attempt_at, attempt_count, last_error";

impl StateDb {
    /// Record a failed resolution attempt.
    ///
    /// Creates the entry on first failure and updates it afterwards, keeping
    /// `first_seen_at`. `next_attempt_at` never moves backwards for an
    /// existing entry. A path being retried has no valid binding, so any
    /// leftover binding row for it is removed in the same transaction.
    pub async fn record_failure(
        &self,
        file_path: &str,
        attempt_count: u32,
        now: i64,
        next_attempt_at: i64,
        error: &str,
    ) -> Result<PendingEntry> {
        self.require_write()?;
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM zotero_attachment WHERE file_path = ?")
            .bind(file_path)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO pending (file_path, first_seen_at, last_attempt_at, next_attempt_at, attempt_count, last_error)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(file_path) DO UPDATE SET
                last_attempt_at = excluded.last_attempt_at,
                next_attempt_at = MAX(pending.next_attempt_at, excluded.next_attempt_at),
                attempt_count = excluded.attempt_count,
                last_error = excluded.last_error
            "#,
        )
        .bind(file_path)
        .bind(now)
        .bind(now)
        .bind(next_attempt_at)
        .bind(i64::from(attempt_count))
        .bind(error)
        .execute(&mut *tx)
        .await?;

        let sql = format!("SELECT {PENDING_COLUMNS} FROM pending WHERE file_path = ?");
        let row = sqlx::query(&sql)
            .bind(file_path)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(row_to_pending(&row))
    }

    /// Get the pending entry for a path
    pub async fn get_pending(&self, file_path: &str) -> Result<Option<PendingEntry>> {
        let sql = format!("SELECT {PENDING_COLUMNS} FROM pending WHERE file_path = ?");
        let row = sqlx::query(&sql)
            .bind(file_path)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_pending))
    }

    /// Remove a path from the queue
    pub async fn delete_pending(&self, file_path: &str) -> Result<bool> {
        self.require_write()?;
        let result = sqlx::query("DELETE FROM pending WHERE file_path = ?")
            .bind(file_path)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Entries whose `next_attempt_at` has passed, oldest schedule first.
    ///
    /// Entries with `attempt_count >= max_attempts` are stalled and left out.
    pub async fn due_pending(
        &self,
        now: i64,
        limit: u32,
        max_attempts: Option<u32>,
    ) -> Result<Vec<PendingEntry>> {
        let sql = format!(
            r#"SELECT {PENDING_COLUMNS} FROM pending
               WHERE next_attempt_at <= ?1 AND (?2 IS NULL OR attempt_count < ?2)
               ORDER BY next_attempt_at ASC, file_path ASC
               LIMIT ?3"#
        );
        let rows = sqlx::query(&sql)
            .bind(now)
            .bind(max_attempts.map(i64::from))
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(row_to_pending).collect())
    }

    /// Every entry regardless of schedule or attempt count, oldest schedule first
    pub async fn all_pending(&self, limit: u32) -> Result<Vec<PendingEntry>> {
        let sql = format!(
            "SELECT {PENDING_COLUMNS} FROM pending ORDER BY next_attempt_at ASC, file_path ASC LIMIT ?"
        );
        let rows = sqlx::query(&sql)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(row_to_pending).collect())
    }

    /// Total number of queued paths
    pub async fn count_pending(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pending")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    /// Number of entries that reached the attempt limit
    pub async fn count_stalled(&self, max_attempts: u32) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pending WHERE attempt_count >= ?")
            .bind(i64::from(max_attempts))
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}

pub(crate) fn row_to_pending(row: &sqlx::sqlite::SqliteRow) -> PendingEntry {
    PendingEntry {
        file_path: row.get("file_path"),
        first_seen_at: row.get("first_seen_at"),
        last_attempt_at: row.get("last_attempt_at"),
        next_attempt_at: row.get("next_attempt_at"),
        attempt_count: row.get::<i64, _>("attempt_count").max(0) as u32,
        last_error: row.get("last_error"),
    }
}
