//! Key-value bookkeeping and store-wide status.

use crate::error::Result;
use crate::types::StoreStatus;
use crate::StateDb;

/// Meta key holding the millisecond timestamp of the last completed full scan.
pub const META_LAST_FULL_SCAN_AT: &str = "last_full_scan_at";

impl StateDb {
    /// Read a meta value
    pub async fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let value = sqlx::query_scalar("SELECT value FROM meta WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    /// Insert or replace a meta value
    pub async fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.require_write()?;
        sqlx::query(
            r#"INSERT INTO meta (key, value) VALUES (?, ?)
               ON CONFLICT(key) DO UPDATE SET value = excluded.value"#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Counts across all tables.
    ///
    /// With `max_attempts` set, entries at the limit are counted as stalled
    /// and left out of `next_attempt_at`.
    pub async fn status(&self, max_attempts: Option<u32>) -> Result<StoreStatus> {
        let files: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM files")
            .fetch_one(&self.pool)
            .await?;
        let bindings: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM zotero_attachment")
            .fetch_one(&self.pool)
            .await?;
        let pending: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pending")
            .fetch_one(&self.pool)
            .await?;
        let stalled = match max_attempts {
            Some(limit) => self.count_stalled(limit).await?,
            None => 0,
        };
        let limit = max_attempts.map(i64::from);
        let next_attempt_at: Option<i64> = sqlx::query_scalar(
            "SELECT MIN(next_attempt_at) FROM pending WHERE (?1 IS NULL OR attempt_count < ?1)",
        )
        .bind(limit)
        .fetch_one(&self.pool)
        .await?;
        let last_full_scan_at = self
            .get_meta(META_LAST_FULL_SCAN_AT)
            .await?
            .and_then(|v| v.parse().ok());

        Ok(StoreStatus {
            files: files as u64,
            bindings: bindings as u64,
            pending: pending as u64,
            stalled,
            next_attempt_at,
            last_full_scan_at,
        })
    }
}
