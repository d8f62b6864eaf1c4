//! Directory stamp operations (`directory_state` table).

use crate::error::Result;
use crate::types::DirectoryStamp;
use crate::StateDb;
use sqlx::Row;

impl StateDb {
    /// Get the stored stamp for one directory
    pub async fn get_dir_stamp(&self, dir_path: &str) -> Result<Option<DirectoryStamp>> {
        let row = sqlx::query(
            "SELECT dir_path, aggregated_mtime_ns, last_seen_at FROM directory_state WHERE dir_path = ?",
        )
        .bind(dir_path)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(row_to_stamp))
    }

    /// All stored stamps, for preloading before a traversal
    pub async fn list_dir_stamps(&self) -> Result<Vec<DirectoryStamp>> {
        let rows = sqlx::query(
            "SELECT dir_path, aggregated_mtime_ns, last_seen_at FROM directory_state ORDER BY dir_path",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_stamp).collect())
    }

    /// Write a batch of stamps in one transaction.
    ///
    /// The fresh aggregate replaces the stored one even when it is older, so a
    /// directory whose mtime moved backwards is skipped again on the next pass.
    pub async fn upsert_dir_stamps(&self, stamps: &[DirectoryStamp]) -> Result<()> {
        self.require_write()?;
        if stamps.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for stamp in stamps {
            sqlx::query(
                r#"
                INSERT INTO directory_state (dir_path, aggregated_mtime_ns, last_seen_at)
                VALUES (?, ?, ?)
                ON CONFLICT(dir_path) DO UPDATE SET
                    aggregated_mtime_ns = excluded.aggregated_mtime_ns,
                    last_seen_at = excluded.last_seen_at
                "#,
            )
            .bind(&stamp.dir_path)
            .bind(stamp.aggregated_mtime_ns)
            .bind(stamp.last_seen_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

fn row_to_stamp(row: &sqlx::sqlite::SqliteRow) -> DirectoryStamp {
    DirectoryStamp {
        dir_path: row.get("dir_path"),
        aggregated_mtime_ns: row.get("aggregated_mtime_ns"),
        last_seen_at: row.get("last_seen_at"),
    }
}
