//! Resolved binding operations (`zotero_attachment` table).

use crate::error::Result;
use crate::types::{AttachmentBinding, BindOutcome};
use crate::StateDb;
use sqlx::Row;

const BINDING_COLUMNS: &str =
    "attachment_key, parent_item_key, file_path, mtime_ns, size, sha1, last_seen_at";

impl StateDb {
    /// Bind a path to a library attachment after a successful resolution.
    ///
    /// One transaction: any other binding for the same path is superseded,
    /// the binding is upserted by attachment key, and the path leaves the
    /// pending queue. A key already held by a different path is left alone
    /// and reported as [`BindOutcome::Conflict`].
    pub async fn record_resolution(&self, binding: &AttachmentBinding) -> Result<BindOutcome> {
        self.require_write()?;
        let mut tx = self.pool.begin().await?;

        let sql = format!("SELECT {BINDING_COLUMNS} FROM zotero_attachment WHERE attachment_key = ?");
        let holder = sqlx::query(&sql)
            .bind(&binding.attachment_key)
            .fetch_optional(&mut *tx)
            .await?
            .as_ref()
            .map(row_to_binding);
        if let Some(holder) = holder {
            if holder.file_path != binding.file_path {
                tx.rollback().await?;
                return Ok(BindOutcome::Conflict(holder));
            }
        }

        bind_in_tx(&mut tx, binding).await?;
        tx.commit().await?;
        Ok(BindOutcome::Bound)
    }

    /// Move an attachment key to `binding.file_path`, whoever held it before.
    ///
    /// Used when the previous holder's file no longer exists.
    pub async fn transfer_binding(&self, binding: &AttachmentBinding) -> Result<()> {
        self.require_write()?;
        let mut tx = self.pool.begin().await?;
        bind_in_tx(&mut tx, binding).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Get a binding by attachment key
    pub async fn get_binding(&self, attachment_key: &str) -> Result<Option<AttachmentBinding>> {
        let sql = format!("SELECT {BINDING_COLUMNS} FROM zotero_attachment WHERE attachment_key = ?");
        let row = sqlx::query(&sql)
            .bind(attachment_key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_binding))
    }

    /// Get the active binding for a path
    pub async fn binding_for_path(&self, file_path: &str) -> Result<Option<AttachmentBinding>> {
        let sql = format!("SELECT {BINDING_COLUMNS} FROM zotero_attachment WHERE file_path = ?");
        let row = sqlx::query(&sql)
            .bind(file_path)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_binding))
    }

    /// List bindings attached to one library item
    pub async fn bindings_for_parent(
        &self,
        parent_item_key: &str,
    ) -> Result<Vec<AttachmentBinding>> {
        let sql = format!(
            "SELECT {BINDING_COLUMNS} FROM zotero_attachment WHERE parent_item_key = ? ORDER BY file_path"
        );
        let rows = sqlx::query(&sql)
            .bind(parent_item_key)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(row_to_binding).collect())
    }
}

async fn bind_in_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    binding: &AttachmentBinding,
) -> Result<()> {
    sqlx::query("DELETE FROM zotero_attachment WHERE file_path = ? AND attachment_key != ?")
        .bind(&binding.file_path)
        .bind(&binding.attachment_key)
        .execute(&mut **tx)
        .await?;

    sqlx::query(
        r#"
        INSERT INTO zotero_attachment (attachment_key, parent_item_key, file_path, mtime_ns, size, sha1, last_seen_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(attachment_key) DO UPDATE SET
            parent_item_key = excluded.parent_item_key,
            file_path = excluded.file_path,
            mtime_ns = excluded.mtime_ns,
            size = excluded.size,
            sha1 = excluded.sha1,
            last_seen_at = excluded.last_seen_at
        "#,
    )
    .bind(&binding.attachment_key)
    .bind(&binding.parent_item_key)
    .bind(&binding.file_path)
    .bind(binding.mtime_ns)
    .bind(binding.size as i64)
    .bind(&binding.sha1)
    .bind(binding.last_seen_at)
    .execute(&mut **tx)
    .await?;

    sqlx::query("DELETE FROM pending WHERE file_path = ?")
        .bind(&binding.file_path)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

pub(crate) fn row_to_binding(row: &sqlx::sqlite::SqliteRow) -> AttachmentBinding {
    AttachmentBinding {
        attachment_key: row.get("attachment_key"),
        parent_item_key: row.get("parent_item_key"),
        file_path: row.get("file_path"),
        mtime_ns: row.get("mtime_ns"),
        size: row.get::<i64, _>("size") as u64,
        sha1: row.get("sha1"),
        last_seen_at: row.get("last_seen_at"),
    }
}
