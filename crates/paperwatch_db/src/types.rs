//! Row types for the ingestion state tables.

use serde::{Deserialize, Serialize};

/// Last observed state of a tracked file (`files` table).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: String,
    pub mtime_ns: i64,
    pub size: u64,
    /// Hex SHA-1 of the content; `None` only for rows written before hashing
    pub sha1: Option<String>,
    pub last_seen_at: i64,
}

impl FileRecord {
    /// True when modification time and size both match.
    pub fn same_stat(&self, mtime_ns: i64, size: u64) -> bool {
        self.mtime_ns == mtime_ns && self.size == size
    }
}

/// A file bound to a library attachment (`zotero_attachment` table).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentBinding {
    pub attachment_key: String,
    pub parent_item_key: String,
    pub file_path: String,
    pub mtime_ns: i64,
    pub size: u64,
    pub sha1: Option<String>,
    pub last_seen_at: i64,
}

/// Result of trying to bind a path to an attachment key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindOutcome {
    /// The path now holds the key
    Bound,
    /// The key is held by another path; nothing was written
    Conflict(AttachmentBinding),
}

/// An unresolved path waiting for another attempt (`pending` table).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingEntry {
    pub file_path: String,
    pub first_seen_at: i64,
    pub last_attempt_at: Option<i64>,
    pub next_attempt_at: i64,
    pub attempt_count: u32,
    pub last_error: Option<String>,
}

impl PendingEntry {
    /// Whether the entry's scheduled time has been reached.
    pub fn is_due(&self, now: i64) -> bool {
        self.next_attempt_at <= now
    }
}

/// Aggregated modification marker for a directory subtree (`directory_state` table).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryStamp {
    pub dir_path: String,
    pub aggregated_mtime_ns: i64,
    pub last_seen_at: i64,
}

/// What the store knows about a path right after its fingerprint was recorded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObservedState {
    /// Binding still valid for the observed content, if any
    pub binding: Option<AttachmentBinding>,
    /// Retry queue entry for the path, if any
    pub pending: Option<PendingEntry>,
}

/// Counts for status/inspection output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStatus {
    pub files: u64,
    pub bindings: u64,
    pub pending: u64,
    /// Pending entries at or beyond the attempt limit (0 when no limit)
    pub stalled: u64,
    /// Earliest scheduled retry among non-stalled entries
    pub next_attempt_at: Option<i64>,
    pub last_full_scan_at: Option<i64>,
}
