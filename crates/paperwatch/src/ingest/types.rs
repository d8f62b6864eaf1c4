//! Events, work items and pass summaries for the ingestion engine

use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// A local file matched to a library attachment.
///
/// Emitted once per distinct (path, content hash).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedItem {
    pub path: PathBuf,
    pub attachment_id: String,
    pub parent_item_id: String,
    pub content_hash: String,
}

/// Downstream notification produced while processing paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum IngestEvent {
    Resolved(ResolvedItem),
    Pending {
        path: PathBuf,
        attempt_count: u32,
        /// Unix milliseconds
        next_attempt_at: i64,
        reason: String,
    },
    /// The entry hit the configured attempt limit and waits for force or a content change
    Stalled { path: PathBuf, attempt_count: u32 },
}

/// One unit of work for the single ingestion worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkItem {
    /// A watched file changed (already debounced)
    Changed(PathBuf),
    /// Periodic poll of the retry queue
    RetryDue,
}

/// Why a path is being processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Full traversal
    Scan,
    /// Supplied by the caller
    Explicit,
    /// Live filesystem notification
    Changed,
    /// Selected from the retry queue
    Retry,
}

/// What happened to one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathOutcome {
    /// Newly bound to an attachment
    Resolved,
    /// Binding already covers this content
    AlreadyResolved,
    /// Resolution failed; retry scheduled
    Pending,
    /// Pending entry not due yet
    Deferred,
    /// Pending entry at the attempt limit
    Stalled,
    /// File disappeared before it could be processed
    Missing,
    /// Filesystem error, recorded in the summary
    Failed,
}

/// A per-file error collected during a pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanFailure {
    pub path: String,
    pub message: String,
}

/// Counters for one scan pass (or a whole watch session).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanSummary {
    pub files_seen: u64,
    pub fingerprinted: u64,
    /// Files whose content hash was (re)computed
    pub hashed: u64,
    /// Files already bound for their current content
    pub unchanged: u64,
    pub resolved: u64,
    pub pending: u64,
    /// Pending entries skipped because their retry is not due
    pub deferred: u64,
    pub stalled: u64,
    /// Subtrees skipped by directory stamps
    pub dirs_skipped: u64,
    pub failures: Vec<ScanFailure>,
    /// Paths that went to the retry queue during this pass
    #[serde(skip)]
    pub pending_paths: Vec<String>,
}

impl ScanSummary {
    pub(crate) fn fail(&mut self, path: &Path, message: impl Into<String>) {
        self.failures.push(ScanFailure {
            path: path.display().to_string(),
            message: message.into(),
        });
    }

    /// Fold another pass into this one.
    pub fn merge(&mut self, other: ScanSummary) {
        self.files_seen += other.files_seen;
        self.fingerprinted += other.fingerprinted;
        self.hashed += other.hashed;
        self.unchanged += other.unchanged;
        self.resolved += other.resolved;
        self.pending += other.pending;
        self.deferred += other.deferred;
        self.stalled += other.stalled;
        self.dirs_skipped += other.dirs_skipped;
        self.failures.extend(other.failures);
        self.pending_paths.extend(other.pending_paths);
    }

    /// True when the pass neither changed state nor hit errors.
    pub fn is_quiet(&self) -> bool {
        self.resolved == 0 && self.pending == 0 && self.stalled == 0 && self.failures.is_empty()
    }

    /// Emit the end-of-pass log line, plus one warning per failure.
    pub fn log(&self, label: &str) {
        info!(
            pass = label,
            files_seen = self.files_seen,
            hashed = self.hashed,
            unchanged = self.unchanged,
            resolved = self.resolved,
            pending = self.pending,
            deferred = self.deferred,
            stalled = self.stalled,
            dirs_skipped = self.dirs_skipped,
            failures = self.failures.len(),
            "Ingestion pass complete"
        );
        for failure in &self.failures {
            warn!(path = %failure.path, error = %failure.message, "File skipped");
        }
    }
}
