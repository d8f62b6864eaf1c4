//! The ingestion worker: one-shot scans, explicit paths, and watch mode
//!
//! Per-path lifecycle:
//!
//! ```text
//! Unseen -> Detected -> Resolving -> Resolved
//!                                 -> Pending -> Resolving (on retry)
//! Resolved | Pending --(content hash changes)--> Detected
//! ```
//!
//! Everything runs on one logical worker. Each path is fingerprinted,
//! resolved, and persisted before the next one is taken, and every store
//! write is a single transaction.

use super::config::PaperwatchConfig;
use super::dir_stamp::{DirectoryStampCache, TraversalOptions};
use super::error::{IngestError, Result};
use super::fingerprint::fingerprint;
use super::path_key;
use super::resolver::{AttachmentResolver, Resolution};
use super::retry::{Clock, RetryPolicy, RetryScheduler, SystemClock};
use super::types::{IngestEvent, PathOutcome, ResolvedItem, ScanSummary, Trigger, WorkItem};
use super::watcher::FsWatcher;
use paperwatch_db::{
    AttachmentBinding, BindOutcome, FileRecord, PendingEntry, StateDb, META_LAST_FULL_SCAN_AT,
};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Drives the store, resolver and scheduler for one watched tree.
pub struct Ingestor {
    db: StateDb,
    resolver: Arc<dyn AttachmentResolver>,
    scheduler: RetryScheduler,
    traversal: TraversalOptions,
    debounce: Duration,
    poll_interval: Duration,
    events: Option<mpsc::UnboundedSender<IngestEvent>>,
}

impl Ingestor {
    /// Build from configuration with the system clock.
    pub fn new(
        db: StateDb,
        resolver: Arc<dyn AttachmentResolver>,
        config: &PaperwatchConfig,
    ) -> Result<Self> {
        let traversal = TraversalOptions {
            root: config.watch_dir.clone(),
            matcher: config.scan.matcher()?,
            recursive: config.scan.recursive,
            follow_symlinks: config.scan.follow_symlinks,
        };
        Ok(Self {
            db,
            resolver,
            scheduler: RetryScheduler::new(RetryPolicy::from(&config.retry), Arc::new(SystemClock)),
            traversal,
            debounce: config.watch.debounce(),
            poll_interval: config.retry.poll_interval(),
            events: None,
        })
    }

    /// Replace the clock (tests drive time by hand).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.scheduler = RetryScheduler::new(self.scheduler.policy().clone(), clock);
        self
    }

    /// Send downstream events to `tx`.
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<IngestEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn db(&self) -> &StateDb {
        &self.db
    }

    pub fn scheduler(&self) -> &RetryScheduler {
        &self.scheduler
    }

    async fn canonical_root(&self) -> Result<PathBuf> {
        let root = &self.traversal.root;
        let canonical = tokio::fs::canonicalize(root).await.map_err(|e| {
            IngestError::invalid_path(format!("watch directory {}: {}", root.display(), e))
        })?;
        if !tokio::fs::metadata(&canonical).await?.is_dir() {
            return Err(IngestError::invalid_path(format!(
                "watch directory {} is not a directory",
                canonical.display()
            )));
        }
        Ok(canonical)
    }

    /// Full traversal of the watched tree followed by a retry pass.
    ///
    /// `force` disables directory-stamp skipping and retries every pending
    /// entry regardless of schedule or attempt count.
    pub async fn scan_once(&self, force: bool) -> Result<ScanSummary> {
        let root = self.canonical_root().await?;
        info!(root = %root.display(), force, "Starting scan");

        let cache = DirectoryStampCache::load(&self.db).await?;
        let opts = TraversalOptions {
            root: root.clone(),
            ..self.traversal.clone()
        };
        let plan = tokio::task::spawn_blocking(move || cache.plan(&opts, force)).await?;

        let mut summary = ScanSummary {
            dirs_skipped: plan.dirs_skipped,
            failures: plan.failures.clone(),
            ..Default::default()
        };
        debug!(
            candidates = plan.candidates.len(),
            dirs_visited = plan.dirs_visited,
            dirs_skipped = plan.dirs_skipped,
            "Traversal planned"
        );

        let mut processed: HashSet<String> = HashSet::new();
        let mut failed: Vec<PathBuf> = Vec::new();
        for path in &plan.candidates {
            let outcome = self
                .process_path(path, Trigger::Scan, force, &mut summary)
                .await?;
            if matches!(outcome, PathOutcome::Failed | PathOutcome::Missing) {
                failed.push(path.clone());
            }
            processed.insert(path_key(path));
        }

        let now = self.scheduler.now();
        self.db.upsert_dir_stamps(&plan.stamps(&failed, now)).await?;

        self.retry_pass(force, &processed, &mut summary).await?;

        self.db
            .set_meta(META_LAST_FULL_SCAN_AT, &self.scheduler.now().to_string())
            .await?;
        summary.log("scan");
        Ok(summary)
    }

    /// Process exactly the given files.
    ///
    /// Directory stamps are not consulted; hash reuse and backoff still apply.
    pub async fn scan_paths(&self, paths: &[PathBuf]) -> Result<ScanSummary> {
        let mut summary = ScanSummary::default();
        for path in paths {
            let path = match tokio::fs::canonicalize(path).await {
                Ok(p) => p,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Cannot resolve path");
                    summary.files_seen += 1;
                    summary.fail(path, e.to_string());
                    continue;
                }
            };
            self.process_path(&path, Trigger::Explicit, false, &mut summary)
                .await?;
        }
        summary.log("paths");
        Ok(summary)
    }

    /// Attempt due pending entries (all of them with `force`).
    pub async fn retry_due(&self, force: bool) -> Result<ScanSummary> {
        let mut summary = ScanSummary::default();
        self.retry_pass(force, &HashSet::new(), &mut summary).await?;
        Ok(summary)
    }

    async fn retry_pass(
        &self,
        force: bool,
        already_processed: &HashSet<String>,
        summary: &mut ScanSummary,
    ) -> Result<()> {
        let due = self.scheduler.due(&self.db, force).await?;
        let due: Vec<PendingEntry> = due
            .into_iter()
            .filter(|e| !already_processed.contains(&e.file_path))
            .collect();
        if due.is_empty() {
            return Ok(());
        }
        info!(count = due.len(), force, "Retrying pending entries");

        for entry in due {
            let path = PathBuf::from(&entry.file_path);
            self.process_path(&path, Trigger::Retry, force, summary)
                .await?;
        }
        Ok(())
    }

    /// Initial scan, then process notifications and retry polls until cancelled.
    ///
    /// Cancellation is observed between work items only.
    pub async fn watch(&self, force: bool, cancel: CancellationToken) -> Result<ScanSummary> {
        let mut total = self.scan_once(force).await?;
        let root = self.canonical_root().await?;

        let (work_tx, mut work_rx) = mpsc::unbounded_channel::<WorkItem>();
        let watcher = FsWatcher::start(
            &root,
            self.traversal.matcher.clone(),
            self.traversal.recursive,
            self.debounce,
            work_tx.clone(),
            cancel.clone(),
        )?;

        let ticker_cancel = cancel.clone();
        let poll_interval = self.poll_interval;
        let ticker = tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // First tick completes immediately; the initial scan already retried
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = ticker_cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if work_tx.send(WorkItem::RetryDue).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        info!(root = %root.display(), "Watching for changes");
        let result = self.drain(&mut work_rx, &cancel, &mut total).await;

        ticker.abort();
        watcher.stop();
        result?;

        info!("Watch stopped");
        total.log("watch");
        Ok(total)
    }

    /// Single-worker loop over the merged queue.
    pub async fn drain(
        &self,
        work_rx: &mut mpsc::UnboundedReceiver<WorkItem>,
        cancel: &CancellationToken,
        total: &mut ScanSummary,
    ) -> Result<()> {
        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                item = work_rx.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };

            let mut summary = ScanSummary::default();
            match item {
                WorkItem::Changed(path) => {
                    self.process_path(&path, Trigger::Changed, false, &mut summary)
                        .await?;
                }
                WorkItem::RetryDue => {
                    self.retry_pass(false, &HashSet::new(), &mut summary).await?;
                }
            }
            if !summary.is_quiet() {
                summary.log("event");
            }
            total.merge(summary);
        }
        Ok(())
    }

    /// Fingerprint, resolve and persist one path.
    ///
    /// Filesystem problems are recorded in `summary`; only store errors are
    /// returned.
    pub async fn process_path(
        &self,
        path: &Path,
        trigger: Trigger,
        force: bool,
        summary: &mut ScanSummary,
    ) -> Result<PathOutcome> {
        let key = path_key(path);
        let now = self.scheduler.now();
        summary.files_seen += 1;

        let previous = self.db.get_file(&key).await?;
        let fp = match fingerprint(path, previous.clone()).await {
            Ok(fp) => fp,
            Err(err) if err.is_not_found() => return self.handle_missing(path, &key, trigger, now, summary).await,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "Cannot fingerprint file");
                summary.fail(path, err.to_string());
                return Ok(PathOutcome::Failed);
            }
        };

        summary.fingerprinted += 1;
        if fp.rehashed {
            summary.hashed += 1;
        }

        let content_changed = previous
            .as_ref()
            .and_then(|p| p.sha1.as_deref())
            .map_or(true, |old| old != fp.sha1);

        let record = FileRecord {
            path: key.clone(),
            mtime_ns: fp.mtime_ns,
            size: fp.size,
            sha1: Some(fp.sha1.clone()),
            last_seen_at: now,
        };
        let observed = self.db.observe_file(&record, content_changed, now).await?;

        if let Some(binding) = &observed.binding {
            debug!(path = %path.display(), attachment = %binding.attachment_key, "Already resolved");
            summary.unchanged += 1;
            return Ok(PathOutcome::AlreadyResolved);
        }

        let prior_attempts = match &observed.pending {
            Some(entry) => {
                if !content_changed {
                    if self.scheduler.policy().is_stalled(entry.attempt_count) && !force {
                        summary.stalled += 1;
                        return Ok(PathOutcome::Stalled);
                    }
                    let due = force || trigger == Trigger::Retry || entry.is_due(now);
                    if !due {
                        debug!(path = %path.display(), next_attempt_at = entry.next_attempt_at, "Retry not due");
                        summary.deferred += 1;
                        return Ok(PathOutcome::Deferred);
                    }
                }
                entry.attempt_count
            }
            None => 0,
        };

        match self.resolver.resolve(path, &fp.sha1).await {
            Resolution::Matched {
                attachment_id,
                parent_item_id,
            } => {
                let binding = AttachmentBinding {
                    attachment_key: attachment_id.clone(),
                    parent_item_key: parent_item_id.clone(),
                    file_path: key.clone(),
                    mtime_ns: fp.mtime_ns,
                    size: fp.size,
                    sha1: Some(fp.sha1.clone()),
                    last_seen_at: now,
                };
                if let BindOutcome::Conflict(holder) = self.db.record_resolution(&binding).await? {
                    let holder_exists = tokio::fs::try_exists(&holder.file_path)
                        .await
                        .unwrap_or(true);
                    if holder_exists {
                        debug!(
                            path = %path.display(),
                            attachment = %attachment_id,
                            holder = %holder.file_path,
                            "Attachment already bound elsewhere"
                        );
                        let reason = format!(
                            "attachment {} already bound to {}",
                            attachment_id, holder.file_path
                        );
                        return self
                            .schedule_retry(path, &key, prior_attempts + 1, now, &reason, summary)
                            .await;
                    }
                    info!(
                        path = %path.display(),
                        attachment = %attachment_id,
                        previous = %holder.file_path,
                        "Previous holder gone, moving binding"
                    );
                    self.db.transfer_binding(&binding).await?;
                }
                info!(
                    path = %path.display(),
                    attachment = %attachment_id,
                    parent = %parent_item_id,
                    "Resolved"
                );
                summary.resolved += 1;
                self.emit(IngestEvent::Resolved(ResolvedItem {
                    path: path.to_path_buf(),
                    attachment_id,
                    parent_item_id,
                    content_hash: fp.sha1,
                }));
                Ok(PathOutcome::Resolved)
            }
            Resolution::NotFound => {
                self.schedule_retry(path, &key, prior_attempts + 1, now, "attachment not found", summary)
                    .await
            }
            Resolution::TransientError(reason) => {
                self.schedule_retry(path, &key, prior_attempts + 1, now, &reason, summary)
                    .await
            }
        }
    }

    async fn handle_missing(
        &self,
        path: &Path,
        key: &str,
        trigger: Trigger,
        now: i64,
        summary: &mut ScanSummary,
    ) -> Result<PathOutcome> {
        if trigger == Trigger::Retry {
            if let Some(entry) = self.db.get_pending(key).await? {
                return self
                    .schedule_retry(path, key, entry.attempt_count + 1, now, "file not found", summary)
                    .await;
            }
        }
        if trigger == Trigger::Changed {
            debug!(path = %path.display(), "File gone before processing");
        } else {
            warn!(path = %path.display(), "File not found");
            summary.fail(path, "file not found");
        }
        Ok(PathOutcome::Missing)
    }

    async fn schedule_retry(
        &self,
        path: &Path,
        key: &str,
        attempt_count: u32,
        now: i64,
        reason: &str,
        summary: &mut ScanSummary,
    ) -> Result<PathOutcome> {
        let next_attempt_at = self.scheduler.next_attempt_at(attempt_count, key, now);
        let entry = self
            .db
            .record_failure(key, attempt_count, now, next_attempt_at, reason)
            .await?;

        if self.scheduler.policy().is_stalled(entry.attempt_count) {
            warn!(
                path = %path.display(),
                attempts = entry.attempt_count,
                error = %reason,
                "Pending entry stalled"
            );
            summary.stalled += 1;
            self.emit(IngestEvent::Stalled {
                path: path.to_path_buf(),
                attempt_count: entry.attempt_count,
            });
            return Ok(PathOutcome::Stalled);
        }

        info!(
            path = %path.display(),
            attempt = entry.attempt_count,
            next_attempt_at = entry.next_attempt_at,
            error = %reason,
            "Pending backoff"
        );
        summary.pending += 1;
        summary.pending_paths.push(key.to_string());
        self.emit(IngestEvent::Pending {
            path: path.to_path_buf(),
            attempt_count: entry.attempt_count,
            next_attempt_at: entry.next_attempt_at,
            reason: reason.to_string(),
        });
        Ok(PathOutcome::Pending)
    }

    fn emit(&self, event: IngestEvent) {
        if let Some(tx) = &self.events {
            if tx.send(event).is_err() {
                debug!("Event receiver dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::retry::ManualClock;
    use async_trait::async_trait;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Resolver answering from a fixed queue, NotFound when empty.
    #[derive(Default)]
    struct Scripted {
        answers: Mutex<Vec<Resolution>>,
        calls: Mutex<Vec<PathBuf>>,
    }

    impl Scripted {
        fn push(&self, res: Resolution) {
            self.answers.lock().unwrap().insert(0, res);
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl AttachmentResolver for Scripted {
        async fn resolve(&self, path: &Path, _hash: &str) -> Resolution {
            self.calls.lock().unwrap().push(path.to_path_buf());
            self.answers.lock().unwrap().pop().unwrap_or(Resolution::NotFound)
        }
    }

    async fn setup(tmp: &TempDir) -> (Ingestor, Arc<Scripted>, Arc<ManualClock>) {
        let mut config = PaperwatchConfig::default();
        config.watch_dir = tmp.path().to_path_buf();
        config.retry.jitter_ratio = 0.0;
        let resolver = Arc::new(Scripted::default());
        let clock = Arc::new(ManualClock::new(1_000_000));
        let db = StateDb::open_in_memory().await.unwrap();
        let ingestor = Ingestor::new(db, resolver.clone(), &config)
            .unwrap()
            .with_clock(clock.clone());
        (ingestor, resolver, clock)
    }

    #[tokio::test]
    async fn test_transient_error_goes_to_pending() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a.pdf"), b"a").unwrap();
        let (ingestor, resolver, _clock) = setup(&tmp).await;
        resolver.push(Resolution::TransientError("503".to_string()));

        let summary = ingestor.scan_once(false).await.unwrap();
        assert_eq!(summary.pending, 1);

        let key = path_key(&tmp.path().canonicalize().unwrap().join("a.pdf"));
        let entry = ingestor.db().get_pending(&key).await.unwrap().unwrap();
        assert_eq!(entry.attempt_count, 1);
        assert_eq!(entry.last_error.as_deref(), Some("503"));
        assert_eq!(entry.next_attempt_at, 1_000_000 + 5_000);
    }

    #[tokio::test]
    async fn test_deferred_until_due() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().canonicalize().unwrap().join("a.pdf");
        fs::write(&path, b"a").unwrap();
        let (ingestor, resolver, clock) = setup(&tmp).await;

        let mut summary = ScanSummary::default();
        ingestor
            .process_path(&path, Trigger::Explicit, false, &mut summary)
            .await
            .unwrap();
        let outcome = ingestor
            .process_path(&path, Trigger::Explicit, false, &mut summary)
            .await
            .unwrap();
        assert_eq!(outcome, PathOutcome::Deferred);
        assert_eq!(resolver.call_count(), 1);

        clock.advance(Duration::from_secs(5));
        let outcome = ingestor
            .process_path(&path, Trigger::Explicit, false, &mut summary)
            .await
            .unwrap();
        assert_eq!(outcome, PathOutcome::Pending);
        assert_eq!(resolver.call_count(), 2);
    }

    #[tokio::test]
    async fn test_missing_pending_file_backs_off() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().canonicalize().unwrap().join("a.pdf");
        fs::write(&path, b"a").unwrap();
        let (ingestor, _resolver, clock) = setup(&tmp).await;

        ingestor.scan_paths(&[path.clone()]).await.unwrap();
        fs::remove_file(&path).unwrap();
        clock.advance(Duration::from_secs(5));

        let summary = ingestor.retry_due(false).await.unwrap();
        assert_eq!(summary.pending, 1);
        let entry = ingestor.db().get_pending(&path_key(&path)).await.unwrap().unwrap();
        assert_eq!(entry.attempt_count, 2);
        assert_eq!(entry.last_error.as_deref(), Some("file not found"));
    }

    #[tokio::test]
    async fn test_missing_watch_root_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let (mut ingestor, _resolver, _clock) = setup(&tmp).await;
        ingestor.traversal.root = tmp.path().join("nope");
        let err = ingestor.scan_once(false).await.unwrap_err();
        assert!(matches!(err, IngestError::InvalidPath(_)));
    }

    #[tokio::test]
    async fn test_drain_processes_items_until_cancelled() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().canonicalize().unwrap().join("a.pdf");
        fs::write(&path, b"a").unwrap();
        let (ingestor, resolver, _clock) = setup(&tmp).await;
        resolver.push(Resolution::Matched {
            attachment_id: "K".to_string(),
            parent_item_id: "P".to_string(),
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(WorkItem::Changed(path.clone())).unwrap();
        tx.send(WorkItem::RetryDue).unwrap();
        drop(tx);

        let cancel = CancellationToken::new();
        let mut total = ScanSummary::default();
        ingestor.drain(&mut rx, &cancel, &mut total).await.unwrap();
        assert_eq!(total.resolved, 1);

        // Cancelled before anything is taken
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(WorkItem::Changed(path)).unwrap();
        cancel.cancel();
        let mut total = ScanSummary::default();
        ingestor.drain(&mut rx, &cancel, &mut total).await.unwrap();
        assert_eq!(total.files_seen, 0);
    }
}
