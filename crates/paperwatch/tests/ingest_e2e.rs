//! End-to-end ingestion scenarios against a real directory tree, a scripted
//! resolver and a hand-driven clock.

use async_trait::async_trait;
use filetime::{set_file_mtime, FileTime};
use paperwatch::ingest::{
    path_key, AttachmentResolver, IngestEvent, Ingestor, ManualClock, PaperwatchConfig,
    Resolution,
};
use paperwatch_db::StateDb;
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const T0: i64 = 1_700_000_000_000;
const BASE_MS: i64 = 5_000;

/// Answers per file name, in order; `NotFound` once a script runs out.
#[derive(Default)]
struct ScriptedResolver {
    script: Mutex<HashMap<String, VecDeque<Resolution>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedResolver {
    fn answer(&self, file_name: &str, resolution: Resolution) {
        self.script
            .lock()
            .unwrap()
            .entry(file_name.to_string())
            .or_default()
            .push_back(resolution);
    }

    fn calls_for(&self, file_name: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.as_str() == file_name)
            .count()
    }

    fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl AttachmentResolver for ScriptedResolver {
    async fn resolve(&self, path: &Path, _content_hash: &str) -> Resolution {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.calls.lock().unwrap().push(name.clone());
        self.script
            .lock()
            .unwrap()
            .get_mut(&name)
            .and_then(|q| q.pop_front())
            .unwrap_or(Resolution::NotFound)
    }
}

fn matched(attachment: &str, parent: &str) -> Resolution {
    Resolution::Matched {
        attachment_id: attachment.to_string(),
        parent_item_id: parent.to_string(),
    }
}

struct Harness {
    _tmp: TempDir,
    root: PathBuf,
    db_path: PathBuf,
    ingestor: Ingestor,
    resolver: Arc<ScriptedResolver>,
    clock: Arc<ManualClock>,
    events: mpsc::UnboundedReceiver<IngestEvent>,
}

impl Harness {
    async fn new(configure: impl FnOnce(&mut PaperwatchConfig)) -> Self {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("library");
        fs::create_dir_all(&root).unwrap();
        let root = root.canonicalize().unwrap();
        let db_path = tmp.path().join("state").join("paperwatch.sqlite3");

        let mut config = PaperwatchConfig::default();
        config.watch_dir = root.clone();
        config.database_path = db_path.clone();
        config.retry.jitter_ratio = 0.0;
        config.watch.debounce_ms = 50;
        configure(&mut config);

        let resolver = Arc::new(ScriptedResolver::default());
        let clock = Arc::new(ManualClock::new(T0));
        let (tx, events) = mpsc::unbounded_channel();
        let db = StateDb::open(&db_path).await.unwrap();
        let ingestor = Ingestor::new(db, resolver.clone(), &config)
            .unwrap()
            .with_clock(clock.clone())
            .with_events(tx);

        Self {
            _tmp: tmp,
            root,
            db_path,
            ingestor,
            resolver,
            clock,
            events,
        }
    }

    fn db(&self) -> &StateDb {
        self.ingestor.db()
    }

    fn path(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    fn key(&self, rel: &str) -> String {
        path_key(&self.path(rel))
    }

    /// Write a file and pin its mtime.
    fn write(&self, rel: &str, content: &[u8], mtime_secs: i64) {
        let path = self.path(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, content).unwrap();
        set_file_mtime(&path, FileTime::from_unix_time(mtime_secs, 0)).unwrap();
    }

    /// Pin the mtime of the root and of every directory under it.
    fn pin_dirs(&self, mtime_secs: i64) {
        for entry in walk_dirs(&self.root) {
            set_file_mtime(&entry, FileTime::from_unix_time(mtime_secs, 0)).unwrap();
        }
    }

    fn drain_events(&mut self) -> Vec<IngestEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}

fn walk_dirs(root: &Path) -> Vec<PathBuf> {
    let mut dirs = vec![root.to_path_buf()];
    let mut i = 0;
    while i < dirs.len() {
        for entry in fs::read_dir(&dirs[i]).unwrap() {
            let entry = entry.unwrap();
            if entry.file_type().unwrap().is_dir() {
                dirs.push(entry.path());
            }
        }
        i += 1;
    }
    dirs
}

fn resolved_paths(events: &[IngestEvent]) -> Vec<PathBuf> {
    events
        .iter()
        .filter_map(|e| match e {
            IngestEvent::Resolved(item) => Some(item.path.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn not_found_then_matched_on_retry() {
    let mut h = Harness::new(|_| {}).await;
    h.write("a.pdf", b"%PDF-1.7 alpha", 1_000);
    h.pin_dirs(1_000);

    let summary = h.ingestor.scan_once(false).await.unwrap();
    assert_eq!(summary.pending, 1);
    let entry = h.db().get_pending(&h.key("a.pdf")).await.unwrap().unwrap();
    assert_eq!(entry.attempt_count, 1);
    assert_eq!(entry.next_attempt_at, T0 + BASE_MS);
    assert!(h.db().binding_for_path(&h.key("a.pdf")).await.unwrap().is_none());

    // Not due yet
    h.clock.advance(Duration::from_millis(4_999));
    let early = h.ingestor.retry_due(false).await.unwrap();
    assert_eq!(early.files_seen, 0);
    assert_eq!(h.resolver.calls_for("a.pdf"), 1);

    h.clock.set(T0 + BASE_MS);
    h.resolver.answer("a.pdf", matched("K", "PARENT"));
    let retry = h.ingestor.retry_due(false).await.unwrap();
    assert_eq!(retry.resolved, 1);

    assert!(h.db().get_pending(&h.key("a.pdf")).await.unwrap().is_none());
    let binding = h.db().binding_for_path(&h.key("a.pdf")).await.unwrap().unwrap();
    assert_eq!(binding.attachment_key, "K");
    assert_eq!(binding.parent_item_key, "PARENT");

    let events = h.drain_events();
    assert!(matches!(events[0], IngestEvent::Pending { attempt_count: 1, .. }));
    match &events[1] {
        IngestEvent::Resolved(item) => {
            assert_eq!(item.path, h.path("a.pdf"));
            assert_eq!(item.attachment_id, "K");
            assert_eq!(item.parent_item_id, "PARENT");
            assert_eq!(item.content_hash, binding.sha1.clone().unwrap());
        }
        other => panic!("expected Resolved, got {other:?}"),
    }
}

#[tokio::test]
async fn edited_file_drops_stale_binding() {
    let mut h = Harness::new(|_| {}).await;
    h.write("a.pdf", b"version one", 1_000);
    h.pin_dirs(1_000);
    h.resolver.answer("a.pdf", matched("K1", "P"));

    h.ingestor.scan_once(false).await.unwrap();
    assert!(h.db().get_binding("K1").await.unwrap().is_some());

    h.write("a.pdf", b"version two, longer", 5_000);
    h.clock.advance(Duration::from_secs(1));
    let summary = h.ingestor.scan_once(false).await.unwrap();

    assert_eq!(summary.hashed, 1);
    assert_eq!(summary.pending, 1);
    assert!(h.db().get_binding("K1").await.unwrap().is_none());
    assert!(h.db().binding_for_path(&h.key("a.pdf")).await.unwrap().is_none());
    let entry = h.db().get_pending(&h.key("a.pdf")).await.unwrap().unwrap();
    assert_eq!(entry.attempt_count, 1);

    // Only the first content was ever emitted as resolved
    assert_eq!(resolved_paths(&h.drain_events()).len(), 1);
}

#[tokio::test]
async fn unchanged_stat_skips_rehash() {
    let h = Harness::new(|_| {}).await;
    h.write("a.pdf", b"aaa", 1_000);
    h.write("sub/b.pdf", b"bbb", 1_000);
    h.pin_dirs(1_000);

    let first = h.ingestor.scan_once(false).await.unwrap();
    assert_eq!(first.hashed, 2);

    // Force bypasses directory stamps, so both files are fingerprinted again
    let forced = h.ingestor.scan_once(true).await.unwrap();
    assert_eq!(forced.fingerprinted, 2);
    assert_eq!(forced.hashed, 0);

    // Explicit paths ignore stamps as well
    let explicit = h
        .ingestor
        .scan_paths(&[h.path("sub/b.pdf")])
        .await
        .unwrap();
    assert_eq!(explicit.fingerprinted, 1);
    assert_eq!(explicit.hashed, 0);
}

#[tokio::test]
async fn bound_file_never_requeued() {
    let mut h = Harness::new(|_| {}).await;
    h.write("a.pdf", b"bound", 1_000);
    h.pin_dirs(1_000);
    h.resolver.answer("a.pdf", matched("K", "P"));

    h.ingestor.scan_once(false).await.unwrap();
    for _ in 0..3 {
        h.clock.advance(Duration::from_secs(3600));
        let summary = h.ingestor.scan_once(true).await.unwrap();
        assert_eq!(summary.unchanged, 1);
        assert_eq!(summary.pending, 0);
    }

    assert!(h.db().get_pending(&h.key("a.pdf")).await.unwrap().is_none());
    assert_eq!(h.resolver.calls_for("a.pdf"), 1);
    assert_eq!(resolved_paths(&h.drain_events()), vec![h.path("a.pdf")]);
}

#[tokio::test]
async fn consecutive_failures_never_move_schedule_back() {
    let h = Harness::new(|c| c.retry.max_delay_secs = 20).await;
    h.write("a.pdf", b"x", 1_000);
    h.pin_dirs(1_000);
    h.resolver
        .answer("a.pdf", Resolution::TransientError("timeout".to_string()));

    h.ingestor.scan_once(false).await.unwrap();
    let mut previous = h.db().get_pending(&h.key("a.pdf")).await.unwrap().unwrap();
    let mut delays = Vec::new();

    for _ in 0..5 {
        h.clock.set(previous.next_attempt_at);
        h.ingestor.retry_due(false).await.unwrap();
        let entry = h.db().get_pending(&h.key("a.pdf")).await.unwrap().unwrap();
        assert_eq!(entry.attempt_count, previous.attempt_count + 1);
        assert!(entry.next_attempt_at > previous.next_attempt_at);
        delays.push(entry.next_attempt_at - previous.next_attempt_at);
        previous = entry;
    }

    assert_eq!(delays, vec![10_000, 20_000, 20_000, 20_000, 20_000]);
    assert_eq!(previous.first_seen_at, T0);
}

#[tokio::test]
async fn unchanged_directory_is_not_refingerprinted() {
    let h = Harness::new(|_| {}).await;
    h.write("a/one.pdf", b"one", 1_000);
    h.write("b/two.pdf", b"two", 1_000);
    h.pin_dirs(1_000);
    h.resolver.answer("one.pdf", matched("K1", "P1"));
    h.resolver.answer("two.pdf", matched("K2", "P2"));

    h.ingestor.scan_once(false).await.unwrap();

    h.clock.advance(Duration::from_secs(60));
    h.write("b/two.pdf", b"two, edited", 2_000);
    let summary = h.ingestor.scan_once(false).await.unwrap();

    assert_eq!(summary.dirs_skipped, 1);
    assert_eq!(summary.fingerprinted, 1);
    assert_eq!(summary.hashed, 1);

    let one = h.db().get_file(&h.key("a/one.pdf")).await.unwrap().unwrap();
    let two = h.db().get_file(&h.key("b/two.pdf")).await.unwrap().unwrap();
    assert_eq!(one.last_seen_at, T0);
    assert_eq!(two.last_seen_at, T0 + 60_000);
    assert_eq!(h.resolver.calls_for("one.pdf"), 1);
    assert_eq!(h.resolver.calls_for("two.pdf"), 2);
}

#[tokio::test]
async fn force_retries_every_pending_entry() {
    let h = Harness::new(|c| c.retry.max_attempts = Some(2)).await;
    h.write("a.pdf", b"a", 1_000);
    h.write("deep/b.pdf", b"b", 1_000);
    h.pin_dirs(1_000);

    h.ingestor.scan_once(false).await.unwrap();
    h.clock.advance(Duration::from_secs(5));
    let second = h.ingestor.retry_due(false).await.unwrap();
    assert_eq!(second.stalled, 2);

    // Stalled entries stay in the table but are no longer selected
    h.clock.advance(Duration::from_secs(3600));
    assert_eq!(h.ingestor.retry_due(false).await.unwrap().files_seen, 0);
    let plain = h.ingestor.scan_once(false).await.unwrap();
    assert_eq!(plain.files_seen, 0);
    assert_eq!(h.db().count_pending().await.unwrap(), 2);
    assert_eq!(h.resolver.total_calls(), 4);

    h.resolver.answer("a.pdf", matched("KA", "PA"));
    let forced = h.ingestor.scan_once(true).await.unwrap();
    assert_eq!(h.resolver.total_calls(), 6);
    assert_eq!(forced.resolved, 1);
    assert_eq!(forced.stalled, 1);
    assert_eq!(h.db().count_pending().await.unwrap(), 1);
}

#[tokio::test]
async fn force_ignores_schedule_without_attempt_limit() {
    let h = Harness::new(|c| {
        c.retry.base_delay_secs = 3600;
        c.retry.max_delay_secs = 7200;
    })
    .await;
    h.write("a.pdf", b"a", 1_000);
    h.pin_dirs(1_000);

    h.ingestor.scan_once(false).await.unwrap();
    assert_eq!(h.ingestor.retry_due(false).await.unwrap().files_seen, 0);

    let forced = h.ingestor.retry_due(true).await.unwrap();
    assert_eq!(forced.pending, 1);
    assert_eq!(h.resolver.calls_for("a.pdf"), 2);
}

#[tokio::test]
async fn repeated_scan_adds_no_rows() {
    let h = Harness::new(|_| {}).await;
    h.write("found.pdf", b"found", 1_000);
    h.write("x/missing.pdf", b"missing", 1_000);
    h.pin_dirs(1_000);
    h.resolver.answer("found.pdf", matched("K", "P"));

    h.ingestor.scan_once(false).await.unwrap();
    let before = h.db().status(None).await.unwrap();
    let calls = h.resolver.total_calls();

    let again = h.ingestor.scan_once(false).await.unwrap();
    let after = h.db().status(None).await.unwrap();

    assert_eq!(before.bindings, after.bindings);
    assert_eq!(before.pending, after.pending);
    assert_eq!(before.files, after.files);
    assert_eq!(again.resolved + again.pending, 0);
    assert_eq!(h.resolver.total_calls(), calls);
    assert!(after.last_full_scan_at.is_some());
}

#[tokio::test]
async fn unreadable_entries_do_not_abort_the_pass() {
    let h = Harness::new(|_| {}).await;
    h.write("good.pdf", b"good", 1_000);
    h.pin_dirs(1_000);
    h.resolver.answer("good.pdf", matched("K", "P"));

    let summary = h
        .ingestor
        .scan_paths(&[h.path("gone.pdf"), h.path("good.pdf")])
        .await
        .unwrap();

    assert_eq!(summary.failures.len(), 1);
    assert!(summary.failures[0].path.ends_with("gone.pdf"));
    assert_eq!(summary.resolved, 1);
}

#[tokio::test]
async fn pending_state_survives_restart() {
    let h = Harness::new(|_| {}).await;
    h.write("a.pdf", b"a", 1_000);
    h.pin_dirs(1_000);
    h.ingestor.scan_once(false).await.unwrap();

    let db_path = h.db_path.clone();
    let root = h.root.clone();
    let Harness {
        _tmp: tmp,
        ingestor,
        ..
    } = h;
    ingestor.db().clone().close().await;
    drop(ingestor);

    let mut config = PaperwatchConfig::default();
    config.watch_dir = root.clone();
    config.retry.jitter_ratio = 0.0;
    let resolver = Arc::new(ScriptedResolver::default());
    let clock = Arc::new(ManualClock::new(T0 + BASE_MS));
    let db = StateDb::open(&db_path).await.unwrap();
    let ingestor = Ingestor::new(db, resolver.clone(), &config)
        .unwrap()
        .with_clock(clock);

    ingestor.retry_due(false).await.unwrap();
    let entry = ingestor
        .db()
        .get_pending(&path_key(&root.join("a.pdf")))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.attempt_count, 2);
    assert_eq!(entry.first_seen_at, T0);
    assert_eq!(resolver.total_calls(), 1);
    drop(tmp);
}

#[tokio::test]
async fn read_only_inspection_alongside_writer() {
    let h = Harness::new(|_| {}).await;
    h.write("a.pdf", b"a", 1_000);
    h.pin_dirs(1_000);
    h.ingestor.scan_once(false).await.unwrap();

    let reader = StateDb::open_read_only(&h.db_path).await.unwrap();
    let status = reader.status(None).await.unwrap();
    assert_eq!(status.files, 1);
    assert_eq!(status.pending, 1);
    assert_eq!(status.next_attempt_at, Some(T0 + BASE_MS));
    reader.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn watch_picks_up_new_file_and_stops_on_cancel() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("library");
    fs::create_dir_all(&root).unwrap();
    let root = root.canonicalize().unwrap();

    let mut config = PaperwatchConfig::default();
    config.watch_dir = root.clone();
    config.watch.debounce_ms = 50;

    let resolver = Arc::new(ScriptedResolver::default());
    resolver.answer("late.pdf", matched("K", "P"));
    let (tx, mut events) = mpsc::unbounded_channel();
    let db = StateDb::open(tmp.path().join("state.sqlite3")).await.unwrap();
    let ingestor = Arc::new(
        Ingestor::new(db, resolver.clone(), &config)
            .unwrap()
            .with_events(tx),
    );

    let cancel = CancellationToken::new();
    let worker = {
        let ingestor = Arc::clone(&ingestor);
        let cancel = cancel.clone();
        tokio::spawn(async move { ingestor.watch(false, cancel).await })
    };

    // Give the initial scan and watcher a moment to start
    tokio::time::sleep(Duration::from_millis(300)).await;
    fs::write(root.join("late.pdf"), b"%PDF late").unwrap();

    let item = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Some(IngestEvent::Resolved(item)) => break item,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("file was not picked up");
    assert_eq!(item.path, root.join("late.pdf"));
    assert_eq!(item.attachment_id, "K");

    cancel.cancel();
    let total = tokio::time::timeout(Duration::from_secs(10), worker)
        .await
        .expect("watch did not stop")
        .unwrap()
        .unwrap();
    assert_eq!(total.resolved, 1);
}

#[tokio::test]
async fn shared_attachment_key_is_not_passed_back_and_forth() {
    let mut h = Harness::new(|_| {}).await;
    h.write("a/paper.pdf", b"%PDF same bytes", 1_000);
    h.write("b/paper.pdf", b"%PDF same bytes", 1_000);
    h.pin_dirs(1_000);
    for _ in 0..10 {
        h.resolver.answer("paper.pdf", matched("K1", "P"));
    }
    let both = [h.path("a/paper.pdf"), h.path("b/paper.pdf")];

    let first = h.ingestor.scan_paths(&both).await.unwrap();
    assert_eq!(first.resolved, 1);
    assert_eq!(first.pending, 1);
    assert_eq!(resolved_paths(&h.drain_events()), vec![h.path("a/paper.pdf")]);

    for _ in 0..2 {
        let again = h.ingestor.scan_paths(&both).await.unwrap();
        assert_eq!(again.resolved, 0);
        assert!(resolved_paths(&h.drain_events()).is_empty());
    }
    for _ in 0..2 {
        h.clock.advance(Duration::from_secs(60));
        let forced = h.ingestor.scan_once(true).await.unwrap();
        assert_eq!(forced.resolved, 0);
        assert!(resolved_paths(&h.drain_events()).is_empty());
    }

    let binding = h.db().get_binding("K1").await.unwrap().unwrap();
    assert_eq!(binding.file_path, h.key("a/paper.pdf"));
    assert!(h.db().binding_for_path(&h.key("b/paper.pdf")).await.unwrap().is_none());
    let entry = h.db().get_pending(&h.key("b/paper.pdf")).await.unwrap().unwrap();
    assert!(entry
        .last_error
        .as_deref()
        .unwrap()
        .starts_with("attachment K1 already bound to"));
    assert_eq!(h.db().status(None).await.unwrap().bindings, 1);
}

#[tokio::test]
async fn shared_key_moves_once_previous_holder_is_gone() {
    let mut h = Harness::new(|_| {}).await;
    h.write("a/paper.pdf", b"%PDF same bytes", 1_000);
    h.write("b/paper.pdf", b"%PDF same bytes", 1_000);
    h.pin_dirs(1_000);
    for _ in 0..3 {
        h.resolver.answer("paper.pdf", matched("K1", "P"));
    }

    h.ingestor
        .scan_paths(&[h.path("a/paper.pdf"), h.path("b/paper.pdf")])
        .await
        .unwrap();
    h.drain_events();

    fs::remove_file(h.path("a/paper.pdf")).unwrap();
    h.clock.advance(Duration::from_secs(5));
    let retry = h.ingestor.retry_due(false).await.unwrap();
    assert_eq!(retry.resolved, 1);

    assert_eq!(resolved_paths(&h.drain_events()), vec![h.path("b/paper.pdf")]);
    let binding = h.db().get_binding("K1").await.unwrap().unwrap();
    assert_eq!(binding.file_path, h.key("b/paper.pdf"));
    assert!(h.db().get_pending(&h.key("b/paper.pdf")).await.unwrap().is_none());
    assert!(h.db().binding_for_path(&h.key("a/paper.pdf")).await.unwrap().is_none());
}
