//! Live filesystem notifications for watch mode
//!
//! `notify` callbacks only forward raw paths. A tokio task filters them,
//! waits until a path has been quiet for the debounce window, and then
//! pushes a single [`WorkItem::Changed`] onto the worker queue.

use super::error::Result;
use super::filter::FileMatcher;
use super::types::WorkItem;
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Per-path quiet-period tracking.
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    last_event: HashMap<PathBuf, Instant>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_event: HashMap::new(),
        }
    }

    /// Record activity on `path`, restarting its quiet period.
    pub fn note(&mut self, path: PathBuf, at: Instant) {
        self.last_event.insert(path, at);
    }

    /// Remove and return paths quiet for at least the window, sorted.
    pub fn drain_ready(&mut self, now: Instant) -> Vec<PathBuf> {
        let window = self.window;
        let mut ready: Vec<PathBuf> = self
            .last_event
            .iter()
            .filter(|(_, at)| now.saturating_duration_since(**at) >= window)
            .map(|(path, _)| path.clone())
            .collect();
        for path in &ready {
            self.last_event.remove(path);
        }
        ready.sort();
        ready
    }

    pub fn is_empty(&self) -> bool {
        self.last_event.is_empty()
    }
}

/// Event kinds that can change file content or bring a new file into view
fn is_relevant(kind: &EventKind) -> bool {
    matches!(kind, EventKind::Create(_) | EventKind::Modify(_) | EventKind::Any)
}

/// Running watcher; dropping it stops notifications.
pub struct FsWatcher {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl FsWatcher {
    /// Watch `root` and feed debounced changes into `sink` until `cancel` fires.
    pub fn start(
        root: &Path,
        matcher: FileMatcher,
        recursive: bool,
        debounce: Duration,
        sink: mpsc::UnboundedSender<WorkItem>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel::<PathBuf>();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if is_relevant(&event.kind) {
                        for path in event.paths {
                            let _ = raw_tx.send(path);
                        }
                    }
                }
                Err(e) => warn!(error = %e, "Filesystem watcher error"),
            },
            NotifyConfig::default(),
        )?;

        let mode = if recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        watcher.watch(root, mode)?;
        debug!(root = %root.display(), recursive, "Watching for changes");

        let task = tokio::spawn(coalesce(
            root.to_path_buf(),
            matcher,
            debounce,
            raw_rx,
            sink,
            cancel,
        ));

        Ok(Self {
            _watcher: watcher,
            task,
        })
    }

    /// Stop the coalescing task
    pub fn stop(self) {
        self.task.abort();
    }
}

async fn coalesce(
    root: PathBuf,
    matcher: FileMatcher,
    debounce: Duration,
    mut raw_rx: mpsc::UnboundedReceiver<PathBuf>,
    sink: mpsc::UnboundedSender<WorkItem>,
    cancel: CancellationToken,
) {
    let mut debouncer = Debouncer::new(debounce);
    let tick_every = (debounce / 4).max(Duration::from_millis(25));
    let mut tick = tokio::time::interval(tick_every);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            raw = raw_rx.recv() => {
                let Some(path) = raw else { break };
                if matcher.accepts(&root, &path) {
                    debouncer.note(path, Instant::now());
                }
            }
            _ = tick.tick() => {
                for path in debouncer.drain_ready(Instant::now()) {
                    debug!(path = %path.display(), "File settled");
                    if sink.send(WorkItem::Changed(path)).is_err() {
                        return;
                    }
                }
            }
        }
    }
}
