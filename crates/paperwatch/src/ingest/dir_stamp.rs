//! Directory stamps: skip subtrees whose aggregated mtime has not moved
//!
//! The aggregate of a directory is the newest mtime among the directory
//! itself and every entry below it. A traversal first stats the whole tree
//! (no hashing), then drops candidates under any directory whose aggregate
//! equals its stored stamp. Stamps are a cache only; a stale or missing
//! stamp just means more stat work.

use super::filter::FileMatcher;
use super::fingerprint::mtime_ns;
use super::path_key;
use super::types::ScanFailure;
use paperwatch_db::{DirectoryStamp, StateDb};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// What to walk
#[derive(Debug, Clone)]
pub struct TraversalOptions {
    pub root: PathBuf,
    pub matcher: FileMatcher,
    pub recursive: bool,
    pub follow_symlinks: bool,
}

/// Result of the stat-only walk.
#[derive(Debug, Default)]
pub struct TraversalPlan {
    /// Matching files outside skipped subtrees, in walk order
    pub candidates: Vec<PathBuf>,
    /// Directories seen (including skipped ones)
    pub dirs_visited: u64,
    /// Top-level subtrees skipped by an unchanged stamp
    pub dirs_skipped: u64,
    /// Entries that could not be read
    pub failures: Vec<ScanFailure>,
    /// Fresh aggregates for directories that were fully readable and descended
    aggregates: BTreeMap<PathBuf, i64>,
}

impl TraversalPlan {
    /// Stamps to persist after the candidates were processed.
    ///
    /// Directories containing a path in `failed` (at any depth) are left out
    /// so the next scan descends into them again.
    pub fn stamps(&self, failed: &[PathBuf], now: i64) -> Vec<DirectoryStamp> {
        let mut blocked: HashSet<&Path> = HashSet::new();
        for path in failed {
            for ancestor in path.ancestors().skip(1) {
                if !blocked.insert(ancestor) {
                    break;
                }
            }
        }

        self.aggregates
            .iter()
            .filter(|(dir, _)| !blocked.contains(dir.as_path()))
            .map(|(dir, aggregate)| DirectoryStamp {
                dir_path: path_key(dir),
                aggregated_mtime_ns: *aggregate,
                last_seen_at: now,
            })
            .collect()
    }
}

/// Stored stamps, preloaded once per traversal.
#[derive(Debug, Default, Clone)]
pub struct DirectoryStampCache {
    stored: HashMap<String, i64>,
}

impl DirectoryStampCache {
    pub async fn load(db: &StateDb) -> paperwatch_db::Result<Self> {
        let stamps = db.list_dir_stamps().await?;
        Ok(Self::from_stamps(stamps))
    }

    pub fn from_stamps(stamps: impl IntoIterator<Item = DirectoryStamp>) -> Self {
        Self {
            stored: stamps
                .into_iter()
                .map(|s| (s.dir_path, s.aggregated_mtime_ns))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.stored.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stored.is_empty()
    }

    fn is_unchanged(&self, dir: &Path, aggregate: i64) -> bool {
        self.stored.get(&path_key(dir)) == Some(&aggregate)
    }

    /// Walk `opts.root` and decide which files need fingerprinting.
    ///
    /// Blocking; run it on the blocking pool. `force` disables skipping.
    pub fn plan(&self, opts: &TraversalOptions, force: bool) -> TraversalPlan {
        let root = opts.root.as_path();
        let matcher = &opts.matcher;
        let mut plan = TraversalPlan::default();
        let mut aggregates: BTreeMap<PathBuf, i64> = BTreeMap::new();
        let mut tainted: HashSet<PathBuf> = HashSet::new();
        let mut files: Vec<PathBuf> = Vec::new();

        let mut walker = WalkDir::new(root)
            .follow_links(opts.follow_symlinks)
            .sort_by_file_name();
        if !opts.recursive {
            walker = walker.max_depth(1);
        }

        let entries = walker.into_iter().filter_entry(|e| {
            e.depth() == 0
                || !(e.file_type().is_dir() && matcher.is_excluded_dir(&e.file_name().to_string_lossy()))
        });

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    let path = err.path().unwrap_or(root).to_path_buf();
                    plan.failures.push(ScanFailure {
                        path: path.display().to_string(),
                        message: err.to_string(),
                    });
                    taint(&mut tainted, root, &path);
                    continue;
                }
            };

            let path = entry.path();
            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(err) => {
                    plan.failures.push(ScanFailure {
                        path: path.display().to_string(),
                        message: err.to_string(),
                    });
                    taint(&mut tainted, root, path);
                    continue;
                }
            };
            let mtime = mtime_ns(&metadata);

            if entry.file_type().is_dir() {
                plan.dirs_visited += 1;
                if opts.recursive || entry.depth() == 0 {
                    bump(&mut aggregates, path, mtime);
                }
            } else if entry.file_type().is_file() && matcher.matches_file(path) {
                files.push(path.to_path_buf());
            }

            for ancestor in path.ancestors().skip(1) {
                if !ancestor.starts_with(root) {
                    break;
                }
                bump(&mut aggregates, ancestor, mtime);
            }
        }

        // BTreeMap order puts every directory right before its descendants
        let mut skipped: HashSet<PathBuf> = HashSet::new();
        let mut current_skip: Option<PathBuf> = None;
        for (dir, aggregate) in &aggregates {
            if let Some(skip) = &current_skip {
                if dir.starts_with(skip) {
                    continue;
                }
                current_skip = None;
            }
            if !force && !tainted.contains(dir) && self.is_unchanged(dir, *aggregate) {
                debug!(dir = %dir.display(), "Directory unchanged, skipping subtree");
                skipped.insert(dir.clone());
                current_skip = Some(dir.clone());
            }
        }
        plan.dirs_skipped = skipped.len() as u64;

        plan.candidates = files
            .into_iter()
            .filter(|f| !f.ancestors().skip(1).any(|a| skipped.contains(a)))
            .collect();

        plan.aggregates = aggregates
            .into_iter()
            .filter(|(dir, _)| {
                !tainted.contains(dir) && !dir.ancestors().any(|a| skipped.contains(a))
            })
            .collect();

        plan
    }
}

fn bump(aggregates: &mut BTreeMap<PathBuf, i64>, dir: &Path, mtime: i64) {
    aggregates
        .entry(dir.to_path_buf())
        .and_modify(|agg| *agg = (*agg).max(mtime))
        .or_insert(mtime);
}

fn taint(tainted: &mut HashSet<PathBuf>, root: &Path, path: &Path) {
    for ancestor in path.ancestors() {
        if !ancestor.starts_with(root) {
            break;
        }
        tainted.insert(ancestor.to_path_buf());
    }
}
