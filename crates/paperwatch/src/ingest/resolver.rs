//! Attachment resolution: map a local file to a library attachment
//!
//! The library service is rate-limited, so callers must never run two
//! lookups at once. [`Throttled`] enforces the spacing; the ingestion
//! worker enforces the sequencing.

use super::error::Result;
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Outcome of one lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Matched {
        attachment_id: String,
        parent_item_id: String,
    },
    NotFound,
    /// Service or transport failure; retried with backoff
    TransientError(String),
}

/// Lookup of the library attachment backing a local file.
#[async_trait]
pub trait AttachmentResolver: Send + Sync {
    async fn resolve(&self, path: &Path, content_hash: &str) -> Resolution;
}

#[async_trait]
impl<R: AttachmentResolver + ?Sized> AttachmentResolver for Arc<R> {
    async fn resolve(&self, path: &Path, content_hash: &str) -> Resolution {
        (**self).resolve(path, content_hash).await
    }
}

/// One attachment from a library export.
///
/// Accepts both snake_case and the library's camelCase field names.
#[derive(Debug, Clone, Deserialize)]
pub struct AttachmentRecord {
    pub key: String,
    #[serde(default, alias = "parentItem")]
    pub parent_item: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default, alias = "linkMode")]
    pub link_mode: Option<String>,
}

impl AttachmentRecord {
    fn is_linked_file(&self) -> bool {
        self.link_mode.as_deref() == Some("linked_file")
    }

    fn matched(&self) -> Option<Resolution> {
        let parent = self.parent_item.as_deref().filter(|p| !p.is_empty())?;
        Some(Resolution::Matched {
            attachment_id: self.key.clone(),
            parent_item_id: parent.to_string(),
        })
    }
}

/// Match a file against a list of attachments.
///
/// Pass 1: linked files whose stored path is a suffix of the file path, or
/// whose basename equals the file's. Pass 2: any attachment whose path (or
/// filename) basename equals the file's. Attachments without a parent item
/// are ignored.
pub fn match_attachment(records: &[AttachmentRecord], path: &Path) -> Resolution {
    let target = normalize(&path.to_string_lossy());
    let Some(base) = basename(&target) else {
        return Resolution::NotFound;
    };

    for record in records.iter().filter(|r| r.is_linked_file()) {
        let stored = normalize(record.path.as_deref().unwrap_or(""));
        if stored.is_empty() {
            continue;
        }
        if target.ends_with(&stored) || basename(&stored) == Some(base) {
            if let Some(found) = record.matched() {
                return found;
            }
        }
    }

    for record in records {
        let name = record
            .path
            .as_deref()
            .filter(|p| !p.is_empty())
            .or(record.filename.as_deref())
            .unwrap_or("");
        let name = normalize(name);
        if basename(&name) == Some(base) {
            if let Some(found) = record.matched() {
                return found;
            }
        }
    }

    Resolution::NotFound
}

/// Lexical normalization: unify separators, drop `.` and resolve `..`.
fn normalize(raw: &str) -> String {
    let unified = raw.replace('\\', "/");
    let absolute = unified.starts_with('/');
    let mut parts: Vec<String> = Vec::new();
    for component in Path::new(&unified).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::ParentDir => {
                parts.pop();
            }
            _ => {}
        }
    }
    let joined = parts.join("/");
    if absolute {
        format!("/{}", joined)
    } else {
        joined
    }
}

fn basename(normalized: &str) -> Option<&str> {
    normalized.rsplit('/').next().filter(|b| !b.is_empty())
}

#[derive(Debug, Default)]
struct IndexCache {
    modified: Option<SystemTime>,
    records: Arc<Vec<AttachmentRecord>>,
}

/// Resolver over a JSON export of library attachments.
///
/// The export is re-read whenever its modification time changes, so
/// attachments added to the library after a file was queued are found on
/// a later retry.
#[derive(Debug)]
pub struct LinkedAttachmentIndex {
    index_path: Option<PathBuf>,
    cache: Mutex<IndexCache>,
}

impl LinkedAttachmentIndex {
    /// Resolver backed by the export at `index_path` (`None`: nothing resolves).
    pub fn new(index_path: Option<PathBuf>) -> Self {
        match &index_path {
            Some(path) if path.exists() => {
                info!(index = %path.display(), "Using attachment index");
            }
            Some(path) => {
                warn!(index = %path.display(), "Attachment index not found, lookups will report not found until it appears");
            }
            None => {
                warn!("No attachment index configured, every lookup reports not found");
            }
        }
        Self {
            index_path,
            cache: Mutex::new(IndexCache::default()),
        }
    }

    /// Resolver over fixed records (no file behind it).
    pub fn from_records(records: Vec<AttachmentRecord>) -> Self {
        Self {
            index_path: None,
            cache: Mutex::new(IndexCache {
                modified: None,
                records: Arc::new(records),
            }),
        }
    }

    /// Parse an export file.
    pub fn parse(content: &str) -> Result<Vec<AttachmentRecord>> {
        Ok(serde_json::from_str(content)?)
    }

    async fn records(&self) -> std::result::Result<Arc<Vec<AttachmentRecord>>, String> {
        let mut cache = self.cache.lock().await;
        let Some(path) = &self.index_path else {
            return Ok(Arc::clone(&cache.records));
        };

        let modified = match tokio::fs::metadata(path).await {
            Ok(meta) => meta.modified().ok(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                cache.modified = None;
                cache.records = Arc::new(Vec::new());
                return Ok(Arc::clone(&cache.records));
            }
            Err(e) => return Err(format!("cannot stat attachment index: {}", e)),
        };

        if cache.modified.is_none() || cache.modified != modified {
            let content = tokio::fs::read_to_string(path)
                .await
                .map_err(|e| format!("cannot read attachment index: {}", e))?;
            let records =
                Self::parse(&content).map_err(|e| format!("invalid attachment index: {}", e))?;
            debug!(index = %path.display(), attachments = records.len(), "Attachment index loaded");
            cache.records = Arc::new(records);
            cache.modified = modified;
        }
        Ok(Arc::clone(&cache.records))
    }
}

#[async_trait]
impl AttachmentResolver for LinkedAttachmentIndex {
    async fn resolve(&self, path: &Path, _content_hash: &str) -> Resolution {
        match self.records().await {
            Ok(records) => match_attachment(&records, path),
            Err(reason) => Resolution::TransientError(reason),
        }
    }
}

/// Enforces a minimum interval between successive lookups.
///
/// The lock is held across the inner call, so calls are also serialized.
pub struct Throttled<R> {
    inner: R,
    min_interval: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl<R> Throttled<R> {
    pub fn new(inner: R, min_interval: Duration) -> Self {
        Self {
            inner,
            min_interval,
            last_call: Mutex::new(None),
        }
    }
}

#[async_trait]
impl<R: AttachmentResolver> AttachmentResolver for Throttled<R> {
    async fn resolve(&self, path: &Path, content_hash: &str) -> Resolution {
        let mut last_call = self.last_call.lock().await;
        if let Some(previous) = *last_call {
            let ready_at = previous + self.min_interval;
            if Instant::now() < ready_at {
                tokio::time::sleep_until(ready_at).await;
            }
        }
        let resolution = self.inner.resolve(path, content_hash).await;
        *last_call = Some(Instant::now());
        resolution
    }
}
