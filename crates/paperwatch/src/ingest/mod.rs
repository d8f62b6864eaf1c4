//! Incremental ingestion engine
//!
//! - [`fingerprint`]: (mtime, size, SHA-1) change detection
//! - [`dir_stamp`]: subtree skipping by aggregated directory mtime
//! - [`resolver`]: attachment lookup contract and adapters
//! - [`retry`]: backoff policy and due-entry selection
//! - [`controller`]: the single worker tying it together
//! - [`watcher`]: debounced filesystem notifications for watch mode

pub mod config;
pub mod controller;
pub mod dir_stamp;
pub mod error;
pub mod filter;
pub mod fingerprint;
pub mod resolver;
pub mod retry;
pub mod types;
pub mod watcher;

pub use config::PaperwatchConfig;
pub use controller::Ingestor;
pub use error::{IngestError, Result};
pub use filter::FileMatcher;
pub use resolver::{AttachmentResolver, LinkedAttachmentIndex, Resolution, Throttled};
pub use retry::{Clock, ManualClock, RetryPolicy, RetryScheduler, SystemClock};
pub use types::{
    IngestEvent, PathOutcome, ResolvedItem, ScanFailure, ScanSummary, Trigger, WorkItem,
};

use std::path::Path;

/// Store key for a filesystem path.
pub fn path_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
