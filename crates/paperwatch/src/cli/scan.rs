//! Scan command - one-shot, watch, or explicit paths

use anyhow::{bail, Context, Result};
use paperwatch::ingest::{
    IngestEvent, Ingestor, LinkedAttachmentIndex, PaperwatchConfig, ScanSummary, Throttled,
};
use paperwatch_db::StateDb;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// How many pending paths / failures to print after a pass
const PREVIEW_LIMIT: usize = 10;

/// Arguments for the scan command
#[derive(Debug, Default)]
pub struct ScanArgs {
    pub once: bool,
    pub watch: bool,
    pub paths: Vec<PathBuf>,
    pub force: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ScanMode {
    Once,
    Watch,
    Paths(Vec<PathBuf>),
}

impl ScanArgs {
    /// Validate flag combinations and resolve the mode.
    pub fn mode(&self) -> Result<ScanMode> {
        let selected = [self.once, self.watch, !self.paths.is_empty()]
            .iter()
            .filter(|s| **s)
            .count();
        if selected > 1 {
            bail!("--once, --watch and --path are mutually exclusive");
        }
        if self.force && !self.paths.is_empty() {
            bail!("--force cannot be combined with --path");
        }
        for path in &self.paths {
            if !path.is_file() {
                bail!("Not an existing file: {}", path.display());
            }
        }

        Ok(if self.watch {
            ScanMode::Watch
        } else if !self.paths.is_empty() {
            ScanMode::Paths(self.paths.clone())
        } else {
            ScanMode::Once
        })
    }
}

/// Execute the scan command
pub async fn run(args: ScanArgs, config: PaperwatchConfig) -> Result<()> {
    let mode = args.mode()?;

    let db = StateDb::open(&config.database_path)
        .await
        .with_context(|| format!("Failed to open {}", config.database_path.display()))?;

    let resolver = Throttled::new(
        LinkedAttachmentIndex::new(config.resolver.index_path.clone()),
        Duration::from_millis(config.resolver.min_interval_ms),
    );

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(print_events(event_rx));

    let ingestor = Ingestor::new(db.clone(), Arc::new(resolver), &config)?.with_events(event_tx);

    let summary = match mode {
        ScanMode::Once => ingestor.scan_once(args.force).await?,
        ScanMode::Paths(paths) => ingestor.scan_paths(&paths).await?,
        ScanMode::Watch => {
            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Interrupt received, finishing current item");
                    on_signal.cancel();
                }
            });
            ingestor.watch(args.force, cancel).await?
        }
    };

    // Closing the sender lets the printer finish
    drop(ingestor);
    let _ = printer.await;

    print_summary(&summary);
    db.close().await;
    Ok(())
}

async fn print_events(mut rx: mpsc::UnboundedReceiver<IngestEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            IngestEvent::Resolved(item) => println!(
                "resolved  {}  -> {} (attachment {})",
                item.path.display(),
                item.parent_item_id,
                item.attachment_id
            ),
            IngestEvent::Pending {
                path,
                attempt_count,
                reason,
                ..
            } => println!(
                "pending   {}  (attempt {}, {})",
                path.display(),
                attempt_count,
                reason
            ),
            IngestEvent::Stalled {
                path,
                attempt_count,
            } => println!(
                "stalled   {}  (after {} attempts)",
                path.display(),
                attempt_count
            ),
        }
    }
}

fn print_summary(summary: &ScanSummary) {
    println!();
    println!(
        "Seen {} file(s): {} hashed, {} already resolved, {} resolved, {} pending, {} deferred, {} stalled, {} dir(s) skipped",
        summary.files_seen,
        summary.hashed,
        summary.unchanged,
        summary.resolved,
        summary.pending,
        summary.deferred,
        summary.stalled,
        summary.dirs_skipped,
    );

    if !summary.pending_paths.is_empty() {
        println!("Pending:");
        for path in summary.pending_paths.iter().take(PREVIEW_LIMIT) {
            println!("  {}", path);
        }
        if summary.pending_paths.len() > PREVIEW_LIMIT {
            println!("  ... and {} more", summary.pending_paths.len() - PREVIEW_LIMIT);
        }
    }

    if !summary.failures.is_empty() {
        println!("Failures:");
        for failure in summary.failures.iter().take(PREVIEW_LIMIT) {
            println!("  {}: {}", failure.path, failure.message);
        }
        if summary.failures.len() > PREVIEW_LIMIT {
            println!("  ... and {} more", summary.failures.len() - PREVIEW_LIMIT);
        }
    }
}
