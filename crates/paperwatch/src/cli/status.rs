//! Status command - read-only view of the store

use super::{format_millis, format_relative, print_table};
use anyhow::{Context, Result};
use paperwatch::PaperwatchConfig;
use paperwatch_db::StateDb;

/// Arguments for the status command
#[derive(Debug)]
pub struct StatusArgs {
    pub limit: u32,
}

/// Execute the status command
pub async fn run(args: StatusArgs, config: PaperwatchConfig) -> Result<()> {
    let db = StateDb::open_read_only(&config.database_path)
        .await
        .with_context(|| {
            format!(
                "Failed to open {} (run `paperwatch scan` first)",
                config.database_path.display()
            )
        })?;

    let max_attempts = config.retry.max_attempts;
    let status = db.status(max_attempts).await?;
    let now = StateDb::now_millis();

    println!("Database:   {}", config.database_path.display());
    println!("Watch dir:  {}", config.watch_dir.display());
    println!(
        "Last scan:  {}",
        status
            .last_full_scan_at
            .map(format_millis)
            .unwrap_or_else(|| "never".to_string())
    );
    println!(
        "Files: {}  Resolved: {}  Pending: {}  Stalled: {}",
        status.files, status.bindings, status.pending, status.stalled
    );
    if let Some(next) = status.next_attempt_at {
        println!("Next retry: {} ({})", format_millis(next), format_relative(next, now));
    }

    let entries = db.all_pending(args.limit).await?;
    if entries.is_empty() {
        db.close().await;
        return Ok(());
    }

    println!();
    let rows = entries
        .into_iter()
        .map(|e| {
            let state = if max_attempts.is_some_and(|limit| e.attempt_count >= limit) {
                "stalled".to_string()
            } else {
                format_relative(e.next_attempt_at, now)
            };
            vec![
                e.file_path,
                e.attempt_count.to_string(),
                state,
                e.last_error.unwrap_or_default(),
            ]
        })
        .collect();
    print_table(&["Path", "Attempts", "Next attempt", "Last error"], rows);

    db.close().await;
    Ok(())
}
