//! paperwatch command-line entry point
//!
//! A thin shell over the ingestion engine: parse arguments, load config,
//! set up logging, then hand off to `cli::scan` or `cli::status`.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use paperwatch::PaperwatchConfig;
use paperwatch_logging::{init_logging, LogConfig};
use std::path::PathBuf;
use std::process::ExitCode;

mod cli;

#[derive(Parser, Debug)]
#[command(
    name = "paperwatch",
    version,
    about = "Match PDFs in a watched folder to library attachments"
)]
struct Cli {
    /// Enable verbose logging on stderr
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Config file (default: $PAPERWATCH_HOME/config.toml)
    #[arg(long, global = true, env = "PAPERWATCH_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Scan the watched folder (one-shot by default)
    Scan {
        /// Scan once and exit
        #[arg(long, conflicts_with_all = ["watch", "paths"])]
        once: bool,

        /// Scan, then keep processing changes and retries until Ctrl-C
        #[arg(long, conflicts_with = "paths")]
        watch: bool,

        /// Process only these files (repeatable)
        #[arg(long = "path", value_name = "FILE")]
        paths: Vec<PathBuf>,

        /// Ignore directory stamps and retry every pending entry now
        #[arg(long, conflicts_with = "paths")]
        force: bool,
    },

    /// Show store counts and the retry queue
    Status {
        /// Number of pending entries to list
        #[arg(long, default_value = "20")]
        limit: u32,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_logging(LogConfig {
        app_name: "paperwatch",
        verbose: cli.verbose,
    }) {
        eprintln!("Warning: failed to initialize logging: {:#}", e);
    }

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let config =
        PaperwatchConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("paperwatch")
        .build()
        .context("Failed to start async runtime")?;

    match cli.command {
        Commands::Scan {
            once,
            watch,
            paths,
            force,
        } => {
            let args = cli::scan::ScanArgs {
                once,
                watch,
                paths,
                force,
            };
            runtime.block_on(cli::scan::run(args, config))
        }
        Commands::Status { limit } => {
            runtime.block_on(cli::status::run(cli::status::StatusArgs { limit }, config))
        }
    }
}
