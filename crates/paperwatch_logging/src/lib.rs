//! Tracing setup for paperwatch binaries.
//!
//! Every run writes to a size-rotated file under `$PAPERWATCH_HOME/logs`
//! and to stderr. The file always receives the `RUST_LOG` (or default)
//! filter; stderr only shows warnings unless verbose output was requested.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "paperwatch=info,paperwatch_db=info";
const MAX_LOG_FILES: usize = 5;
const MAX_LOG_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Environment variable overriding the state/log home directory.
pub const HOME_ENV: &str = "PAPERWATCH_HOME";

/// Logging options for one binary.
pub struct LogConfig<'a> {
    /// Base name of the log file (`<app_name>.log`)
    pub app_name: &'a str,
    /// Mirror the file filter on stderr instead of warn-only
    pub verbose: bool,
}

/// Install the global subscriber.
pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    let log_dir = ensure_logs_dir().context("Failed to ensure log directory")?;
    let file_writer = RotatingWriter::open(&log_dir, config.app_name)
        .with_context(|| format!("Failed to open log file in {}", log_dir.display()))?;

    let file_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let console_filter = if config.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
    } else {
        EnvFilter::new("warn")
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_filter(file_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_filter(console_filter),
        )
        .try_init()
        .context("Global tracing subscriber already installed")?;

    Ok(())
}

/// Home directory for state and logs: `$PAPERWATCH_HOME` or `~/.paperwatch`.
///
/// Falls back to `./.paperwatch` when no home directory can be determined.
pub fn paperwatch_home() -> PathBuf {
    if let Ok(override_path) = std::env::var(HOME_ENV) {
        if !override_path.is_empty() {
            return PathBuf::from(override_path);
        }
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".paperwatch")
}

/// Log directory: `<home>/logs`
pub fn logs_dir() -> PathBuf {
    paperwatch_home().join("logs")
}

/// Create the log directory if needed.
pub fn ensure_logs_dir() -> Result<PathBuf> {
    let logs = logs_dir();
    fs::create_dir_all(&logs)
        .with_context(|| format!("Failed to create logs directory: {}", logs.display()))?;
    Ok(logs)
}

/// Size-based rotation: `name.log` is the live file, `name.log.1` the most
/// recent rollover, up to `keep - 1` numbered files.
struct Rotation {
    dir: PathBuf,
    stem: String,
    keep: usize,
    limit: u64,
    file: Option<File>,
    written: u64,
}

impl Rotation {
    fn open(dir: &Path, name: &str, keep: usize, limit: u64) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let mut rotation = Self {
            dir: dir.to_path_buf(),
            stem: file_stem(name),
            keep: keep.max(1),
            limit,
            file: None,
            written: 0,
        };
        rotation.reopen()?;
        if rotation.written > rotation.limit {
            rotation.roll()?;
        }
        Ok(rotation)
    }

    fn live_path(&self) -> PathBuf {
        self.dir.join(format!("{}.log", self.stem))
    }

    fn numbered_path(&self, n: usize) -> PathBuf {
        self.dir.join(format!("{}.log.{}", self.stem, n))
    }

    fn reopen(&mut self) -> io::Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.live_path())?;
        self.written = file.metadata()?.len();
        self.file = Some(file);
        Ok(())
    }

    fn roll(&mut self) -> io::Result<()> {
        if let Some(mut file) = self.file.take() {
            let _ = file.flush();
        }

        let last = self.keep - 1;
        if last > 0 {
            let oldest = self.numbered_path(last);
            if oldest.exists() {
                fs::remove_file(&oldest)?;
            }
            for n in (1..last).rev() {
                let from = self.numbered_path(n);
                if from.exists() {
                    fs::rename(&from, self.numbered_path(n + 1))?;
                }
            }
            let live = self.live_path();
            if live.exists() {
                fs::rename(&live, self.numbered_path(1))?;
            }
        } else {
            // keep == 1: truncate in place
            File::create(self.live_path())?;
        }

        self.reopen()
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        if self.written > 0 && self.written + buf.len() as u64 > self.limit {
            self.roll()?;
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "log file unavailable"))?;
        file.write_all(buf)?;
        self.written += buf.len() as u64;
        Ok(())
    }
}

/// Cloneable writer handed to `tracing_subscriber::fmt`.
#[derive(Clone)]
struct RotatingWriter {
    inner: Arc<Mutex<Rotation>>,
}

impl RotatingWriter {
    fn open(dir: &Path, name: &str) -> io::Result<Self> {
        Self::with_limits(dir, name, MAX_LOG_FILES, MAX_LOG_FILE_SIZE)
    }

    fn with_limits(dir: &Path, name: &str, keep: usize, limit: u64) -> io::Result<Self> {
        Ok(Self {
            inner: Arc::new(Mutex::new(Rotation::open(dir, name, keep, limit)?)),
        })
    }

    fn lock(&self) -> io::Result<std::sync::MutexGuard<'_, Rotation>> {
        self.inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))
    }
}

impl Write for RotatingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.lock()?.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Some(file) = self.lock()?.file.as_mut() {
            file.flush()?;
        }
        Ok(())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for RotatingWriter {
    type Writer = RotatingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

fn file_stem(name: &str) -> String {
    let stem: String = name
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if stem.is_empty() {
        "paperwatch".to_string()
    } else {
        stem
    }
}
