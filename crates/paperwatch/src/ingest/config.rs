//! Configuration for paperwatch
//!
//! Read from `$PAPERWATCH_HOME/config.toml` (or `--config`). Every field has
//! a default, so a missing file is a valid configuration.

use super::error::{IngestError, Result};
use super::filter::FileMatcher;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Overrides `watch_dir`
pub const ENV_WATCH_DIR: &str = "PAPERWATCH_WATCH_DIR";
/// Overrides `database_path`
pub const ENV_DATABASE: &str = "PAPERWATCH_DATABASE";

/// Longest allowed retry delay (one week)
pub const MAX_RETRY_DELAY_SECS: u64 = 7 * 24 * 3600;

/// Directory names never descended into
pub const DEFAULT_EXCLUDE_DIR_NAMES: &[&str] = &[".git", "node_modules", ".cache", ".Trash"];

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperwatchConfig {
    /// Root of the watched tree
    #[serde(default = "default_watch_dir")]
    pub watch_dir: PathBuf,

    /// SQLite state database
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    #[serde(default)]
    pub scan: ScanSettings,

    #[serde(default)]
    pub retry: RetrySettings,

    #[serde(default)]
    pub watch: WatchSettings,

    #[serde(default)]
    pub resolver: ResolverSettings,
}

/// Traversal options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanSettings {
    /// Glob matched against file names, case-insensitive
    #[serde(default = "default_pattern")]
    pub pattern: String,

    #[serde(default = "default_true")]
    pub recursive: bool,

    #[serde(default)]
    pub follow_symlinks: bool,

    #[serde(default = "default_exclude_dir_names")]
    pub exclude_dir_names: Vec<String>,
}

/// Backoff and retry-queue options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,

    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,

    /// Fraction of the delay added as per-path jitter (0.0 - 1.0)
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,

    /// Maximum due entries taken per retry poll
    #[serde(default = "default_batch_limit")]
    pub batch_limit: u32,

    /// Retry poll interval in watch mode
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Attempts after which an entry is reported as stalled; unset retries forever
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

/// Live-notification options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchSettings {
    /// Quiet period before a changed file is processed
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

/// Attachment lookup options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResolverSettings {
    /// JSON export of library attachments
    #[serde(default)]
    pub index_path: Option<PathBuf>,

    /// Minimum spacing between lookups
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
}

fn default_watch_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join("Zotero").join("storage"))
        .unwrap_or_else(|| PathBuf::from("Zotero/storage"))
}

fn default_database_path() -> PathBuf {
    paperwatch_logging::paperwatch_home().join("paperwatch.sqlite3")
}

fn default_pattern() -> String {
    "*.pdf".to_string()
}

fn default_true() -> bool {
    true
}

fn default_exclude_dir_names() -> Vec<String> {
    DEFAULT_EXCLUDE_DIR_NAMES
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_base_delay_secs() -> u64 {
    5
}

fn default_max_delay_secs() -> u64 {
    60
}

fn default_jitter_ratio() -> f64 {
    0.1
}

fn default_batch_limit() -> u32 {
    50
}

fn default_poll_interval_secs() -> u64 {
    3
}

fn default_debounce_ms() -> u64 {
    500
}

fn default_min_interval_ms() -> u64 {
    1000
}

impl Default for PaperwatchConfig {
    fn default() -> Self {
        Self {
            watch_dir: default_watch_dir(),
            database_path: default_database_path(),
            scan: ScanSettings::default(),
            retry: RetrySettings::default(),
            watch: WatchSettings::default(),
            resolver: ResolverSettings::default(),
        }
    }
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            pattern: default_pattern(),
            recursive: true,
            follow_symlinks: false,
            exclude_dir_names: default_exclude_dir_names(),
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            base_delay_secs: default_base_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
            jitter_ratio: default_jitter_ratio(),
            batch_limit: default_batch_limit(),
            poll_interval_secs: default_poll_interval_secs(),
            max_attempts: None,
        }
    }
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
        }
    }
}

impl PaperwatchConfig {
    /// `$PAPERWATCH_HOME/config.toml`
    pub fn default_path() -> PathBuf {
        paperwatch_logging::paperwatch_home().join("config.toml")
    }

    /// Load, apply environment overrides, expand `~`, and validate.
    ///
    /// An explicit path must exist; the default path may be absent.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let path = Self::default_path();
                if path.exists() {
                    Self::from_file(&path)?
                } else {
                    debug!(path = %path.display(), "No config file, using defaults");
                    Self::default()
                }
            }
        };

        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.expand_paths();
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML file without overrides or validation
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            IngestError::config(format!("Cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Apply `PAPERWATCH_*` overrides through `lookup` (normally `std::env::var`).
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup(ENV_WATCH_DIR).filter(|v| !v.is_empty()) {
            self.watch_dir = PathBuf::from(dir);
        }
        if let Some(db) = lookup(ENV_DATABASE).filter(|v| !v.is_empty()) {
            self.database_path = PathBuf::from(db);
        }
    }

    /// Replace a leading `~` in every path field
    pub fn expand_paths(&mut self) {
        self.watch_dir = expand_tilde(&self.watch_dir);
        self.database_path = expand_tilde(&self.database_path);
        if let Some(index) = self.resolver.index_path.as_mut() {
            *index = expand_tilde(index);
        }
    }

    pub fn validate(&self) -> Result<()> {
        let retry = &self.retry;
        if retry.base_delay_secs == 0 {
            return Err(IngestError::config("retry.base_delay_secs must be > 0"));
        }
        if retry.max_delay_secs > MAX_RETRY_DELAY_SECS {
            return Err(IngestError::config(format!(
                "retry.max_delay_secs must be <= {}",
                MAX_RETRY_DELAY_SECS
            )));
        }
        if retry.max_delay_secs < retry.base_delay_secs {
            return Err(IngestError::config(
                "retry.max_delay_secs must be >= retry.base_delay_secs",
            ));
        }
        if !(0.0..=1.0).contains(&retry.jitter_ratio) {
            return Err(IngestError::config(
                "retry.jitter_ratio must be between 0.0 and 1.0",
            ));
        }
        if retry.batch_limit == 0 {
            return Err(IngestError::config("retry.batch_limit must be > 0"));
        }
        if retry.poll_interval_secs == 0 {
            return Err(IngestError::config("retry.poll_interval_secs must be > 0"));
        }
        if retry.max_attempts == Some(0) {
            return Err(IngestError::config("retry.max_attempts must be > 0 when set"));
        }
        self.scan.matcher()?;
        Ok(())
    }
}

impl ScanSettings {
    pub fn matcher(&self) -> Result<FileMatcher> {
        FileMatcher::new(&self.pattern, &self.exclude_dir_names)
    }
}

impl WatchSettings {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl RetrySettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

fn expand_tilde(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}
