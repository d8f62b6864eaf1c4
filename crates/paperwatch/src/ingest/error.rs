//! Error types for the ingestion engine

use std::io;
use thiserror::Error;

/// Ingestion error type
///
/// Per-file problems never surface here; they are collected as
/// [`ScanFailure`](super::ScanFailure) values in the pass summary.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Database error: {0}")]
    Database(#[from] paperwatch_db::DbError),

    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl IngestError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn invalid_path(msg: impl Into<String>) -> Self {
        Self::InvalidPath(msg.into())
    }

    /// True for a missing file or directory.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Io(e) if e.kind() == io::ErrorKind::NotFound)
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, IngestError>;
