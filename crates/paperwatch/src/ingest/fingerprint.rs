//! Change-detection signatures: (mtime, size, SHA-1)
//!
//! Hashing reads the whole file, so it only happens when mtime or size
//! differ from the stored record. Identical (mtime, size) with different
//! bytes goes unnoticed.

use super::error::{IngestError, Result};
use paperwatch_db::FileRecord;
use sha1::{Digest, Sha1};
use std::fs::{File, Metadata};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Observed signature of one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub mtime_ns: i64,
    pub size: u64,
    /// Hex SHA-1
    pub sha1: String,
    /// False when the stored hash was reused
    pub rehashed: bool,
}

/// Modification time in nanoseconds since the epoch (negative before it).
pub fn mtime_ns(metadata: &Metadata) -> i64 {
    let Ok(modified) = metadata.modified() else {
        return 0;
    };
    match modified.duration_since(UNIX_EPOCH) {
        Ok(d) => i64::try_from(d.as_nanos()).unwrap_or(i64::MAX),
        Err(e) => -i64::try_from(e.duration().as_nanos()).unwrap_or(i64::MAX),
    }
}

/// Stream a file through SHA-1.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha1::new();
    let mut buf = vec![0u8; HASH_BUFFER_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Blocking fingerprint; reuses `previous.sha1` when mtime and size match.
pub fn fingerprint_blocking(path: &Path, previous: Option<&FileRecord>) -> io::Result<Fingerprint> {
    let metadata = std::fs::metadata(path)?;
    if !metadata.is_file() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "not a regular file",
        ));
    }
    let mtime_ns = mtime_ns(&metadata);
    let size = metadata.len();

    if let Some(prev) = previous {
        if let (true, Some(sha1)) = (prev.same_stat(mtime_ns, size), prev.sha1.as_ref()) {
            return Ok(Fingerprint {
                mtime_ns,
                size,
                sha1: sha1.clone(),
                rehashed: false,
            });
        }
    }

    Ok(Fingerprint {
        mtime_ns,
        size,
        sha1: hash_file(path)?,
        rehashed: true,
    })
}

/// Fingerprint on the blocking pool.
pub async fn fingerprint(path: &Path, previous: Option<FileRecord>) -> Result<Fingerprint> {
    let path: PathBuf = path.to_path_buf();
    let fp = tokio::task::spawn_blocking(move || fingerprint_blocking(&path, previous.as_ref()))
        .await?
        .map_err(IngestError::from)?;
    Ok(fp)
}
