//! File-name pattern and excluded-directory matching

use super::error::{IngestError, Result};
use globset::{GlobBuilder, GlobMatcher};
use std::collections::HashSet;
use std::path::{Component, Path};

/// Decides which files are ingestion candidates.
///
/// The glob is matched case-insensitively against the file name only;
/// excluded names are matched against each directory component.
#[derive(Debug, Clone)]
pub struct FileMatcher {
    pattern: String,
    glob: GlobMatcher,
    exclude_dir_names: HashSet<String>,
}

impl FileMatcher {
    pub fn new(pattern: &str, exclude_dir_names: &[String]) -> Result<Self> {
        let glob = GlobBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| IngestError::config(format!("Invalid pattern '{}': {}", pattern, e)))?
            .compile_matcher();
        Ok(Self {
            pattern: pattern.to_string(),
            glob,
            exclude_dir_names: exclude_dir_names.iter().cloned().collect(),
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Whether the file name matches the pattern
    pub fn matches_file(&self, path: &Path) -> bool {
        path.file_name()
            .map(|name| self.glob.is_match(Path::new(name)))
            .unwrap_or(false)
    }

    pub fn is_excluded_dir(&self, name: &str) -> bool {
        self.exclude_dir_names.contains(name)
    }

    /// Full check for a path reported from below `root`: inside the root,
    /// no excluded directory on the way, and a matching file name.
    pub fn accepts(&self, root: &Path, path: &Path) -> bool {
        let Ok(relative) = path.strip_prefix(root) else {
            return false;
        };
        let mut components: Vec<Component<'_>> = relative.components().collect();
        // Last component is the file itself
        components.pop();
        let excluded = components.iter().any(|c| match c {
            Component::Normal(name) => self.is_excluded_dir(&name.to_string_lossy()),
            _ => false,
        });
        !excluded && self.matches_file(path)
    }
}
