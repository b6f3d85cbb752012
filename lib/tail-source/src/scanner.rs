//! Recursive discovery scan over the watched root.

use std::path::{Path, PathBuf};

use glob::{MatchOptions, Pattern};
use tracing::warn;

/// Finds the regular files under a root directory that should be tailed.
///
/// Exclusions are glob patterns matched against the full path; the offset
/// store and the dumper's bookkeeping directory are excluded so the pipeline
/// never ships its own state files.
pub struct Scanner {
    include_pattern: String,
    exclude_patterns: Vec<Pattern>,
    match_options: MatchOptions,
}

impl Scanner {
    /// Create a new `Scanner`.
    ///
    /// Returns `None` if the root or an exclude pattern is not expressible
    /// as a glob.
    pub fn new(root: &Path, exclude_patterns: &[PathBuf]) -> Option<Scanner> {
        let include_pattern = root.join("**").join("*").to_str()?.to_owned();

        let exclude_patterns = exclude_patterns
            .iter()
            .filter_map(|path| path.to_str().map(|path| Pattern::new(path).ok()))
            .collect::<Option<Vec<_>>>()?;

        Some(Scanner {
            include_pattern,
            exclude_patterns,
            match_options: MatchOptions::default(),
        })
    }

    /// One scan pass: every regular file under the root, minus exclusions.
    pub fn scan(&self) -> Vec<PathBuf> {
        glob::glob_with(&self.include_pattern, self.match_options)
            .map(|entries| {
                entries
                    .filter_map(|entry| {
                        entry
                            .map_err(|error| {
                                warn!(message = "Error globbing path.", %error);
                            })
                            .ok()
                    })
                    .filter(|path| path.is_file())
                    .filter(|path| {
                        path.to_str().is_some_and(|candidate| {
                            !self
                                .exclude_patterns
                                .iter()
                                .any(|exclude| exclude.matches(candidate))
                        })
                    })
                    .collect()
            })
            .unwrap_or_else(|error| {
                warn!(message = "Failed to read scan pattern.", %error);
                Vec::new()
            })
    }
}
