use std::path::Path;

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use tracing::warn;

/// Patterns applied when the source tree carries no `.chunkyignore`.
const DEFAULT_IGNORES: &[&str] = &[".git", ".DS_Store"];

/// Name of the ignore file at the source root. Gitignore syntax.
pub const IGNORE_FILE: &str = ".chunkyignore";

/// Decides which source paths stay out of a snapshot. Built from the
/// source root's `.chunkyignore` when present, otherwise from the default
/// patterns.
pub struct IgnoreMatcher {
    matcher: Gitignore,
}

impl IgnoreMatcher {
    pub fn from_source_dir(dir: &Path) -> Self {
        let mut builder = GitignoreBuilder::new(dir);

        match std::fs::read_to_string(dir.join(IGNORE_FILE)) {
            Ok(contents) => {
                for line in contents.lines() {
                    if let Err(e) = builder.add_line(None, line) {
                        warn!(pattern = line, error = %e, "skipping invalid ignore pattern");
                    }
                }
            }
            Err(_) => {
                for pattern in DEFAULT_IGNORES {
                    let _ = builder.add_line(None, pattern);
                }
            }
        }

        let matcher = builder.build().unwrap_or_else(|e| {
            warn!(error = %e, "ignore matcher build failed; ignoring nothing");
            Gitignore::empty()
        });
        Self { matcher }
    }

    /// Whether a source-relative path is excluded from the snapshot.
    pub fn is_ignored(&self, rel_path: &str, is_dir: bool) -> bool {
        self.matcher.matched(rel_path, is_dir).is_ignore()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_ignore_file() {
        let dir = tempfile::tempdir().unwrap();
        let matcher = IgnoreMatcher::from_source_dir(dir.path());

        assert!(matcher.is_ignored(".git", true));
        assert!(matcher.is_ignored(".DS_Store", false));
        assert!(!matcher.is_ignored("src", true));
        assert!(!matcher.is_ignored("README.md", false));
    }

    #[test]
    fn ignore_file_replaces_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(IGNORE_FILE), "*.log\ntarget\n").unwrap();
        let matcher = IgnoreMatcher::from_source_dir(dir.path());

        assert!(matcher.is_ignored("build.log", false));
        assert!(matcher.is_ignored("target", true));
        assert!(!matcher.is_ignored(".git", true), "defaults are replaced");
    }

    #[test]
    fn nested_paths_match_patterns() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(IGNORE_FILE), "*.tmp\n").unwrap();
        let matcher = IgnoreMatcher::from_source_dir(dir.path());

        assert!(matcher.is_ignored("deep/nested/scratch.tmp", false));
        assert!(!matcher.is_ignored("deep/nested/kept.txt", false));
    }
}
