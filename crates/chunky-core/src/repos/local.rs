use std::fs;
use std::path::{Component, Path, PathBuf};

use crossbeam_channel::Receiver;

use crate::error::{ChunkyError, Result};
use crate::repos::{Repo, RepoFile, WalkStep, WalkVisitor};

/// Repository rooted at a local directory, using `std::fs` directly.
pub struct LocalRepo {
    root: PathBuf,
}

impl LocalRepo {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the repository layout: the root plus the three object prefixes.
    pub fn create(&self) -> Result<()> {
        for dir in ["commits", "packs", "tags"] {
            fs::create_dir_all(self.root.join(dir))?;
        }
        Ok(())
    }

    /// Reject keys that could escape the repository root.
    fn validate_key(key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(ChunkyError::Validation("empty repository key".into()));
        }
        if key.starts_with('/') || key.contains('\\') {
            return Err(ChunkyError::Validation(format!(
                "unsafe repository key: '{key}'"
            )));
        }
        for component in Path::new(key).components() {
            if component == Component::ParentDir {
                return Err(ChunkyError::Validation(format!(
                    "unsafe repository key: parent traversal in '{key}'"
                )));
            }
        }
        Ok(())
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        Self::validate_key(key)?;
        Ok(self.root.join(key))
    }

    fn write_file(&self, file: &RepoFile) -> Result<()> {
        let path = self.resolve(&file.path)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, &file.data)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perm = fs::Permissions::from_mode(file.mode & 0o7777);
            let _ = fs::set_permissions(&path, perm);
        }
        Ok(())
    }

    fn walk_dir(&self, dir: &Path, visit: &mut WalkVisitor) -> Result<WalkStep> {
        let mut entries: Vec<_> = fs::read_dir(dir)?.collect::<std::io::Result<_>>()?;
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let path = entry.path();
            let is_dir = entry.file_type()?.is_dir();
            let rel = path
                .strip_prefix(&self.root)
                .map_err(|_| ChunkyError::Other("walk escaped repository root".into()))?;
            let key = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");

            match visit(&key, is_dir)? {
                WalkStep::SkipAll => return Ok(WalkStep::SkipAll),
                WalkStep::SkipSubtree => continue,
                WalkStep::Continue => {
                    if is_dir && self.walk_dir(&path, visit)? == WalkStep::SkipAll {
                        return Ok(WalkStep::SkipAll);
                    }
                }
            }
        }
        Ok(WalkStep::Continue)
    }
}

impl Repo for LocalRepo {
    fn upload(&self, files: Receiver<RepoFile>) -> Result<()> {
        for file in files.iter() {
            self.write_file(&file)?;
        }
        Ok(())
    }

    fn download(&self, path: &str) -> Result<RepoFile> {
        let full = self.resolve(path)?;
        let data = match fs::read(&full) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ChunkyError::NotFound(path.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let meta = fs::metadata(&full)?;
        #[cfg(unix)]
        let (mode, mtime) = {
            use std::os::unix::fs::MetadataExt;
            (meta.mode(), meta.mtime())
        };
        #[cfg(not(unix))]
        let (mode, mtime) = {
            let mtime = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            (0o644u32, mtime)
        };

        Ok(RepoFile {
            path: path.to_string(),
            data,
            mode,
            mtime,
        })
    }

    fn walk(&self, prefix: &str, visit: &mut WalkVisitor) -> Result<()> {
        let dir = self.resolve(prefix)?;
        match fs::metadata(&dir) {
            Ok(meta) if meta.is_dir() => {
                self.walk_dir(&dir, visit)?;
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}
