//! Per-repository local cache of commit manifests.
//!
//! One file per known commit, named by commit id, content identical to the
//! repository's `commits/<id>` object. The in-memory index maps
//! `(path, content_hash)` to the commit file entry, which is what lets a
//! re-upload of an unchanged file skip chunking and packing entirely: the
//! entry's `pack_id` is known to still exist because its commit still exists.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::commit::{Commit, FileEntry};
use crate::error::Result;
use crate::repos::{self, Repo, WalkStep};

/// Root of all per-repository caches: `${user_cache_dir}/chunky`.
pub fn cache_root() -> Option<PathBuf> {
    dirs::cache_dir().map(|base| base.join("chunky"))
}

/// Cache directory for one repository, keyed by the slug of its URL.
pub fn dir_for(repo_url: &str) -> Option<PathBuf> {
    cache_root().map(|root| root.join(repos::slug(repo_url)))
}

pub struct LocalCache {
    dir: PathBuf,
    commits: HashMap<String, Commit>,
    files: HashMap<(String, String), FileEntry>,
}

impl LocalCache {
    /// Open (and create if missing) a cache directory, loading every stored
    /// commit. A commit file that fails to decode is deleted and skipped —
    /// the cache is a replica and will re-download it on the next sync. I/O
    /// errors propagate.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let mut cache = Self {
            dir,
            commits: HashMap::new(),
            files: HashMap::new(),
        };

        let mut entries: Vec<_> = fs::read_dir(&cache.dir)?.collect::<std::io::Result<_>>()?;
        entries.sort_by_key(|e| e.file_name());
        for entry in entries {
            if entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let data = fs::read(entry.path())?;
            match Commit::decode(&data) {
                Ok(commit) => cache.index(name, commit),
                Err(e) if e.is_corrupt_encoding() => {
                    warn!(commit = %name, error = %e, "dropping corrupt cache entry");
                    fs::remove_file(entry.path())?;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(cache)
    }

    /// Open the cache for a repository URL under the user cache directory.
    pub fn open_for(repo_url: &str) -> Result<Self> {
        let dir = dir_for(repo_url).ok_or_else(|| {
            crate::ChunkyError::Other("no user cache directory on this platform".into())
        })?;
        Self::open(dir)
    }

    fn index(&mut self, commit_id: String, commit: Commit) {
        for file in commit.files() {
            self.files.insert(
                (file.path.clone(), file.content_hash.clone()),
                file.clone(),
            );
        }
        self.commits.insert(commit_id, commit);
    }

    /// Bring the cache in line with the repository: download commits we do
    /// not have, drop commits the repository no longer has (from disk and
    /// from both indexes).
    pub fn sync(&mut self, repo: &dyn Repo) -> Result<()> {
        let mut seen: HashMap<String, bool> =
            self.commits.keys().map(|id| (id.clone(), false)).collect();

        repo.walk("commits", &mut |path, is_dir| {
            if is_dir {
                return Ok(WalkStep::Continue);
            }
            let commit_id = path.rsplit('/').next().unwrap_or(path).to_string();
            if let Some(flag) = seen.get_mut(&commit_id) {
                *flag = true;
                return Ok(WalkStep::Continue);
            }
            seen.insert(commit_id.clone(), true);

            let file = repo.download(path)?;
            let commit = Commit::decode(&file.data)?;
            fs::write(self.dir.join(&commit_id), &file.data)?;
            debug!(commit = %commit_id, "cached commit");
            self.index(commit_id, commit);
            Ok(WalkStep::Continue)
        })?;

        for (commit_id, was_seen) in seen {
            if was_seen {
                continue;
            }
            match fs::remove_file(self.dir.join(&commit_id)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            if let Some(commit) = self.commits.remove(&commit_id) {
                for file in commit.files() {
                    self.files
                        .remove(&(file.path.clone(), file.content_hash.clone()));
                }
            }
            debug!(commit = %commit_id, "dropped vanished commit from cache");
        }

        Ok(())
    }

    /// Exact-match lookup on both path and content hash. The narrow key is
    /// deliberate: it guarantees the entry's pack still exists and avoids
    /// aliasing content across paths.
    pub fn get(&self, path: &str, content_hash: &str) -> Option<&FileEntry> {
        self.files
            .get(&(path.to_string(), content_hash.to_string()))
    }

    /// Record a freshly uploaded commit.
    pub fn set(&mut self, commit: &Commit) -> Result<()> {
        let commit_id = commit.id();
        if self.commits.contains_key(&commit_id) {
            return Ok(());
        }
        let data = commit.seal()?;
        fs::write(self.dir.join(&commit_id), data)?;
        self.index(commit_id, commit.clone());
        Ok(())
    }

    pub fn commit_count(&self) -> usize {
        self.commits.len()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
