//! Commits: the manifest of one snapshot. A commit lists every file with its
//! content hash, byte size, and the pack carrying its file record. On the
//! wire a commit is `zstd(msgpack(state))` stored at `commits/<time-id>`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{ChunkyError, Result};
use crate::id::{self, PackId};
use crate::repos::{Repo, WalkStep};

/// One file inside a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub size: u64,
    pub content_hash: String,
    pub pack_id: PackId,
}

/// A snapshot manifest. Built once during an upload and never mutated after
/// sealing.
#[derive(Debug, Clone)]
pub struct Commit {
    user: String,
    created_at: DateTime<Utc>,
    size: u64,
    files: Vec<FileEntry>,
}

/// Wire form of a commit, with the integrity checksum over the file list.
#[derive(Serialize, Deserialize)]
struct CommitState {
    user: String,
    created_at: DateTime<Utc>,
    checksum: String,
    size: u64,
    files: Vec<FileEntry>,
}

impl Commit {
    pub fn new(user: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            user: user.into(),
            created_at,
            size: 0,
            files: Vec::new(),
        }
    }

    /// The commit id: its creation time as a sortable `YYYYMMDDHHMMSS` string.
    pub fn id(&self) -> String {
        id::time_id(self.created_at)
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Total byte size of all files in the snapshot.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn files(&self) -> &[FileEntry] {
        &self.files
    }

    /// Add a file. Paths are unique per commit; a duplicate is dropped.
    pub fn add(&mut self, file: FileEntry) {
        if self.files.iter().any(|f| f.path == file.path) {
            return;
        }
        self.size += file.size;
        self.files.push(file);
    }

    /// SHA-256 over the concatenated content-hash strings in list order.
    /// Detects reordering, alteration, and truncation of the file list.
    fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        for file in &self.files {
            hasher.update(file.content_hash.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// Serialize to the stored form.
    pub fn seal(&self) -> Result<Vec<u8>> {
        let state = CommitState {
            user: self.user.clone(),
            created_at: self.created_at,
            checksum: self.checksum(),
            size: self.size,
            files: self.files.clone(),
        };
        let encoded = rmp_serde::to_vec_named(&state)?;
        zstd::encode_all(encoded.as_slice(), 0)
            .map_err(|e| ChunkyError::Other(format!("zstd encode: {e}")))
    }

    /// Decode a stored commit, verifying the checksum against the
    /// recomputation. Any failure is a corrupt-commit error.
    pub fn decode(data: &[u8]) -> Result<Commit> {
        let decompressed = zstd::decode_all(data)
            .map_err(|e| ChunkyError::CorruptCommit(format!("zstd decode: {e}")))?;
        let state: CommitState = rmp_serde::from_slice(&decompressed)
            .map_err(|e| ChunkyError::CorruptCommit(format!("decode: {e}")))?;

        let commit = Commit {
            user: state.user,
            created_at: state.created_at,
            size: state.size,
            files: state.files,
        };
        if commit.checksum() != state.checksum {
            return Err(ChunkyError::CorruptCommit(format!(
                "checksum mismatch in commit {}",
                commit.id()
            )));
        }
        Ok(commit)
    }
}

/// Find a file by path. Linear scan; absence is `NotFound`.
pub fn find_file<'a>(commit: &'a Commit, path: &str) -> Result<&'a FileEntry> {
    commit
        .files
        .iter()
        .find(|f| f.path == path)
        .ok_or_else(|| ChunkyError::NotFound(format!("{path} in commit {}", commit.id())))
}

/// Resolve a revision string to a commit id: a commit id passes through if
/// the commit exists; otherwise the revision names a tag and resolves to the
/// newest commit in that tag's history.
pub fn resolve(repo: &dyn Repo, revision: &str) -> Result<String> {
    match repo.download(&format!("commits/{revision}")) {
        Ok(_) => Ok(revision.to_string()),
        Err(e) if e.is_not_found() => {
            let tag = repo.download(&format!("tags/{revision}")).map_err(|e| {
                if e.is_not_found() {
                    ChunkyError::NotFound(format!("revision '{revision}'"))
                } else {
                    e
                }
            })?;
            let text = String::from_utf8_lossy(&tag.data);
            text.lines()
                .rev()
                .find(|line| !line.trim().is_empty())
                .map(|line| line.trim().to_string())
                .ok_or_else(|| ChunkyError::NotFound(format!("revision '{revision}'")))
        }
        Err(e) => Err(e),
    }
}

/// Resolve a revision and load its commit.
pub fn read(repo: &dyn Repo, revision: &str) -> Result<Commit> {
    let commit_id = resolve(repo, revision)?;
    let file = repo.download(&format!("commits/{commit_id}"))?;
    Commit::decode(&file.data)
}

/// Load every commit in the repository, newest first.
pub fn read_all(repo: &dyn Repo) -> Result<Vec<Commit>> {
    let mut commits = Vec::new();
    repo.walk("commits", &mut |path, is_dir| {
        if is_dir {
            return Ok(WalkStep::Continue);
        }
        let file = repo.download(path)?;
        commits.push(Commit::decode(&file.data)?);
        Ok(WalkStep::Continue)
    })?;
    commits.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(commits)
}
