//! The upload pipeline: walk the source tree, hash every file, reuse entries
//! the local cache already knows, chunk and pack the rest, then publish the
//! commit and tags. Pack, commit, and tag files all flow through one bounded
//! channel drained by a pool of uploader workers; the channel's capacity is
//! the pipeline's only back-pressure.

use std::io::{Cursor, Read};
use std::path::Path;

use chrono::Utc;
use crossbeam_channel::bounded;
use tracing::debug;
use walkdir::WalkDir;

use crate::cache::LocalCache;
use crate::cancel::CancelToken;
use crate::chunker;
use crate::commit::{Commit, FileEntry};
use crate::error::{ChunkyError, Result};
use crate::hash;
use crate::ignore::IgnoreMatcher;
use crate::pack::assembler::{FileMeta, PackAssembler, DEFAULT_MAX_PACK_SIZE};
use crate::rate::RateLimiter;
use crate::repos::{Repo, RepoFile};
use crate::tags::{self, Tag, LATEST};

/// Predicate deciding which source-relative paths stay out of the snapshot.
pub type IgnorePredicate = Box<dyn Fn(&str, bool) -> bool + Send + Sync>;

pub struct UploadOptions {
    /// Recorded in the commit; defaults to the current OS user.
    pub user: Option<String>,
    /// User tags to append this commit to. `latest` is reserved.
    pub tags: Vec<String>,
    /// Overrides the `.chunkyignore`-based matcher when set.
    pub ignore: Option<IgnorePredicate>,
    pub max_pack_size: usize,
    pub min_chunk_size: usize,
    pub max_chunk_size: usize,
    /// Upload rate in bytes/sec; 0 means unlimited.
    pub limit_upload: u64,
    /// Uploader worker count; 0 means twice the CPU count.
    pub concurrency: usize,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            user: None,
            tags: Vec::new(),
            ignore: None,
            max_pack_size: DEFAULT_MAX_PACK_SIZE,
            min_chunk_size: chunker::DEFAULT_MIN_SIZE,
            max_chunk_size: chunker::DEFAULT_MAX_SIZE,
            limit_upload: 0,
            concurrency: 0,
        }
    }
}

impl UploadOptions {
    fn validate(&self) -> Result<(String, usize)> {
        if self.min_chunk_size == 0 {
            return Err(ChunkyError::Validation(
                "min chunk size must be positive".into(),
            ));
        }
        if self.min_chunk_size > self.max_chunk_size {
            return Err(ChunkyError::Validation(
                "min chunk size cannot be greater than max chunk size".into(),
            ));
        }
        if self.max_chunk_size > self.max_pack_size {
            return Err(ChunkyError::Validation(
                "max pack size cannot be less than max chunk size".into(),
            ));
        }
        for tag in &self.tags {
            if tag.is_empty() {
                return Err(ChunkyError::Validation("tag cannot be empty".into()));
            }
            if tag == LATEST {
                return Err(ChunkyError::Validation(format!(
                    "tag cannot be '{LATEST}'"
                )));
            }
        }

        let user = match &self.user {
            Some(user) if !user.is_empty() => user.clone(),
            _ => current_user(),
        };

        let concurrency = if self.concurrency > 0 {
            self.concurrency
        } else {
            2 * std::thread::available_parallelism()
                .map(usize::from)
                .unwrap_or(2)
        };

        Ok((user, concurrency))
    }
}

fn current_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Upload a directory tree as a new snapshot. Returns the new commit id.
pub fn upload(
    from: &Path,
    repo: &dyn Repo,
    cache: &mut LocalCache,
    opts: &UploadOptions,
    cancel: &CancelToken,
) -> Result<String> {
    let (user, concurrency) = opts.validate()?;

    cache.sync(repo)?;

    let created_at = Utc::now();
    let mut commit = Commit::new(user, created_at);
    let commit_id = commit.id();
    let limiter = RateLimiter::new(opts.limit_upload);

    let default_matcher = opts
        .ignore
        .is_none()
        .then(|| IgnoreMatcher::from_source_dir(from));
    let is_ignored = |rel: &str, is_dir: bool| -> bool {
        match (&opts.ignore, &default_matcher) {
            (Some(pred), _) => pred(rel, is_dir),
            (None, Some(matcher)) => matcher.is_ignored(rel, is_dir),
            (None, None) => false,
        }
    };

    let (tx, rx) = bounded::<RepoFile>(concurrency);

    std::thread::scope(|s| -> Result<()> {
        let mut workers = Vec::with_capacity(concurrency);
        for _ in 0..concurrency {
            let worker_rx = rx.clone();
            workers.push(s.spawn(move || repo.upload(worker_rx)));
        }
        drop(rx);

        let produced = (|| -> Result<()> {
            let mut assembler = PackAssembler::new(
                &tx,
                &limiter,
                cancel,
                opts.max_pack_size,
                opts.min_chunk_size,
                opts.max_chunk_size,
            );

            let walker = WalkDir::new(from)
                .follow_links(false)
                .sort_by_file_name()
                .into_iter()
                .filter_entry(|entry| {
                    let rel = rel_path(from, entry.path());
                    rel.is_empty() || !is_ignored(&rel, entry.file_type().is_dir())
                });

            for entry in walker {
                cancel.check()?;
                let entry = entry.map_err(walk_err)?;
                if entry.file_type().is_dir() {
                    continue;
                }

                let rel = rel_path(from, entry.path());
                let meta = entry.metadata().map_err(walk_err)?;
                let (mode, mtime) = mode_and_mtime(&meta, entry.file_type().is_symlink());

                // Symlink bodies are their target string.
                let link_target = if entry.file_type().is_symlink() {
                    let target = std::fs::read_link(entry.path())?;
                    Some(target.to_string_lossy().into_owned().into_bytes())
                } else {
                    None
                };
                let size = link_target
                    .as_ref()
                    .map(|t| t.len() as u64)
                    .unwrap_or_else(|| meta.len());

                let content_hash = match &link_target {
                    Some(target) => hash::stamped_hash(size, mode, target),
                    None => {
                        let mut file = std::fs::File::open(entry.path())?;
                        hash::hash_reader(size, mode, &mut file, opts.max_chunk_size)?
                    }
                };

                if let Some(cached) = cache.get(&rel, &content_hash) {
                    debug!(path = %rel, "file already in repository");
                    commit.add(cached.clone());
                    continue;
                }

                let mut reader: Box<dyn Read> = match link_target {
                    Some(target) => Box::new(Cursor::new(target)),
                    None => Box::new(std::fs::File::open(entry.path())?),
                };

                let pack_id = assembler.add_file(
                    reader.as_mut(),
                    &FileMeta {
                        path: rel.clone(),
                        mode,
                        size,
                        mtime,
                        content_hash: content_hash.clone(),
                    },
                )?;
                debug!(path = %rel, pack = %pack_id, "added file to pack");

                commit.add(FileEntry {
                    path: rel,
                    size,
                    content_hash,
                    pack_id,
                });
            }

            assembler.flush()?;

            // The commit enters the same channel after every pack, so it
            // cannot land before the packs it references are in flight.
            let commit_data = commit.seal()?;
            send(&tx, RepoFile::new(format!("commits/{commit_id}"), commit_data))?;
            cache.set(&commit)?;

            send(
                &tx,
                RepoFile::new(format!("tags/{LATEST}"), format!("{commit_id}\n").into_bytes()),
            )?;

            for name in &opts.tags {
                let mut tag = match tags::read(repo, name) {
                    Ok(tag) => tag,
                    Err(e) if e.is_not_found() => Tag::new(name.clone()),
                    Err(e) => return Err(e),
                };
                tag.commits.push(commit_id.clone());
                send(&tx, tag.file())?;
            }

            Ok(())
        })();

        drop(tx);

        let mut first_error = produced.err();
        for worker in workers {
            match worker.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(_) => {
                    first_error.get_or_insert(ChunkyError::Other("uploader panicked".into()));
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    })?;

    Ok(commit_id)
}

fn send(tx: &crossbeam_channel::Sender<RepoFile>, file: RepoFile) -> Result<()> {
    tx.send(file)
        .map_err(|_| ChunkyError::Other("upload channel closed".into()))
}

fn rel_path(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn walk_err(e: walkdir::Error) -> ChunkyError {
    match e.into_io_error() {
        Some(io) => ChunkyError::Io(io),
        None => ChunkyError::Other("walk encountered a filesystem loop".into()),
    }
}

#[cfg(unix)]
fn mode_and_mtime(meta: &std::fs::Metadata, _is_symlink: bool) -> (u32, i64) {
    use std::os::unix::fs::MetadataExt;
    (meta.mode(), meta.mtime())
}

#[cfg(not(unix))]
fn mode_and_mtime(meta: &std::fs::Metadata, is_symlink: bool) -> (u32, i64) {
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    let mode = if is_symlink { 0o120644 } else { 0o100644 };
    (mode, mtime)
}
