//! The download pipeline: resolve a revision, then reconstruct every file in
//! its commit from packs, in parallel batches with first-error cancellation.
//! Every reconstructed file is verified against the commit's recorded
//! content hash before the pipeline reports success.

use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

use filetime::FileTime;
use tracing::debug;

use crate::cancel::CancelToken;
use crate::commit::{self, FileEntry};
use crate::error::{ChunkyError, Result};
use crate::hash::{self, StampedHasher};
use crate::pack::reader::{PackReader, DEFAULT_MAX_CACHE_BYTES};
use crate::pack::ChunkRecord;
use crate::repos::Repo;

#[derive(Debug, Clone)]
pub struct DownloadOptions {
    /// Byte budget of the decoded-pack LRU.
    pub max_cache_size: u64,
    /// Download rate in bytes/sec; 0 means unlimited.
    pub limit_download: u64,
    /// Files restored in parallel per batch; 0 means all at once.
    pub concurrency: usize,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            max_cache_size: DEFAULT_MAX_CACHE_BYTES,
            limit_download: 0,
            concurrency: 0,
        }
    }
}

/// Materialize the snapshot named by `revision` into the directory `to`.
pub fn download(
    repo: &dyn Repo,
    to: &Path,
    revision: &str,
    opts: &DownloadOptions,
    cancel: &CancelToken,
) -> Result<()> {
    let commit = commit::read(repo, revision)?;
    let reader = PackReader::new(opts.max_cache_size, opts.limit_download);
    fs::create_dir_all(to)?;

    let batch_size = if opts.concurrency == 0 {
        commit.files().len().max(1)
    } else {
        opts.concurrency
    };

    let first_error: Mutex<Option<ChunkyError>> = Mutex::new(None);

    for batch in commit.files().chunks(batch_size) {
        if cancel.is_canceled() {
            break;
        }
        std::thread::scope(|s| {
            for cf in batch {
                let reader = &reader;
                let first_error = &first_error;
                s.spawn(move || {
                    if cancel.is_canceled() {
                        return;
                    }
                    if let Err(e) = download_file(repo, reader, to, cf, cancel) {
                        let mut slot = first_error.lock().unwrap();
                        if slot.is_none() {
                            *slot = Some(e);
                        }
                        cancel.cancel();
                    }
                });
            }
        });
    }

    if let Some(e) = first_error.into_inner().unwrap() {
        return Err(e);
    }
    cancel.check()?;
    debug!(revision, files = commit.files().len(), "download complete");
    Ok(())
}

fn download_file(
    repo: &dyn Repo,
    reader: &PackReader,
    to: &Path,
    cf: &FileEntry,
    cancel: &CancelToken,
) -> Result<()> {
    let pack = reader.read(repo, &cf.pack_id, cancel)?;
    let fc = pack.chunk(&cf.path).ok_or_else(|| {
        ChunkyError::CorruptPack(format!(
            "file '{}' missing from pack {}",
            cf.path, cf.pack_id
        ))
    })?;

    let target = to.join(sanitize_rel_path(&fc.path)?);

    if fc.is_symlink() {
        return write_symlink(fc, &target);
    }

    let mut file = open_target(&target, fc.mode)?;

    if fc.data.is_some() || fc.size == 0 {
        let data = fc.data.as_deref().unwrap_or_default();
        if hash::stamped_hash(fc.size, fc.mode, data) != fc.hash {
            return Err(ChunkyError::HashMismatch(cf.path.clone()));
        }
        file.write_all(data)?;
    } else {
        let mut hasher = StampedHasher::new(fc.size, fc.mode);
        for r in &fc.refs {
            let blob_pack = reader.read(repo, &r.pack, cancel)?;
            let bc = blob_pack.chunk(&r.hash).ok_or_else(|| {
                ChunkyError::CorruptPack(format!("blob {} missing from pack {}", r.hash, r.pack))
            })?;
            let data = bc.data.as_deref().unwrap_or_default();
            file.write_all(data)?;
            hasher.update(data);
        }
        if hasher.finish() != fc.hash {
            return Err(ChunkyError::HashMismatch(cf.path.clone()));
        }
    }

    file.flush()?;
    drop(file);

    apply_permissions(&target, fc.mode);
    let _ = filetime::set_file_mtime(&target, FileTime::from_unix_time(fc.mtime, 0));
    Ok(())
}

/// Stream one file from a snapshot to a writer, with the same hash
/// verification as a full download but no filesystem target.
pub fn cat(
    repo: &dyn Repo,
    revision: &str,
    path: &str,
    out: &mut dyn Write,
    opts: &DownloadOptions,
    cancel: &CancelToken,
) -> Result<()> {
    let commit = commit::read(repo, revision)?;
    let cf = commit::find_file(&commit, path)?;
    let reader = PackReader::new(opts.max_cache_size, opts.limit_download);

    let pack = reader.read(repo, &cf.pack_id, cancel)?;
    let fc = pack.chunk(&cf.path).ok_or_else(|| {
        ChunkyError::CorruptPack(format!(
            "file '{}' missing from pack {}",
            cf.path, cf.pack_id
        ))
    })?;

    if fc.data.is_some() || fc.size == 0 {
        let data = fc.data.as_deref().unwrap_or_default();
        if hash::stamped_hash(fc.size, fc.mode, data) != fc.hash {
            return Err(ChunkyError::HashMismatch(cf.path.clone()));
        }
        out.write_all(data)?;
        return Ok(());
    }

    let mut hasher = StampedHasher::new(fc.size, fc.mode);
    for r in &fc.refs {
        let blob_pack = reader.read(repo, &r.pack, cancel)?;
        let bc = blob_pack.chunk(&r.hash).ok_or_else(|| {
            ChunkyError::CorruptPack(format!("blob {} missing from pack {}", r.hash, r.pack))
        })?;
        let data = bc.data.as_deref().unwrap_or_default();
        out.write_all(data)?;
        hasher.update(data);
    }
    if hasher.finish() != fc.hash {
        return Err(ChunkyError::HashMismatch(cf.path.clone()));
    }
    Ok(())
}

#[cfg(unix)]
fn write_symlink(fc: &ChunkRecord, target: &Path) -> Result<()> {
    let link_target = String::from_utf8_lossy(fc.data.as_deref().unwrap_or_default()).to_string();
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    // Symlink creation fails on an existing target; replace it.
    let _ = fs::remove_file(target);
    std::os::unix::fs::symlink(&link_target, target)?;
    Ok(())
}

#[cfg(not(unix))]
fn write_symlink(fc: &ChunkRecord, _target: &Path) -> Result<()> {
    Err(ChunkyError::Other(format!(
        "cannot restore symlink '{}' on this platform",
        fc.path
    )))
}

fn open_target(target: &Path, mode: u32) -> Result<fs::File> {
    match try_open(target, mode) {
        Ok(file) => Ok(file),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            Ok(try_open(target, mode)?)
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(unix)]
fn try_open(target: &Path, mode: u32) -> std::io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode & 0o7777)
        .open(target)
}

#[cfg(not(unix))]
fn try_open(target: &Path, _mode: u32) -> std::io::Result<fs::File> {
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(target)
}

#[cfg(unix)]
fn apply_permissions(target: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    let _ = fs::set_permissions(target, fs::Permissions::from_mode(mode & 0o7777));
}

#[cfg(not(unix))]
fn apply_permissions(_target: &Path, _mode: u32) {}

/// Reject commit paths that would escape the destination directory.
fn sanitize_rel_path(raw: &str) -> Result<PathBuf> {
    let path = Path::new(raw);
    if path.is_absolute() {
        return Err(ChunkyError::Validation(format!(
            "refusing to write absolute path: {raw}"
        )));
    }
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ChunkyError::Validation(format!(
                    "refusing to write unsafe path: {raw}"
                )));
            }
        }
    }
    if out.as_os_str().is_empty() {
        return Err(ChunkyError::Validation(format!(
            "refusing to write empty path: {raw}"
        )));
    }
    Ok(out)
}
