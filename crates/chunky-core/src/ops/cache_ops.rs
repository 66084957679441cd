use std::fs;
use std::path::Path;

use tracing::debug;

use crate::cache;
use crate::error::Result;

/// Delete the local cache directory of one repository. Missing directories
/// are fine: pruning an unknown repository is a no-op.
pub fn prune(repo_url: &str) -> Result<()> {
    let Some(dir) = cache::dir_for(repo_url) else {
        return Ok(());
    };
    match fs::remove_dir_all(&dir) {
        Ok(()) => {
            debug!(dir = %dir.display(), "pruned local cache");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Total bytes used by all per-repository caches.
pub fn total_size() -> Result<u64> {
    match cache::cache_root() {
        Some(root) => dir_size(&root),
        None => Ok(0),
    }
}

/// Recursive byte count of a directory tree. A missing root counts as zero.
pub fn dir_size(dir: &Path) -> Result<u64> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let mut total = 0u64;
    for entry in entries {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            total += dir_size(&entry.path())?;
        } else if file_type.is_file() {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dir_size_counts_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a"), vec![0u8; 100]).unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/b"), vec![0u8; 50]).unwrap();

        assert_eq!(dir_size(dir.path()).unwrap(), 150);
    }

    #[test]
    fn dir_size_of_missing_dir_is_zero() {
        assert_eq!(dir_size(Path::new("/no/such/dir/anywhere")).unwrap(), 0);
    }
}
