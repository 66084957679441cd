use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crossbeam_channel::Receiver;

use crate::error::{ChunkyError, Result};
use crate::repos::{Repo, RepoFile, WalkStep, WalkVisitor};

/// In-memory repository for tests. Thread-safe; counts downloads so tests
/// can assert on fetch amplification (single-flight, caching).
pub struct MemoryRepo {
    files: Mutex<BTreeMap<String, RepoFile>>,
    downloads: AtomicUsize,
}

impl MemoryRepo {
    pub fn new() -> Self {
        Self {
            files: Mutex::new(BTreeMap::new()),
            downloads: AtomicUsize::new(0),
        }
    }

    /// Total number of `download` calls observed.
    pub fn download_count(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.lock().unwrap().contains_key(path)
    }

    pub fn remove(&self, path: &str) {
        self.files.lock().unwrap().remove(path);
    }

    pub fn put(&self, file: RepoFile) {
        self.files.lock().unwrap().insert(file.path.clone(), file);
    }
}

impl Default for MemoryRepo {
    fn default() -> Self {
        Self::new()
    }
}

impl Repo for MemoryRepo {
    fn upload(&self, files: Receiver<RepoFile>) -> Result<()> {
        for file in files.iter() {
            self.put(file);
        }
        Ok(())
    }

    fn download(&self, path: &str) -> Result<RepoFile> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        self.files
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| ChunkyError::NotFound(path.to_string()))
    }

    fn walk(&self, prefix: &str, visit: &mut WalkVisitor) -> Result<()> {
        let want = format!("{}/", prefix.trim_end_matches('/'));
        let keys: Vec<String> = {
            let files = self.files.lock().unwrap();
            files.keys().filter(|k| k.starts_with(&want)).cloned().collect()
        };
        for key in keys {
            match visit(&key, false)? {
                WalkStep::SkipAll => break,
                _ => continue,
            }
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}
