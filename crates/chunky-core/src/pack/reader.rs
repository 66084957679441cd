use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use crate::cancel::CancelToken;
use crate::error::{ChunkyError, Result};
use crate::id::PackId;
use crate::lru::PackCache;
use crate::pack::Pack;
use crate::rate::RateLimiter;
use crate::repos::Repo;
use crate::singleflight::Group;

/// Default pack cache budget (512 MiB).
pub const DEFAULT_MAX_CACHE_BYTES: u64 = 512 * 1024 * 1024;

type FetchResult = std::result::Result<Arc<Pack>, Arc<ChunkyError>>;

/// Caching, single-flight, rate-limited pack fetcher.
///
/// Concurrent reads of the same pack id share one underlying download; all
/// callers receive the identical decoded [`Pack`]. Decoded packs live in a
/// byte-budgeted LRU and are handed out as shared references, so eviction
/// never invalidates a pack a reader is still using.
pub struct PackReader {
    cache: PackCache,
    group: Group<PackId, FetchResult>,
    limiter: RateLimiter,
}

impl PackReader {
    /// `max_cache_bytes == 0` means unbounded; `rate == 0` means no
    /// download throttling.
    pub fn new(max_cache_bytes: u64, rate: u64) -> Self {
        Self {
            cache: PackCache::new(max_cache_bytes),
            group: Group::new(),
            limiter: RateLimiter::new(rate),
        }
    }

    pub fn read(&self, repo: &dyn Repo, id: &PackId, cancel: &CancelToken) -> Result<Arc<Pack>> {
        if let Some(pack) = self.cache.get(id) {
            return Ok(pack);
        }

        let (result, _leader) = self.group.run(id.clone(), || {
            // Re-check under the flight: a fetch that completed between the
            // miss above and entering the group has already populated the
            // cache, and the insert happens before the flight resolves.
            if let Some(pack) = self.cache.get(id) {
                return Ok(pack);
            }
            match self.fetch(repo, id, cancel) {
                Ok(pack) => {
                    let pack = Arc::new(pack);
                    self.cache.insert(id.clone(), Arc::clone(&pack));
                    Ok(pack)
                }
                Err(e) => Err(Arc::new(e)),
            }
        });

        result.map_err(ChunkyError::Shared)
    }

    fn fetch(&self, repo: &dyn Repo, id: &PackId, cancel: &CancelToken) -> Result<Pack> {
        let start = Instant::now();
        let file = repo.download(&id.storage_key())?;
        self.limiter.acquire(file.data.len() as u64, cancel)?;
        let pack = Pack::decode(&file.data)?;
        debug!(
            pack = %id,
            bytes = file.data.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "downloaded pack"
        );
        Ok(pack)
    }

    pub fn cached_bytes(&self) -> u64 {
        self.cache.used_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack::ChunkRecord;
    use crate::repos::{upload_one, RepoFile};
    use crate::testutil::MemoryRepo;
    use std::sync::Barrier;

    fn store_pack(repo: &MemoryRepo, id: &PackId, payload: &[u8]) {
        let mut pack = Pack::new();
        pack.add(ChunkRecord::blob(
            crate::hash::hash_bytes(payload),
            payload.to_vec(),
        ));
        upload_one(
            repo,
            RepoFile::new(id.storage_key(), pack.seal().unwrap()),
        )
        .unwrap();
    }

    #[test]
    fn cold_read_fetches_and_caches() {
        let repo = MemoryRepo::new();
        let id = PackId::from("pack-a");
        store_pack(&repo, &id, b"payload");

        let reader = PackReader::new(0, 0);
        let cancel = CancelToken::new();

        let first = reader.read(&repo, &id, &cancel).unwrap();
        assert_eq!(repo.download_count(), 1);

        let second = reader.read(&repo, &id, &cancel).unwrap();
        assert_eq!(repo.download_count(), 1, "warm read must not refetch");
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn missing_pack_surfaces_not_found() {
        let repo = MemoryRepo::new();
        let reader = PackReader::new(0, 0);
        let err = reader
            .read(&repo, &PackId::from("ghost"), &CancelToken::new())
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn corrupt_pack_surfaces_decode_error() {
        let repo = MemoryRepo::new();
        let id = PackId::from("bad");
        upload_one(&repo, RepoFile::new(id.storage_key(), b"garbage".to_vec())).unwrap();

        let reader = PackReader::new(0, 0);
        let err = reader.read(&repo, &id, &CancelToken::new()).unwrap_err();
        assert!(err.is_corrupt_encoding());
    }

    #[test]
    fn concurrent_cold_reads_download_once() {
        const THREADS: usize = 8;
        let repo = Arc::new(MemoryRepo::new());
        let id = PackId::from("pack-shared");
        store_pack(&repo, &id, &vec![7u8; 200_000]);

        let reader = Arc::new(PackReader::new(0, 0));
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let repo = Arc::clone(&repo);
                let reader = Arc::clone(&reader);
                let barrier = Arc::clone(&barrier);
                let id = id.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    reader.read(repo.as_ref(), &id, &CancelToken::new()).unwrap()
                })
            })
            .collect();

        let packs: Vec<Arc<Pack>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(
            repo.download_count(),
            1,
            "single-flight must collapse concurrent fetches"
        );
        for pack in &packs[1..] {
            assert!(Arc::ptr_eq(&packs[0], pack));
        }
    }

    #[test]
    fn eviction_forces_refetch() {
        let repo = MemoryRepo::new();
        let id1 = PackId::from("pack-1");
        let id2 = PackId::from("pack-2");
        // Incompressible payloads so each sealed pack exceeds half the budget.
        let noise: Vec<u8> = (0..0x4000u32).flat_map(|i| i.to_le_bytes()).collect();
        store_pack(&repo, &id1, &noise);
        store_pack(&repo, &id2, &noise[1..]);

        let pack1_len = repo.download(&id1.storage_key()).unwrap().data.len();
        let budget = pack1_len as u64 + 64;
        let counted_before = repo.download_count();

        let reader = PackReader::new(budget, 0);
        let cancel = CancelToken::new();
        reader.read(&repo, &id1, &cancel).unwrap();
        reader.read(&repo, &id2, &cancel).unwrap();
        // pack-1 was evicted; reading it again costs a download.
        reader.read(&repo, &id1, &cancel).unwrap();
        assert_eq!(repo.download_count() - counted_before, 3);
    }
}
