use std::io::Read;
use std::time::Instant;

use crossbeam_channel::Sender;
use tracing::debug;

use crate::cancel::CancelToken;
use crate::chunker::Chunker;
use crate::error::{ChunkyError, Result};
use crate::hash;
use crate::id::PackId;
use crate::pack::{ChunkRecord, Pack};
use crate::rate::RateLimiter;
use crate::repos::RepoFile;

/// Default maximum sealed-pack size (32 MiB, pre-compression estimate).
pub const DEFAULT_MAX_PACK_SIZE: usize = 32 * 1024 * 1024;

/// Metadata of a file entering the pack stream.
#[derive(Debug, Clone)]
pub struct FileMeta {
    pub path: String,
    pub mode: u32,
    pub size: u64,
    pub mtime: i64,
    pub content_hash: String,
}

/// Accumulates chunk records into an in-flight pack and emits sealed packs
/// into the upload channel whenever the next insertion would overflow
/// `max_pack_size`. The assembler owns exactly one pack at a time; sealed
/// byte buffers pass ownership to an uploader through the channel.
pub struct PackAssembler<'a> {
    uploads: &'a Sender<RepoFile>,
    limiter: &'a RateLimiter,
    cancel: &'a CancelToken,

    max_pack_size: u64,
    min_chunk_size: usize,
    max_chunk_size: usize,

    current: Pack,
    current_id: PackId,
}

impl<'a> PackAssembler<'a> {
    pub fn new(
        uploads: &'a Sender<RepoFile>,
        limiter: &'a RateLimiter,
        cancel: &'a CancelToken,
        max_pack_size: usize,
        min_chunk_size: usize,
        max_chunk_size: usize,
    ) -> Self {
        Self {
            uploads,
            limiter,
            cancel,
            max_pack_size: max_pack_size as u64,
            min_chunk_size,
            max_chunk_size,
            current: Pack::new(),
            current_id: PackId::generate(),
        }
    }

    /// Add one file to the stream. Returns the id of the pack holding the
    /// file's metadata record; its blob records may live in earlier packs.
    ///
    /// Bodies smaller than `max_chunk_size` are stored inline in the file
    /// record; larger bodies run through the content-defined chunker and the
    /// file record carries `(pack, hash)` references instead.
    pub fn add_file(&mut self, reader: &mut dyn Read, meta: &FileMeta) -> Result<PackId> {
        let mut file_rec = ChunkRecord::file(
            meta.path.clone(),
            meta.mode,
            meta.size,
            meta.mtime,
            meta.content_hash.clone(),
        );

        if file_rec.estimated_len() + meta.size < self.max_chunk_size as u64 {
            let mut data = Vec::with_capacity(meta.size as usize);
            reader.read_to_end(&mut data)?;
            file_rec.data = Some(data);
            self.maybe_flush(file_rec.estimated_len())?;
            self.current.add(file_rec);
            return Ok(self.current_id.clone());
        }

        let mut chunker = Chunker::with_bounds(reader, self.min_chunk_size, self.max_chunk_size);
        while let Some(chunk) = chunker.next_chunk()? {
            let blob_hash = hash::hash_bytes(&chunk.data);
            let blob = ChunkRecord::blob(blob_hash.clone(), chunk.data);
            self.maybe_flush(blob.estimated_len())?;
            file_rec.link(self.current_id.clone(), blob_hash);
            self.current.add(blob);
        }

        self.maybe_flush(file_rec.estimated_len())?;
        self.current.add(file_rec);
        Ok(self.current_id.clone())
    }

    /// Seal and emit the current pack if inserting `next_len` more bytes
    /// would overflow it.
    fn maybe_flush(&mut self, next_len: u64) -> Result<()> {
        if self.current.length() + next_len < self.max_pack_size {
            return Ok(());
        }
        self.flush()
    }

    /// Unconditionally seal and emit the current pack if non-empty. Must be
    /// called once after the last `add_file` of an upload.
    pub fn flush(&mut self) -> Result<()> {
        if self.current.is_empty() {
            return Ok(());
        }

        let start = Instant::now();
        let data = self.current.seal()?;
        self.limiter.acquire(data.len() as u64, self.cancel)?;
        self.cancel.check()?;

        let path = self.current_id.storage_key();
        let size = data.len();
        self.uploads
            .send(RepoFile::new(path.clone(), data))
            .map_err(|_| ChunkyError::Other("upload channel closed".into()))?;

        debug!(
            path = %path,
            bytes = size,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "emitted pack"
        );

        self.current = Pack::new();
        self.current_id = PackId::generate();
        Ok(())
    }

    /// Id of the in-flight pack.
    pub fn current_id(&self) -> &PackId {
        &self.current_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack::ChunkKind;
    use std::io::Cursor;

    fn collect_assembler_output<F>(
        max_pack: usize,
        min_chunk: usize,
        max_chunk: usize,
        run: F,
    ) -> Vec<RepoFile>
    where
        F: FnOnce(&mut PackAssembler),
    {
        let (tx, rx) = crossbeam_channel::unbounded();
        let limiter = RateLimiter::new(0);
        let cancel = CancelToken::new();
        {
            let mut assembler =
                PackAssembler::new(&tx, &limiter, &cancel, max_pack, min_chunk, max_chunk);
            run(&mut assembler);
            assembler.flush().unwrap();
        }
        drop(tx);
        rx.iter().collect()
    }

    fn meta_for(path: &str, body: &[u8]) -> FileMeta {
        FileMeta {
            path: path.into(),
            mode: 0o100644,
            size: body.len() as u64,
            mtime: 1_700_000_000,
            content_hash: hash::stamped_hash(body.len() as u64, 0o100644, body),
        }
    }

    #[test]
    fn small_file_is_inlined() {
        let body = b"small body".to_vec();
        let files = collect_assembler_output(1 << 20, 1 << 10, 1 << 16, |assembler| {
            assembler
                .add_file(&mut Cursor::new(&body), &meta_for("a.txt", &body))
                .unwrap();
        });

        assert_eq!(files.len(), 1);
        let pack = Pack::decode(&files[0].data).unwrap();
        assert_eq!(pack.records().len(), 1);
        let rec = &pack.records()[0];
        assert_eq!(rec.kind, ChunkKind::File);
        assert_eq!(rec.data.as_deref(), Some(body.as_slice()));
        assert!(rec.refs.is_empty());
    }

    #[test]
    fn large_file_is_chunked_with_refs() {
        // Deterministic noisy body well above max_chunk_size.
        let body: Vec<u8> = {
            let mut seed = 0x1234_5678_u64;
            (0..200 * 1024)
                .map(|_| {
                    seed ^= seed << 13;
                    seed ^= seed >> 7;
                    seed ^= seed << 17;
                    seed as u8
                })
                .collect()
        };
        let files = collect_assembler_output(1 << 22, 8 * 1024, 32 * 1024, |assembler| {
            assembler
                .add_file(&mut Cursor::new(&body), &meta_for("big.bin", &body))
                .unwrap();
        });

        assert_eq!(files.len(), 1);
        let pack = Pack::decode(&files[0].data).unwrap();
        let file_rec = pack.chunk("big.bin").unwrap();
        assert!(file_rec.data.is_none());
        assert!(file_rec.refs.len() > 1);

        // Blob data in ref order reassembles the body.
        let mut joined = Vec::new();
        for r in &file_rec.refs {
            let blob = pack.chunk(&r.hash).unwrap();
            joined.extend_from_slice(blob.data.as_deref().unwrap());
        }
        assert_eq!(joined, body);
    }

    #[test]
    fn pack_overflow_emits_multiple_packs() {
        let body_a = vec![0xAAu8; 6 * 1024];
        let body_b = vec![0xBBu8; 6 * 1024];
        // max_pack_size of 8 KiB forces the second file into a new pack.
        let files = collect_assembler_output(8 * 1024, 1 << 10, 64 * 1024, |assembler| {
            let first = assembler
                .add_file(&mut Cursor::new(&body_a), &meta_for("a.bin", &body_a))
                .unwrap();
            let second = assembler
                .add_file(&mut Cursor::new(&body_b), &meta_for("b.bin", &body_b))
                .unwrap();
            assert_ne!(first, second, "overflow must rotate the pack id");
        });

        assert_eq!(files.len(), 2);
        for file in &files {
            assert!(file.path.starts_with("packs/"));
        }
    }

    #[test]
    fn refs_record_the_pack_current_at_emission() {
        // Tiny pack budget: every blob overflows into a fresh pack, so the
        // file record's refs must span several pack ids.
        let body: Vec<u8> = (0..96 * 1024).map(|i| (i * 31 % 251) as u8).collect();
        let files = collect_assembler_output(12 * 1024, 4 * 1024, 16 * 1024, |assembler| {
            assembler
                .add_file(&mut Cursor::new(&body), &meta_for("spread.bin", &body))
                .unwrap();
        });
        assert!(files.len() > 1);

        // Locate the file record and verify every ref resolves in the pack
        // it names.
        let packs: Vec<(String, Pack)> = files
            .iter()
            .map(|f| {
                (
                    f.path.trim_start_matches("packs/").to_string(),
                    Pack::decode(&f.data).unwrap(),
                )
            })
            .collect();
        let file_rec = packs
            .iter()
            .find_map(|(_, p)| p.chunk("spread.bin"))
            .expect("file record must be in some pack");

        let mut joined = Vec::new();
        for r in &file_rec.refs {
            let (_, pack) = packs
                .iter()
                .find(|(id, _)| *id == r.pack.as_str())
                .expect("ref names an emitted pack");
            joined.extend_from_slice(pack.chunk(&r.hash).unwrap().data.as_deref().unwrap());
        }
        assert_eq!(joined, body);
    }

    #[test]
    fn empty_file_is_inline_with_no_refs() {
        let files = collect_assembler_output(1 << 20, 1 << 10, 1 << 16, |assembler| {
            assembler
                .add_file(&mut Cursor::new(&[]), &meta_for("empty.txt", &[]))
                .unwrap();
        });
        let pack = Pack::decode(&files[0].data).unwrap();
        let rec = pack.chunk("empty.txt").unwrap();
        assert_eq!(rec.size, 0);
        assert_eq!(rec.data.as_deref(), Some(&[] as &[u8]));
        assert!(rec.refs.is_empty());
    }

    #[test]
    fn flush_on_empty_pack_is_a_no_op() {
        let files = collect_assembler_output(1 << 20, 1 << 10, 1 << 16, |assembler| {
            assembler.flush().unwrap();
        });
        assert!(files.is_empty());
    }
}
