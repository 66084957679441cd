//! The pack container: an ordered set of chunk records, MessagePack-encoded
//! and zstd-compressed on the wire. A pack is opaque at rest and addressed by
//! its time-ordered [`PackId`].

pub mod assembler;
pub mod reader;

use serde::{Deserialize, Serialize};

use crate::error::{ChunkyError, Result};
use crate::id::PackId;

/// POSIX file-type mask and the symlink type bits, as stored in chunk modes.
pub const S_IFMT: u32 = 0o170000;
pub const S_IFLNK: u32 = 0o120000;

/// Whether a stored mode describes a symbolic link.
pub fn is_symlink_mode(mode: u32) -> bool {
    mode & S_IFMT == S_IFLNK
}

/// What a chunk record holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkKind {
    /// Raw file content, addressed by the SHA-256 of its bytes.
    Blob,
    /// File metadata: path, mode, size, mtime, content hash, and either the
    /// whole body inline or references to blob chunks.
    File,
}

/// A reference from a file chunk to one of its blob chunks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRef {
    pub pack: PackId,
    pub hash: String,
}

/// One record inside a pack. Blob records carry `hash` + `data`; file
/// records carry the metadata fields and exactly one of `data` (inline body)
/// or `refs` (chunked body).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub kind: ChunkKind,
    pub hash: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub mode: u32,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub mtime: i64,
    #[serde(default)]
    pub refs: Vec<ChunkRef>,
    #[serde(default)]
    pub data: Option<Vec<u8>>,
}

impl ChunkRecord {
    pub fn blob(hash: String, data: Vec<u8>) -> Self {
        Self {
            kind: ChunkKind::Blob,
            hash,
            path: String::new(),
            mode: 0,
            size: 0,
            mtime: 0,
            refs: Vec::new(),
            data: Some(data),
        }
    }

    pub fn file(path: String, mode: u32, size: u64, mtime: i64, content_hash: String) -> Self {
        Self {
            kind: ChunkKind::File,
            hash: content_hash,
            path,
            mode,
            size,
            mtime,
            refs: Vec::new(),
            data: None,
        }
    }

    /// Lookup key inside a pack: the path for file records, the content hash
    /// for blob records.
    pub fn key(&self) -> &str {
        match self.kind {
            ChunkKind::File => &self.path,
            ChunkKind::Blob => &self.hash,
        }
    }

    pub fn is_symlink(&self) -> bool {
        is_symlink_mode(self.mode)
    }

    /// Append a reference to a blob chunk living in `pack`.
    pub fn link(&mut self, pack: PackId, blob_hash: String) {
        self.refs.push(ChunkRef {
            pack,
            hash: blob_hash,
        });
    }

    /// Rough encoded size, used to decide when a pack is full. Counts the
    /// variable-length fields plus fixed-width slots; exactness doesn't
    /// matter, monotonicity with actual size does.
    pub fn estimated_len(&self) -> u64 {
        let mut n = self.path.len() as u64 + self.hash.len() as u64;
        n += 8 + 8 + 4; // size, mtime, mode
        if let Some(data) = &self.data {
            n += data.len() as u64;
        }
        for r in &self.refs {
            n += r.pack.as_str().len() as u64 + r.hash.len() as u64;
        }
        n
    }
}

/// An ordered set of chunk records. Insertion order survives the
/// encode/decode roundtrip; lookups are linear scans, which is fine at the
/// tens-to-hundreds of records a pack holds at default sizing.
#[derive(Debug, Default)]
pub struct Pack {
    records: Vec<ChunkRecord>,
    length: u64,
    encoded_len: usize,
}

impl Pack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, record: ChunkRecord) {
        self.length += record.estimated_len();
        self.records.push(record);
    }

    /// First record whose key equals `key` (file path or blob hash).
    pub fn chunk(&self, key: &str) -> Option<&ChunkRecord> {
        self.records.iter().find(|r| r.key() == key)
    }

    pub fn records(&self) -> &[ChunkRecord] {
        &self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Estimated in-memory length of all records (pre-compression).
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Byte length of the sealed pack this was decoded from; 0 for packs
    /// built in memory. The LRU charges this as the entry weight.
    pub fn encoded_len(&self) -> usize {
        self.encoded_len
    }

    /// Serialize the records in insertion order and compress. The result is
    /// the pack file on the wire.
    pub fn seal(&self) -> Result<Vec<u8>> {
        let encoded = rmp_serde::to_vec_named(&self.records)?;
        let compressed = zstd::encode_all(encoded.as_slice(), 0)
            .map_err(|e| ChunkyError::Other(format!("zstd encode: {e}")))?;
        Ok(compressed)
    }

    /// Decode a sealed pack. Any decompression or decode failure is a
    /// corrupt-pack error; transport errors never reach here.
    pub fn decode(data: &[u8]) -> Result<Pack> {
        let decompressed = zstd::decode_all(data)
            .map_err(|e| ChunkyError::CorruptPack(format!("zstd decode: {e}")))?;
        let records: Vec<ChunkRecord> = rmp_serde::from_slice(&decompressed)
            .map_err(|e| ChunkyError::CorruptPack(format!("record decode: {e}")))?;
        let length = records.iter().map(ChunkRecord::estimated_len).sum();
        Ok(Pack {
            records,
            length,
            encoded_len: data.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_pack() -> Pack {
        let mut pack = Pack::new();
        pack.add(ChunkRecord::blob(
            crate::hash::hash_bytes(b"blob one"),
            b"blob one".to_vec(),
        ));
        pack.add(ChunkRecord::blob(
            crate::hash::hash_bytes(b"blob two"),
            b"blob two".to_vec(),
        ));
        let mut file = ChunkRecord::file(
            "dir/file.txt".into(),
            0o100644,
            16,
            1_700_000_000,
            "f00f".into(),
        );
        file.link(PackId::from("p1"), crate::hash::hash_bytes(b"blob one"));
        file.link(PackId::from("p1"), crate::hash::hash_bytes(b"blob two"));
        pack.add(file);
        pack
    }

    #[test]
    fn roundtrip_preserves_order_and_fields() {
        let pack = sample_pack();
        let sealed = pack.seal().unwrap();
        let decoded = Pack::decode(&sealed).unwrap();

        assert_eq!(decoded.records().len(), 3);
        assert_eq!(decoded.records(), pack.records());
        assert_eq!(decoded.encoded_len(), sealed.len());
    }

    #[test]
    fn lookup_by_path_and_hash() {
        let pack = sample_pack();
        let file = pack.chunk("dir/file.txt").unwrap();
        assert_eq!(file.kind, ChunkKind::File);
        assert_eq!(file.refs.len(), 2);

        let blob = pack.chunk(&crate::hash::hash_bytes(b"blob two")).unwrap();
        assert_eq!(blob.kind, ChunkKind::Blob);
        assert_eq!(blob.data.as_deref(), Some(b"blob two".as_slice()));

        assert!(pack.chunk("no/such/key").is_none());
    }

    #[test]
    fn decode_rejects_garbage() {
        let err = Pack::decode(b"definitely not zstd").unwrap_err();
        assert!(err.is_corrupt_encoding());
    }

    #[test]
    fn decode_rejects_wrong_payload() {
        // Valid zstd wrapping a non-record payload.
        let compressed = zstd::encode_all(&b"just text"[..], 0).unwrap();
        let err = Pack::decode(&compressed).unwrap_err();
        assert!(err.is_corrupt_encoding());
    }

    #[test]
    fn symlink_mode_detection() {
        assert!(is_symlink_mode(0o120755));
        assert!(!is_symlink_mode(0o100644));
        assert!(!is_symlink_mode(0o040755));
    }

    #[test]
    fn estimated_len_grows_with_content() {
        let small = ChunkRecord::blob("h".into(), vec![0; 10]);
        let big = ChunkRecord::blob("h".into(), vec![0; 1000]);
        assert!(big.estimated_len() > small.estimated_len());
    }

    #[test]
    fn empty_pack_seals_and_decodes() {
        let pack = Pack::new();
        let sealed = pack.seal().unwrap();
        let decoded = Pack::decode(&sealed).unwrap();
        assert!(decoded.is_empty());
    }
}
