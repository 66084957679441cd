use std::io::Read;

use sha2::{Digest, Sha256};

use crate::error::Result;

/// SHA-256 of a byte slice, hex-lowercase. Used for blob chunk identities.
pub fn hash_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// The metadata stamp fed into a file's content hash before its body bytes.
/// Including size and mode means a chmod produces a new content identity
/// without the body changing.
pub fn stamp(size: u64, mode: u32) -> String {
    format!("{size}:{mode}")
}

/// SHA-256 over stamp-then-body, hex-lowercase. The content identity of a
/// whole file (or symlink, whose body is the link target).
pub fn stamped_hash(size: u64, mode: u32, body: &[u8]) -> String {
    let mut hasher = StampedHasher::new(size, mode);
    hasher.update(body);
    hasher.finish()
}

/// Incremental stamped hash, for verifying a file reassembled blob-by-blob.
pub struct StampedHasher {
    inner: Sha256,
}

impl StampedHasher {
    pub fn new(size: u64, mode: u32) -> Self {
        let mut inner = Sha256::new();
        inner.update(stamp(size, mode).as_bytes());
        Self { inner }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    pub fn finish(self) -> String {
        hex::encode(self.inner.finalize())
    }
}

/// Stamped hash of a reader's contents, read through a bounded buffer so
/// large files never fully materialize for hashing.
pub fn hash_reader(size: u64, mode: u32, reader: &mut dyn Read, buf_size: usize) -> Result<String> {
    let mut hasher = StampedHasher::new(size, mode);
    let mut buf = vec![0u8; buf_size.max(4096)];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn blob_hash_is_plain_sha256() {
        // echo -n "hello" | sha256sum
        assert_eq!(
            hash_bytes(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn stamp_orders_size_then_mode() {
        assert_eq!(stamp(21, 0o644), "21:420");
    }

    #[test]
    fn stamped_hash_differs_from_plain() {
        assert_ne!(stamped_hash(5, 0o644, b"hello"), hash_bytes(b"hello"));
    }

    #[test]
    fn mode_change_changes_identity() {
        let a = stamped_hash(5, 0o644, b"hello");
        let b = stamped_hash(5, 0o755, b"hello");
        assert_ne!(a, b);
    }

    #[test]
    fn incremental_matches_one_shot() {
        let body = b"the quick brown fox jumps over the lazy dog";
        let mut hasher = StampedHasher::new(body.len() as u64, 0o644);
        for piece in body.chunks(7) {
            hasher.update(piece);
        }
        assert_eq!(
            hasher.finish(),
            stamped_hash(body.len() as u64, 0o644, body)
        );
    }

    #[test]
    fn reader_matches_one_shot() {
        let body = vec![0xC3u8; 100_000];
        let hashed = hash_reader(body.len() as u64, 0o600, &mut Cursor::new(&body), 8192).unwrap();
        assert_eq!(hashed, stamped_hash(body.len() as u64, 0o600, &body));
    }
}
