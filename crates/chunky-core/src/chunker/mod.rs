//! Content-defined chunking with a rolling Rabin fingerprint.
//!
//! Chunk boundaries are a function of byte content alone: a fixed 64-bit
//! irreducible polynomial, a 64-byte rolling window, and a split mask derived
//! from the configured minimum size. Identical bytes always produce identical
//! boundaries, which is what makes stored blobs reusable across uploads.

use std::io::Read;
use std::sync::OnceLock;

use crate::error::Result;

/// The Rabin polynomial. Existing repositories were packed with this exact
/// constant; changing it would orphan every stored blob boundary.
pub const POLYNOMIAL: u64 = 0x3DA3358B4DC173;

/// Width of the rolling window in bytes.
pub const WINDOW_SIZE: usize = 64;

/// Default minimum chunk size (512 KiB).
pub const DEFAULT_MIN_SIZE: usize = 512 * 1024;

/// Default maximum chunk size (8 MiB).
pub const DEFAULT_MAX_SIZE: usize = 8 * 1024 * 1024;

const READ_BUF_SIZE: usize = 64 * 1024;

/// One emitted chunk of file content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub data: Vec<u8>,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

// ---------------------------------------------------------------------------
// GF(2) polynomial arithmetic
// ---------------------------------------------------------------------------

/// Degree of a polynomial over GF(2); deg(0) = -1.
fn deg(x: u64) -> i32 {
    63 - x.leading_zeros() as i32
}

/// Remainder of `x` divided by `d` over GF(2).
fn pol_mod(mut x: u64, d: u64) -> u64 {
    let dd = deg(d);
    while deg(x) >= dd {
        x ^= d << (deg(x) - dd);
    }
    x
}

/// Shift one byte into `hash` and reduce modulo the polynomial.
fn append_byte(hash: u64, b: u8, pol: u64) -> u64 {
    pol_mod((hash << 8) | u64::from(b), pol)
}

/// Precomputed per-byte tables for the rolling update.
struct Tables {
    /// Residual influence of a byte after it has rolled through the window.
    out: [u64; 256],
    /// Reduction table: maps the top byte shifted out by an append to its
    /// remainder modulo the polynomial, with the raw top bits folded in so a
    /// single XOR both clears and reduces them.
    modt: [u64; 256],
    /// `deg(pol) - 8`: where the top byte of a reduced digest sits.
    shift: u32,
}

fn tables() -> &'static Tables {
    static TABLES: OnceLock<Tables> = OnceLock::new();
    TABLES.get_or_init(|| {
        let k = deg(POLYNOMIAL);
        let mut out = [0u64; 256];
        for (b, slot) in out.iter_mut().enumerate() {
            let mut h = append_byte(0, b as u8, POLYNOMIAL);
            for _ in 0..WINDOW_SIZE - 1 {
                h = append_byte(h, 0, POLYNOMIAL);
            }
            *slot = h;
        }
        let mut modt = [0u64; 256];
        for (b, slot) in modt.iter_mut().enumerate() {
            let shifted = (b as u64) << k;
            *slot = pol_mod(shifted, POLYNOMIAL) | shifted;
        }
        Tables {
            out,
            modt,
            shift: (k - 8) as u32,
        }
    })
}

/// Split mask for a target average of twice the minimum chunk size. With the
/// default 512 KiB minimum this is a 20-bit mask (1 MiB average).
fn split_mask(min_size: usize) -> u64 {
    let bits = min_size.max(WINDOW_SIZE).next_power_of_two().trailing_zeros() + 1;
    (1u64 << bits.min(48)) - 1
}

// ---------------------------------------------------------------------------
// Chunker
// ---------------------------------------------------------------------------

/// Streaming chunker over any reader. Call [`Chunker::next_chunk`] until it
/// returns `None`.
pub struct Chunker<R: Read> {
    reader: R,
    min_size: usize,
    max_size: usize,
    mask: u64,

    window: [u8; WINDOW_SIZE],
    wpos: usize,
    digest: u64,

    buf: Vec<u8>,
    buf_pos: usize,
    buf_len: usize,
    eof: bool,
}

impl<R: Read> Chunker<R> {
    /// Chunker with the default 512 KiB / 8 MiB bounds.
    pub fn new(reader: R) -> Self {
        Self::with_bounds(reader, DEFAULT_MIN_SIZE, DEFAULT_MAX_SIZE)
    }

    /// Chunker with explicit size bounds. `min_size` must not exceed
    /// `max_size`; callers validate this before construction.
    pub fn with_bounds(reader: R, min_size: usize, max_size: usize) -> Self {
        debug_assert!(min_size >= 1 && min_size <= max_size);
        Self {
            reader,
            min_size,
            max_size,
            mask: split_mask(min_size),
            window: [0u8; WINDOW_SIZE],
            wpos: 0,
            digest: 0,
            buf: vec![0u8; READ_BUF_SIZE],
            buf_pos: 0,
            buf_len: 0,
            eof: false,
        }
    }

    /// Produce the next chunk, or `None` once the reader is exhausted.
    /// Underlying read errors propagate unchanged.
    pub fn next_chunk(&mut self) -> Result<Option<Chunk>> {
        let mut data: Vec<u8> = Vec::new();
        self.reset_hash();

        loop {
            if self.buf_pos == self.buf_len {
                if self.eof {
                    break;
                }
                if !self.fill_buf()? {
                    break;
                }
            }

            while self.buf_pos < self.buf_len {
                let b = self.buf[self.buf_pos];
                self.buf_pos += 1;
                data.push(b);
                self.slide(b);

                let len = data.len();
                if len >= self.max_size
                    || (len >= self.min_size && self.digest & self.mask == 0)
                {
                    return Ok(Some(Chunk { data }));
                }
            }
        }

        if data.is_empty() {
            Ok(None)
        } else {
            Ok(Some(Chunk { data }))
        }
    }

    fn fill_buf(&mut self) -> Result<bool> {
        loop {
            match self.reader.read(&mut self.buf) {
                Ok(0) => {
                    self.eof = true;
                    return Ok(false);
                }
                Ok(n) => {
                    self.buf_pos = 0;
                    self.buf_len = n;
                    return Ok(true);
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn reset_hash(&mut self) {
        self.window = [0u8; WINDOW_SIZE];
        self.wpos = 0;
        self.digest = 0;
    }

    #[inline]
    fn slide(&mut self, b: u8) {
        let t = tables();
        let out = self.window[self.wpos];
        self.window[self.wpos] = b;
        self.wpos = (self.wpos + 1) % WINDOW_SIZE;
        self.digest ^= t.out[out as usize];

        let index = (self.digest >> t.shift) as usize;
        self.digest = ((self.digest << 8) | u64::from(b)) ^ t.modt[index];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Deterministic pseudo-random bytes (xorshift), so boundary positions
    /// are stable across runs without fixture files.
    fn make_data(len: usize, mut seed: u64) -> Vec<u8> {
        let mut data = Vec::with_capacity(len);
        while data.len() < len {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            data.extend_from_slice(&seed.to_le_bytes());
        }
        data.truncate(len);
        data
    }

    fn chunk_all(data: &[u8], min: usize, max: usize) -> Vec<Chunk> {
        let mut chunker = Chunker::with_bounds(Cursor::new(data), min, max);
        let mut chunks = Vec::new();
        while let Some(chunk) = chunker.next_chunk().unwrap() {
            chunks.push(chunk);
        }
        chunks
    }

    #[test]
    fn polynomial_degree() {
        assert_eq!(deg(POLYNOMIAL), 53);
        assert_eq!(deg(1), 0);
        assert_eq!(deg(0), -1);
    }

    #[test]
    fn pol_mod_reduces_below_divisor() {
        let m = pol_mod(u64::MAX, POLYNOMIAL);
        assert!(deg(m) < deg(POLYNOMIAL));
    }

    #[test]
    fn empty_input_yields_no_chunk() {
        let chunks = chunk_all(&[], 1024, 4096);
        assert!(chunks.is_empty());
    }

    #[test]
    fn short_input_is_one_chunk() {
        let data = b"well below the minimum".to_vec();
        let chunks = chunk_all(&data, 1024, 4096);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].data, data);
    }

    #[test]
    fn chunks_reassemble_to_input() {
        let data = make_data(3 * 1024 * 1024, 0x5EED);
        let chunks = chunk_all(&data, 16 * 1024, 256 * 1024);
        let joined: Vec<u8> = chunks.iter().flat_map(|c| c.data.clone()).collect();
        assert_eq!(joined, data);
        assert!(chunks.len() > 1, "3 MiB should split at these bounds");
    }

    #[test]
    fn chunk_sizes_respect_bounds() {
        let data = make_data(2 * 1024 * 1024, 0xABCDEF);
        let min = 16 * 1024;
        let max = 128 * 1024;
        let chunks = chunk_all(&data, min, max);
        for chunk in &chunks[..chunks.len() - 1] {
            assert!(chunk.len() >= min, "non-final chunk under min");
            assert!(chunk.len() <= max, "chunk over max");
        }
        assert!(chunks.last().unwrap().len() <= max);
    }

    #[test]
    fn boundaries_are_deterministic() {
        let data = make_data(2 * 1024 * 1024, 42);
        let a: Vec<usize> = chunk_all(&data, 16 * 1024, 128 * 1024)
            .iter()
            .map(Chunk::len)
            .collect();
        let b: Vec<usize> = chunk_all(&data, 16 * 1024, 128 * 1024)
            .iter()
            .map(Chunk::len)
            .collect();
        assert_eq!(a, b);
    }

    #[test]
    fn max_size_forces_split_on_uniform_data() {
        // All-zero data never varies the fingerprint mid-stream; every chunk
        // must still terminate by min or max.
        let data = vec![0u8; 600 * 1024];
        let chunks = chunk_all(&data, 64 * 1024, 128 * 1024);
        let total: usize = chunks.iter().map(Chunk::len).sum();
        assert_eq!(total, data.len());
        for chunk in &chunks[..chunks.len() - 1] {
            assert!(chunk.len() >= 64 * 1024 && chunk.len() <= 128 * 1024);
        }
    }

    #[test]
    fn split_mask_tracks_min_size() {
        assert_eq!(split_mask(512 * 1024), (1 << 20) - 1);
        assert_eq!(split_mask(16 * 1024), (1 << 15) - 1);
    }

    #[test]
    fn read_errors_propagate() {
        struct FailingReader;
        impl Read for FailingReader {
            fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
                Err(std::io::Error::other("backing store went away"))
            }
        }
        let mut chunker = Chunker::new(FailingReader);
        assert!(chunker.next_chunk().is_err());
    }
}
