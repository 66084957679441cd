use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{ChunkyError, Result};

/// Format of commit ids: a zero-padded UTC timestamp, lexicographically
/// sortable by creation time.
const TIME_ID_FORMAT: &str = "%Y%m%d%H%M%S";

/// Encode a commit creation time as a 14-character `YYYYMMDDHHMMSS` id.
pub fn time_id(t: DateTime<Utc>) -> String {
    t.format(TIME_ID_FORMAT).to_string()
}

/// Decode a commit id back into its creation time.
pub fn parse_time_id(s: &str) -> Result<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(s, TIME_ID_FORMAT)
        .map_err(|e| ChunkyError::Validation(format!("invalid commit id '{s}': {e}")))?;
    Ok(naive.and_utc())
}

/// KSUID epoch offset (2014-05-13). Keeps the 4-byte timestamp component
/// useful for another century of ids.
const KSUID_EPOCH: i64 = 1_400_000_000;

/// Raw id width: 4-byte big-endian timestamp + 16 bytes of entropy.
const RAW_LEN: usize = 20;

/// Base62 width of a 20-byte id.
const ENCODED_LEN: usize = 27;

const ALPHABET: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// A 27-character time-ordered pack identifier.
///
/// The timestamp component makes ids from one upload sort roughly in
/// creation order; the entropy component makes them unique. Opaque on the
/// wire: serialized as the base62 string.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PackId(String);

impl PackId {
    /// Generate a fresh id for the current instant.
    pub fn generate() -> Self {
        let seconds = (Utc::now().timestamp() - KSUID_EPOCH).max(0) as u32;
        let mut raw = [0u8; RAW_LEN];
        raw[..4].copy_from_slice(&seconds.to_be_bytes());
        rand::thread_rng().fill_bytes(&mut raw[4..]);
        PackId(base62_encode(&raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Repository key of the pack file carrying this id.
    pub fn storage_key(&self) -> String {
        format!("packs/{}", self.0)
    }
}

impl From<String> for PackId {
    fn from(s: String) -> Self {
        PackId(s)
    }
}

impl From<&str> for PackId {
    fn from(s: &str) -> Self {
        PackId(s.to_string())
    }
}

impl fmt::Display for PackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for PackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PackId({})", self.0)
    }
}

/// Fixed-width base62 of a 20-byte big-endian integer. Fixed width keeps the
/// lexicographic order of encoded ids equal to the numeric order of the raw
/// bytes.
fn base62_encode(raw: &[u8; RAW_LEN]) -> String {
    let mut digits = *raw;
    let mut out = [0u8; ENCODED_LEN];
    for slot in out.iter_mut().rev() {
        let mut rem: u32 = 0;
        for d in digits.iter_mut() {
            let acc = (rem << 8) | u32::from(*d);
            *d = (acc / 62) as u8;
            rem = acc % 62;
        }
        *slot = ALPHABET[rem as usize];
    }
    String::from_utf8(out.to_vec()).expect("base62 output is ASCII")
}
