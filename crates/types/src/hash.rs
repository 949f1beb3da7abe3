//! Cryptographic hash type using Blake2b-256.

use blake2::digest::consts::U32;
use blake2::digest::{FixedOutput, KeyInit, Update};
use blake2::{Blake2b, Blake2bMac, Digest};
use std::fmt;

type Blake2b256 = Blake2b<U32>;
type Blake2bMac256 = Blake2bMac<U32>;

/// A 32-byte cryptographic hash using Blake2b-256.
///
/// Ordered so it can key `BTreeMap`s, which keeps every iteration over
/// per-state tallies deterministic. All hashing operations are deterministic.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash([u8; 32]);

impl Hash {
    /// Size of hash in bytes.
    pub const BYTES: usize = 32;

    /// Zero hash (all bytes are 0x00).
    pub const ZERO: Self = Self([0u8; 32]);

    /// Hash a byte slice with unkeyed Blake2b-256.
    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = Blake2b256::new();
        Digest::update(&mut hasher, bytes);
        Self(hasher.finalize().into())
    }

    /// Hash multiple byte slices as one continuous input.
    pub fn of_parts(parts: &[&[u8]]) -> Self {
        let mut hasher = Blake2b256::new();
        for part in parts {
            Digest::update(&mut hasher, part);
        }
        Self(hasher.finalize().into())
    }

    /// Keyed Blake2b-256.
    ///
    /// An empty key degenerates to the unkeyed hash; keys longer than the
    /// Blake2b limit of 64 bytes are compressed first so the function stays
    /// total.
    pub fn keyed(key: &[u8], bytes: &[u8]) -> Self {
        if key.is_empty() {
            return Self::of(bytes);
        }
        let compressed;
        let key = if key.len() > 64 {
            compressed = Self::of(key);
            &compressed.0[..]
        } else {
            key
        };
        // new_from_slice only fails for keys over 64 bytes, ruled out above.
        let mut mac = match Blake2bMac256::new_from_slice(key) {
            Ok(mac) => mac,
            Err(_) => return Self::of(bytes),
        };
        Update::update(&mut mac, bytes);
        Self(mac.finalize_fixed().into())
    }

    /// Wrap raw hash bytes (without hashing).
    pub fn from_raw(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Wrap a 32-byte slice of raw hash bytes; `None` on wrong length.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    /// Get bytes as slice reference.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to bytes array.
    pub fn to_bytes(self) -> [u8; 32] {
        self.0
    }

    /// Interpret the first 8 bytes as u64 (little-endian).
    pub fn as_u64(&self) -> u64 {
        u64::from_le_bytes(self.0[0..8].try_into().unwrap_or([0u8; 8]))
    }

    /// Convert hash to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "Hash({}..{})", &hex[..8], &hex[56..])
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}
