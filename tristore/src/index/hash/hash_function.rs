use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

/// Maps record keys onto the bits the hash directory is addressed with.
///
/// The directory uses the low-order bits of the hash, so the function must
/// spread keys over those bits for buckets to split evenly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HashFunction {
    /// xxh3 over the little-endian key bytes
    #[default]
    Xxh3,
    /// The key itself; sequential keys fill the directory predictably
    Identity,
    /// `key % m`; collides on purpose, which drives buckets into overflow
    /// chains
    Modulo(u64),
}

impl HashFunction {
    pub fn hash(&self, key: u64) -> u64 {
        match self {
            HashFunction::Xxh3 => xxh3_64(&key.to_le_bytes()),
            HashFunction::Identity => key,
            HashFunction::Modulo(modulus) => key.checked_rem(*modulus).unwrap_or(key),
        }
    }
}

/// Mask selecting the low `depth` bits.
pub(crate) fn low_bits(depth: u8) -> u64 {
    if depth >= 64 {
        u64::MAX
    } else {
        (1u64 << depth) - 1
    }
}
