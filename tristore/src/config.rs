//! Store configuration.
//!
//! [`StoreLayout`] holds every parameter that fixes the on-disk shape of a
//! store. It is written into the store manifest when the store is created and
//! read back on every reopen, so a store is always interpreted with the
//! layout it was built with. [`StoreConfig`] adds the location of the store
//! and runtime-only knobs.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::errors::{EngineError, EngineResult};
use crate::geometry::BoundingBox;
use crate::index::hash::{HashBlock, HashFunction};
use crate::index::quadtree::QuadNode;
use crate::index::trie::{inline_capacity, TrieNode, TriePostings};
use crate::storage::{RecordBlock, FRAME_OVERHEAD, MIN_BLOCK_SIZE};

/// Default block size in bytes
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Default number of blocks kept in each block file's read cache
pub const DEFAULT_CACHE_BLOCKS: usize = 256;

/// Upper bound for the hash directory depth. A directory this deep holds
/// 2^24 block ids, 128 MiB of `hash.meta`.
pub const MAX_HASH_DEPTH_LIMIT: u8 = 24;

/// Children a trie node must have room for next to its inline postings
pub const MIN_TRIE_FANOUT: usize = 8;

/// Upper bound for the quadtree depth
pub const MAX_QUADTREE_DEPTH_LIMIT: u32 = 48;

/// Parameters that determine the binary layout of a store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreLayout {
    /// Size of every block in every block file
    pub block_size: usize,
    /// Record slots per record heap block
    pub records_per_block: usize,
    /// Entries per primary hash bucket
    pub bucket_capacity: usize,
    /// Entries per hash overflow block
    pub overflow_capacity: usize,
    /// Deepest the hash directory may grow before buckets chain overflow blocks
    pub max_hash_depth: u8,
    pub hash_function: HashFunction,
    /// Points per quadtree leaf block
    pub quadtree_capacity: usize,
    /// Depth at which quadtree leaves stop splitting
    pub quadtree_max_depth: u32,
    /// Root region of the quadtree; positions outside it are rejected
    pub region: BoundingBox,
    /// Maximum record name length in bytes
    pub max_name_len: usize,
    /// Maximum record description length in bytes
    pub max_description_len: usize,
}

impl Default for StoreLayout {
    fn default() -> Self {
        StoreLayout {
            block_size: DEFAULT_BLOCK_SIZE,
            records_per_block: 8,
            bucket_capacity: 16,
            overflow_capacity: 16,
            max_hash_depth: 16,
            hash_function: HashFunction::Xxh3,
            quadtree_capacity: 8,
            quadtree_max_depth: 12,
            region: BoundingBox::new(-180.0, -90.0, 180.0, 90.0),
            max_name_len: 64,
            max_description_len: 256,
        }
    }
}

impl StoreLayout {
    /// Checks ranges and that the fullest possible block of each kind still
    /// fits into `block_size`.
    pub fn validate(&self) -> EngineResult<()> {
        if self.block_size < MIN_BLOCK_SIZE {
            return Err(EngineError::InvalidConfig(format!(
                "block size {} is below the minimum of {}",
                self.block_size, MIN_BLOCK_SIZE
            )));
        }
        if self.records_per_block == 0 || self.records_per_block > u16::MAX as usize {
            return Err(EngineError::InvalidConfig(format!(
                "records per block must be within 1..={}",
                u16::MAX
            )));
        }
        if self.bucket_capacity == 0 || self.overflow_capacity == 0 {
            return Err(EngineError::InvalidConfig(
                "hash bucket and overflow capacities must be positive".into(),
            ));
        }
        if self.max_hash_depth > MAX_HASH_DEPTH_LIMIT {
            return Err(EngineError::InvalidConfig(format!(
                "max hash depth {} exceeds {}",
                self.max_hash_depth, MAX_HASH_DEPTH_LIMIT
            )));
        }
        if let HashFunction::Modulo(0) = self.hash_function {
            return Err(EngineError::InvalidConfig("modulo hash needs a non-zero modulus".into()));
        }
        if self.quadtree_capacity == 0 {
            return Err(EngineError::InvalidConfig("quadtree capacity must be positive".into()));
        }
        if self.quadtree_max_depth > MAX_QUADTREE_DEPTH_LIMIT {
            return Err(EngineError::InvalidConfig(format!(
                "quadtree max depth {} exceeds {}",
                self.quadtree_max_depth, MAX_QUADTREE_DEPTH_LIMIT
            )));
        }
        if !self.region.is_valid() {
            return Err(EngineError::InvalidConfig(format!(
                "region {} is empty or unbounded",
                self.region
            )));
        }

        let limit = self.block_size - FRAME_OVERHEAD;
        let needs = [
            (
                "record block",
                RecordBlock::max_encoded_size(
                    self.records_per_block,
                    self.max_name_len,
                    self.max_description_len,
                ),
            ),
            ("hash bucket", HashBlock::max_encoded_size(self.bucket_capacity)),
            ("hash overflow block", HashBlock::max_encoded_size(self.overflow_capacity)),
            ("quadtree leaf", QuadNode::max_encoded_size(self.quadtree_capacity)),
            (
                "trie node",
                TrieNode::max_encoded_size(inline_capacity(self.block_size), MIN_TRIE_FANOUT),
            ),
            (
                "trie posting block",
                TriePostings::max_encoded_size(TriePostings::capacity(self.block_size)),
            ),
        ];
        for (what, size) in needs {
            if size > limit {
                return Err(EngineError::InvalidConfig(format!(
                    "a full {} needs {} bytes but a block holds {}",
                    what, size, limit
                )));
            }
        }
        Ok(())
    }
}

/// Configuration used to open or create a store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory holding the store's files
    pub path: PathBuf,
    pub layout: StoreLayout,
    /// Blocks cached per block file
    pub cache_blocks: usize,
    /// fsync block files after every committed mutation
    pub sync_on_commit: bool,
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        StoreConfig {
            path: path.into(),
            layout: StoreLayout::default(),
            cache_blocks: DEFAULT_CACHE_BLOCKS,
            sync_on_commit: false,
        }
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.cache_blocks == 0 {
            return Err(EngineError::InvalidConfig("cache must hold at least one block".into()));
        }
        self.layout.validate()
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::new("data")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    #[test]
    fn test_default_layout_is_valid() {
        StoreLayout::default().validate().unwrap();
        StoreConfig::default().validate().unwrap();
    }

    #[test]
    fn test_rejects_zero_capacities() {
        let layout = StoreLayout {
            bucket_capacity: 0,
            ..StoreLayout::default()
        };
        assert_eq!(layout.validate().unwrap_err().kind(), ErrorKind::InvalidConfig);

        let layout = StoreLayout {
            quadtree_capacity: 0,
            ..StoreLayout::default()
        };
        assert_eq!(layout.validate().unwrap_err().kind(), ErrorKind::InvalidConfig);
    }

    #[test]
    fn test_rejects_blocks_too_small_for_capacity() {
        let layout = StoreLayout {
            block_size: 512,
            records_per_block: 8,
            ..StoreLayout::default()
        };
        let err = layout.validate().unwrap_err();
        assert!(err.to_string().contains("record block"), "{}", err);
    }

    #[test]
    fn test_trie_blocks_fit_smallest_block() {
        let layout = StoreLayout {
            block_size: MIN_BLOCK_SIZE,
            records_per_block: 1,
            max_name_len: 16,
            max_description_len: 32,
            bucket_capacity: 2,
            overflow_capacity: 2,
            quadtree_capacity: 2,
            ..StoreLayout::default()
        };
        layout.validate().unwrap();

        let limit = MIN_BLOCK_SIZE - FRAME_OVERHEAD;
        assert!(TrieNode::max_encoded_size(inline_capacity(MIN_BLOCK_SIZE), MIN_TRIE_FANOUT) <= limit);
        assert!(TriePostings::max_encoded_size(TriePostings::capacity(MIN_BLOCK_SIZE)) <= limit);
        assert!(TriePostings::max_encoded_size(TriePostings::capacity(MIN_BLOCK_SIZE) + 1) > limit);
    }

    #[test]
    fn test_rejects_degenerate_region() {
        let layout = StoreLayout {
            region: BoundingBox::new(0.0, 0.0, 0.0, 10.0),
            ..StoreLayout::default()
        };
        assert!(layout.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_modulus_and_deep_directory() {
        let layout = StoreLayout {
            hash_function: HashFunction::Modulo(0),
            ..StoreLayout::default()
        };
        assert!(layout.validate().is_err());

        let layout = StoreLayout {
            max_hash_depth: 25,
            ..StoreLayout::default()
        };
        let err = layout.validate().unwrap_err();
        assert!(err.to_string().contains("exceeds 24"), "{}", err);

        let layout = StoreLayout {
            max_hash_depth: MAX_HASH_DEPTH_LIMIT,
            ..StoreLayout::default()
        };
        layout.validate().unwrap();
    }
}
