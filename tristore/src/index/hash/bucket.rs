use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

use crate::record::RecordLocation;
use crate::storage::{BlockId, BlockPayload, FileKind, NULL_BLOCK};

/// One key of the hash index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashEntry {
    pub key: u64,
    pub location: RecordLocation,
}

/// A primary bucket, addressed from the directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    pub local_depth: u8,
    pub entries: Vec<HashEntry>,
    /// First overflow block, or the null block
    pub overflow: BlockId,
}

impl Bucket {
    pub fn new(local_depth: u8, entries: Vec<HashEntry>) -> Self {
        Bucket {
            local_depth,
            entries,
            overflow: NULL_BLOCK,
        }
    }
}

/// Extra room chained behind a bucket that may not split any further.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverflowBlock {
    pub entries: Vec<HashEntry>,
    pub next: BlockId,
}

/// Contents of a block in the hash index block file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HashBlock {
    Bucket(Bucket),
    Overflow(OverflowBlock),
}

impl HashBlock {
    /// Encoded size of the larger block variant holding `capacity` entries.
    pub fn max_encoded_size(capacity: usize) -> usize {
        // variant tag, local depth, entry vec length, entries, link
        4 + 1 + 8 + capacity * (8 + 8 + 2) + 8
    }
}

impl BlockPayload for HashBlock {
    const KIND: FileKind = FileKind::HashIndex;
}

/// A bucket with its overflow blocks, in chain order.
#[derive(Debug, Clone, PartialEq)]
pub struct Chain {
    pub id: BlockId,
    pub bucket: Bucket,
    pub overflow: Vec<(BlockId, OverflowBlock)>,
}

impl Chain {
    pub fn entries(&self) -> impl Iterator<Item = &HashEntry> {
        self.bucket
            .entries
            .iter()
            .chain(self.overflow.iter().flat_map(|(_, block)| block.entries.iter()))
    }

    pub fn find(&self, key: u64) -> Option<&HashEntry> {
        self.entries().find(|entry| entry.key == key)
    }
}

/// A bucket as listed by a sequential dump of the index.
#[derive(Debug, Clone, PartialEq)]
pub struct BucketDump {
    pub block: BlockId,
    pub local_depth: u8,
    /// Directory slots addressing the bucket
    pub slots: Vec<usize>,
    pub entries: Vec<HashEntry>,
    pub overflow: Vec<(BlockId, Vec<HashEntry>)>,
}

impl Display for BucketDump {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "bucket {} depth {} slots {:?}: {:?}",
            self.block,
            self.local_depth,
            self.slots,
            self.entries.iter().map(|e| e.key).collect::<Vec<_>>()
        )?;
        for (block, entries) in &self.overflow {
            write!(
                f,
                " -> overflow {}: {:?}",
                block,
                entries.iter().map(|e| e.key).collect::<Vec<_>>()
            )?;
        }
        Ok(())
    }
}
