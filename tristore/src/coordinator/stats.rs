use std::fmt::{Display, Formatter};

use crate::index::hash::{HashBlock, HashMeta};
use crate::index::quadtree::{QuadMeta, QuadNode};
use crate::index::trie::{TrieBlock, TrieMeta};
use crate::index::{HashIndexStats, QuadTreeStats, TrieStats};
use crate::storage::{BlockFileStats, FileImage, HeapMeta, RecordBlock};

/// Counters of a whole store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub records: u64,
    pub heap: BlockFileStats,
    pub hash: HashIndexStats,
    pub quadtree: QuadTreeStats,
    pub trie: TrieStats,
}

impl Display for StoreStats {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "records: {} in {} blocks", self.records, self.heap.blocks)?;
        writeln!(
            f,
            "hash: global depth {}, {} buckets, {} overflow blocks",
            self.hash.global_depth, self.hash.buckets, self.hash.overflow_blocks
        )?;
        writeln!(
            f,
            "quadtree: depth {}, {} leaves, {} internal nodes, {} overflow blocks",
            self.quadtree.depth, self.quadtree.leaves, self.quadtree.internal_nodes, self.quadtree.overflow_blocks
        )?;
        write!(
            f,
            "trie: {} names, {} nodes, {} posting blocks",
            self.trie.terminals, self.trie.nodes, self.trie.posting_blocks
        )
    }
}

/// Decoded contents of every file of a store.
///
/// Two snapshots compare equal when the heap and all three indices hold the
/// same blocks with the same contents under the same bookkeeping, which is
/// what a rolled back mutation must leave behind.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreStructure {
    pub heap: (HeapMeta, FileImage<RecordBlock>),
    pub hash: (HashMeta, FileImage<HashBlock>),
    pub quadtree: (QuadMeta, FileImage<QuadNode>),
    pub trie: (TrieMeta, FileImage<TrieBlock>),
}
