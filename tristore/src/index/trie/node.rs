use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::record::RecordLocation;
use crate::storage::{BlockId, BlockPayload, FileKind, FRAME_OVERHEAD, NULL_BLOCK};

/// Encoded size of one posting: key, block id and slot.
const POSTING_SIZE: usize = 8 + 8 + 2;

/// A record filed under a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Posting {
    pub key: u64,
    pub location: RecordLocation,
}

/// A trie node.
///
/// A node at depth `n` stands for a prefix of `n` characters. It is a
/// terminal when at least one record carries exactly that prefix as its
/// name. Postings are sorted by key; the lowest ones sit in the node itself
/// and the rest continue in a chain of [`TriePostings`] blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrieNode {
    pub depth: u32,
    pub children: BTreeMap<char, BlockId>,
    pub postings: Vec<Posting>,
    /// First posting block of the chain, or the null block
    pub postings_overflow: BlockId,
}

impl TrieNode {
    pub fn new(depth: u32) -> Self {
        TrieNode {
            depth,
            children: BTreeMap::new(),
            postings: Vec::new(),
            postings_overflow: NULL_BLOCK,
        }
    }

    /// Postings are packed into the node first, so a node without inline
    /// postings has no chain either.
    pub fn is_terminal(&self) -> bool {
        !self.postings.is_empty()
    }

    /// Neither a terminal nor on the way to one.
    pub fn is_dead(&self) -> bool {
        self.children.is_empty() && self.postings.is_empty()
    }

    /// Encoded size of a node with `postings` inline postings and
    /// `children` children named by multi-byte characters.
    pub fn max_encoded_size(postings: usize, children: usize) -> usize {
        // variant tag, depth, map length, children, vec length, postings, link
        4 + 4 + 8 + children * (4 + 8) + 8 + postings * POSTING_SIZE + 8
    }
}

/// Postings of a crowded name that did not fit into its node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriePostings {
    pub postings: Vec<Posting>,
    pub next: BlockId,
}

impl TriePostings {
    pub fn max_encoded_size(postings: usize) -> usize {
        // variant tag, vec length, postings, link
        4 + 8 + postings * POSTING_SIZE + 8
    }

    /// Postings a chain block of `block_size` bytes holds.
    pub fn capacity(block_size: usize) -> usize {
        block_size.saturating_sub(FRAME_OVERHEAD + Self::max_encoded_size(0)) / POSTING_SIZE
    }
}

/// Postings kept inside a node of `block_size` bytes. Half of a chain
/// block, the other half is left to the children.
pub fn inline_capacity(block_size: usize) -> usize {
    (TriePostings::capacity(block_size) / 2).max(1)
}

/// Contents of one block of the trie file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TrieBlock {
    Node(TrieNode),
    Postings(TriePostings),
}

impl BlockPayload for TrieBlock {
    const KIND: FileKind = FileKind::Trie;
}
