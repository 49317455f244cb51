//! The three secondary structures kept over the record heap.
//!
//! Each index maps one record attribute to record locations: the extendible
//! hash index maps the key, the quadtree maps the position and the trie maps
//! the name. Every index owns its own block file and metadata file.

pub mod hash;
pub mod quadtree;
pub mod trie;

pub use hash::{ExtendibleHashIndex, HashFunction, HashIndexStats};
pub use quadtree::{QuadEntry, QuadTreeIndex, QuadTreeStats};
pub use trie::{Posting, TrieIndex, TrieStats};
