//! Block storage shared by the record heap and all three indices.
//!
//! # File layout
//!
//! Every component of a store owns two files: a block file (`*.blk`) and a
//! metadata file (`*.meta`). All integers are little-endian.
//!
//! ## Block files
//!
//! A block file is a sequence of `block_size` byte blocks addressed by
//! [`BlockId`]. Block 0 is the header block; id 0 therefore doubles as the
//! null link in every structure stored in blocks.
//!
//! ```text
//! header block
//!   0..4    magic            "TSBF"
//!   4..8    format version   u32
//!   8       file kind        u8   (see FileKind)
//!   9..12   reserved
//!   12..16  block size       u32
//!   16..24  next block id    u64  (first id never handed out)
//!   24..32  free list head   u64  (0 = empty)
//!   32..40  free block count u64
//!   40..44  crc32 of bytes 0..40
//!
//! data block
//!   0       state            u8   (0 = free, 1 = in use)
//!   1..5    crc32 of payload u32
//!   5..9    payload length   u32
//!   9..     payload          (bincode, legacy config; free blocks hold the
//!                                  next free block id as u64)
//!   ..      zero padding up to block size
//! ```
//!
//! The file never ends in a free block: freeing the last block cuts the file
//! back to the last block in use.
//!
//! ## Metadata files
//!
//! ```text
//!   0..4    magic            "TSMF"
//!   4..8    format version   u32
//!   8       file kind        u8
//!   9..12   reserved
//!   12..16  crc32 of body    u32
//!   16..24  body length      u64
//!   24..    body             (bincode, legacy config)
//! ```
//!
//! Metadata files are replaced atomically through a temporary file and a
//! rename. Opening a file written with another format version fails with
//! [`EngineError::FormatVersionMismatch`](crate::errors::EngineError); a bad
//! magic number, kind or checksum fails with
//! [`EngineError::Corrupted`](crate::errors::EngineError).

mod block_file;
mod checkpoint;
mod journal;
mod meta_file;
mod record_heap;

pub use block_file::{BlockFile, BlockFileStats, FileImage};
pub use checkpoint::Checkpointed;
pub use meta_file::{read_meta, write_meta, MetaFile};
pub use record_heap::{HeapMeta, RecordBlock, RecordHeap};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::errors::EngineResult;

/// Logical block number inside a block file
pub type BlockId = u64;

/// The header block id, also used as the null link
pub const NULL_BLOCK: BlockId = 0;

/// Version written into every block file and metadata file
pub const FORMAT_VERSION: u32 = 1;

/// Bytes of framing in front of every block payload
pub const FRAME_OVERHEAD: usize = 9;

/// Smallest block size a store accepts
pub const MIN_BLOCK_SIZE: usize = 256;

/// What a block or metadata file holds; stored in its header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FileKind {
    RecordHeap = 1,
    HashIndex = 2,
    QuadTree = 3,
    Trie = 4,
    Manifest = 5,
}

impl FileKind {
    pub fn from_u8(value: u8) -> Option<FileKind> {
        match value {
            1 => Some(FileKind::RecordHeap),
            2 => Some(FileKind::HashIndex),
            3 => Some(FileKind::QuadTree),
            4 => Some(FileKind::Trie),
            5 => Some(FileKind::Manifest),
            _ => None,
        }
    }
}

/// A value stored one per block in a [`BlockFile`].
pub trait BlockPayload: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Kind tag written into the header of files holding this payload
    const KIND: FileKind;
}

/// A file-backed component whose changes are grouped into units that are
/// either kept as a whole or undone as a whole.
pub trait Journaled {
    /// Opens a unit: block before-images and a metadata checkpoint.
    fn begin(&mut self) -> EngineResult<()>;

    /// Writes the component's metadata file for the open unit.
    fn save(&mut self, sync: bool) -> EngineResult<()>;

    /// Closes the unit, keeping its changes.
    fn commit(&mut self);

    /// Undoes every change since `begin`, including a metadata file already
    /// written by `save`.
    fn rollback(&mut self) -> EngineResult<()>;
}
