use serde::{Deserialize, Serialize};

use crate::geometry::{BoundingBox, Point};
use crate::record::RecordLocation;
use crate::storage::{BlockId, BlockPayload, FileKind};

/// A record's position in the quadtree.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuadEntry {
    pub point: Point,
    pub key: u64,
    pub location: RecordLocation,
}

/// A quadtree node; one per block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QuadNode {
    Leaf {
        region: BoundingBox,
        depth: u32,
        entries: Vec<QuadEntry>,
        /// First overflow block, only ever set at the maximum depth
        overflow: BlockId,
    },
    Internal {
        region: BoundingBox,
        depth: u32,
        /// Children in NW, NE, SW, SE order
        children: [BlockId; 4],
    },
    Overflow {
        entries: Vec<QuadEntry>,
        next: BlockId,
    },
}

impl QuadNode {
    /// Encoded size of a leaf holding `capacity` entries.
    pub fn max_encoded_size(capacity: usize) -> usize {
        // variant tag, region, depth, entry vec length, entries, link
        4 + 32 + 4 + 8 + capacity * (16 + 8 + 10) + 8
    }
}

impl BlockPayload for QuadNode {
    const KIND: FileKind = FileKind::QuadTree;
}

/// A leaf with every entry of its overflow chain pulled in.
#[derive(Debug, Clone)]
pub(crate) struct Leaf {
    pub id: BlockId,
    pub region: BoundingBox,
    pub depth: u32,
    pub entries: Vec<QuadEntry>,
    /// Overflow blocks in chain order
    pub overflow: Vec<BlockId>,
}
