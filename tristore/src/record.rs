//! The record type the store manages and the address it is stored at.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

use crate::geometry::Point;
use crate::storage::BlockId;

/// A stored record.
///
/// `key` is the record's identity and the hash index key, `position` is the
/// quadtree key and `name` is the trie key. `description` is carried along
/// without being indexed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub key: u64,
    pub position: Point,
    pub name: String,
    pub description: String,
}

impl Record {
    pub fn new(key: u64, position: Point, name: impl Into<String>) -> Self {
        Record {
            key,
            position,
            name: name.into(),
            description: String::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Whether switching from `self` to `other` touches any index key.
    pub fn differs_in_indexed_fields(&self, other: &Record) -> bool {
        self.key != other.key || self.position != other.position || self.name != other.name
    }
}

impl Display for Record {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{} '{}' at {}", self.key, self.name, self.position)
    }
}

/// Where a record currently lives in the record heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordLocation {
    pub block: BlockId,
    pub slot: u16,
}

impl RecordLocation {
    pub fn new(block: BlockId, slot: u16) -> Self {
        RecordLocation { block, slot }
    }
}

impl Display for RecordLocation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.block, self.slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_indexed_field_changes() {
        let a = Record::new(1, Point::new(2.0, 2.0), "ann");
        let same_index = a.clone().with_description("corner lot");
        let moved = Record::new(1, Point::new(3.0, 2.0), "ann");
        let renamed = Record::new(1, Point::new(2.0, 2.0), "anna");

        assert!(!a.differs_in_indexed_fields(&same_index));
        assert!(a.differs_in_indexed_fields(&moved));
        assert!(a.differs_in_indexed_fields(&renamed));
    }
}
