use std::collections::BTreeMap;

use super::block_file::FileHeader;
use super::BlockId;

/// Before-images of the blocks touched since a journal was opened.
///
/// Only blocks that existed when the journal started are captured; blocks
/// appended afterwards disappear when the file is cut back to its original
/// length.
#[derive(Debug)]
pub(crate) struct Journal {
    header: FileHeader,
    file_len: u64,
    images: BTreeMap<BlockId, Vec<u8>>,
}

impl Journal {
    pub(crate) fn new(header: FileHeader, file_len: u64) -> Self {
        Journal {
            header,
            file_len,
            images: BTreeMap::new(),
        }
    }

    /// Whether a change to `id` still needs its old bytes recorded.
    pub(crate) fn needs_image(&self, id: BlockId) -> bool {
        id < self.header.next_block && !self.images.contains_key(&id)
    }

    pub(crate) fn record(&mut self, id: BlockId, bytes: Vec<u8>) {
        self.images.entry(id).or_insert(bytes);
    }

    pub(crate) fn header(&self) -> &FileHeader {
        &self.header
    }

    pub(crate) fn file_len(&self) -> u64 {
        self.file_len
    }

    pub(crate) fn images(&self) -> impl Iterator<Item = (&BlockId, &Vec<u8>)> {
        self.images.iter()
    }

    pub(crate) fn touched(&self) -> usize {
        self.images.len()
    }
}
