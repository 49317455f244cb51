//! Slotted record storage.
//!
//! Records live in fixed-slot blocks. The heap remembers which blocks still
//! have a vacant slot and always fills the lowest one first, so records pack
//! towards the start of the file. A block whose last record leaves goes back
//! to the block file's free list.

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{BlockFile, BlockFileStats, BlockId, BlockPayload, FileImage, FileKind, Journaled, MetaFile};
use crate::config::StoreLayout;
use crate::errors::{EngineError, EngineResult};
use crate::record::{Record, RecordLocation};

pub const RECORD_BLOCKS_FILE: &str = "records.blk";
pub const RECORD_META_FILE: &str = "records.meta";

/// One block of the record heap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordBlock {
    pub count: u16,
    pub slots: Vec<Option<Record>>,
}

impl RecordBlock {
    pub fn empty(slots: usize) -> Self {
        RecordBlock {
            count: 0,
            slots: vec![None; slots],
        }
    }

    /// Encoded size of a block whose every slot holds a record with the
    /// longest allowed name and description.
    pub fn max_encoded_size(slots: usize, max_name_len: usize, max_description_len: usize) -> usize {
        // option tag, key, two coordinates, two length-prefixed strings
        let slot = 1 + 8 + 16 + (8 + max_name_len) + (8 + max_description_len);
        2 + 8 + slots * slot
    }

    pub fn is_full(&self) -> bool {
        self.count as usize >= self.slots.len()
    }
}

impl BlockPayload for RecordBlock {
    const KIND: FileKind = FileKind::RecordHeap;
}

/// Persisted bookkeeping of the heap.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeapMeta {
    pub records: u64,
    /// Blocks with at least one vacant slot
    pub vacant: BTreeSet<BlockId>,
}

pub struct RecordHeap {
    blocks: BlockFile<RecordBlock>,
    meta: MetaFile<HeapMeta>,
    slots_per_block: usize,
    max_name_len: usize,
    max_description_len: usize,
}

impl RecordHeap {
    pub fn create(dir: &Path, layout: &StoreLayout, cache_blocks: usize) -> EngineResult<Self> {
        let blocks = BlockFile::create(&dir.join(RECORD_BLOCKS_FILE), layout.block_size, cache_blocks)?;
        let meta = MetaFile::create(&dir.join(RECORD_META_FILE), FileKind::RecordHeap, HeapMeta::default())?;
        Ok(Self::from_parts(blocks, meta, layout))
    }

    pub fn open(dir: &Path, layout: &StoreLayout, cache_blocks: usize) -> EngineResult<Self> {
        let blocks = BlockFile::open(&dir.join(RECORD_BLOCKS_FILE), layout.block_size, cache_blocks)?;
        let meta = MetaFile::open(&dir.join(RECORD_META_FILE), FileKind::RecordHeap)?;
        Ok(Self::from_parts(blocks, meta, layout))
    }

    fn from_parts(blocks: BlockFile<RecordBlock>, meta: MetaFile<HeapMeta>, layout: &StoreLayout) -> Self {
        RecordHeap {
            blocks,
            meta,
            slots_per_block: layout.records_per_block,
            max_name_len: layout.max_name_len,
            max_description_len: layout.max_description_len,
        }
    }

    pub fn len(&self) -> u64 {
        self.meta.get().records
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rejects records whose fields exceed their slot budget.
    pub fn check_fits(&self, record: &Record) -> EngineResult<()> {
        if record.name.len() > self.max_name_len {
            return Err(EngineError::RecordTooLarge {
                key: record.key,
                reason: format!(
                    "name is {} bytes, at most {} allowed",
                    record.name.len(),
                    self.max_name_len
                ),
            });
        }
        if record.description.len() > self.max_description_len {
            return Err(EngineError::RecordTooLarge {
                key: record.key,
                reason: format!(
                    "description is {} bytes, at most {} allowed",
                    record.description.len(),
                    self.max_description_len
                ),
            });
        }
        Ok(())
    }

    /// Puts a record into the lowest block with a vacant slot.
    pub fn store(&mut self, record: &Record) -> EngineResult<RecordLocation> {
        self.check_fits(record)?;

        let vacant = self.meta.get().vacant.iter().next().copied();
        let (id, mut block) = match vacant {
            Some(id) => (id, self.blocks.read(id)?),
            None => (self.blocks.allocate()?, RecordBlock::empty(self.slots_per_block)),
        };
        let slot = block.slots.iter().position(Option::is_none).ok_or_else(|| {
            EngineError::Corrupted(format!("record block {} is listed as vacant but is full", id))
        })?;

        block.slots[slot] = Some(record.clone());
        block.count += 1;
        self.blocks.write(id, &block)?;

        let meta = self.meta.get_mut();
        meta.records += 1;
        if block.is_full() {
            meta.vacant.remove(&id);
        } else {
            meta.vacant.insert(id);
        }
        Ok(RecordLocation::new(id, slot as u16))
    }

    pub fn load(&self, location: RecordLocation) -> EngineResult<Record> {
        let block = self.blocks.read(location.block)?;
        block
            .slots
            .get(location.slot as usize)
            .cloned()
            .flatten()
            .ok_or_else(|| EngineError::Corrupted(format!("no record stored at {}", location)))
    }

    /// Replaces the record in an occupied slot.
    pub fn rewrite(&mut self, location: RecordLocation, record: &Record) -> EngineResult<()> {
        self.check_fits(record)?;

        let mut block = self.blocks.read(location.block)?;
        let slot = block
            .slots
            .get_mut(location.slot as usize)
            .filter(|slot| slot.is_some())
            .ok_or_else(|| EngineError::Corrupted(format!("no record stored at {}", location)))?;
        *slot = Some(record.clone());
        self.blocks.write(location.block, &block)
    }

    /// Takes a record out of its slot, freeing the block once it is empty.
    pub fn remove(&mut self, location: RecordLocation) -> EngineResult<Record> {
        let mut block = self.blocks.read(location.block)?;
        let record = block
            .slots
            .get_mut(location.slot as usize)
            .and_then(Option::take)
            .ok_or_else(|| EngineError::Corrupted(format!("no record stored at {}", location)))?;
        block.count = block.count.saturating_sub(1);

        if block.count == 0 {
            self.blocks.free(location.block)?;
            self.meta.get_mut().vacant.remove(&location.block);
        } else {
            self.blocks.write(location.block, &block)?;
            self.meta.get_mut().vacant.insert(location.block);
        }
        let meta = self.meta.get_mut();
        meta.records = meta.records.saturating_sub(1);
        Ok(record)
    }

    /// Every stored record with its location, in block and slot order.
    pub fn scan(&self) -> EngineResult<Vec<(RecordLocation, Record)>> {
        let mut records = Vec::new();
        for id in self.blocks.allocated_ids()? {
            let block = self.blocks.read(id)?;
            for (slot, record) in block.slots.into_iter().enumerate() {
                if let Some(record) = record {
                    records.push((RecordLocation::new(id, slot as u16), record));
                }
            }
        }
        Ok(records)
    }

    /// Compares block contents against the bookkeeping and reports every
    /// disagreement.
    pub fn check(&self) -> EngineResult<Vec<String>> {
        let mut problems = Vec::new();
        let mut records = 0u64;
        let mut vacant = BTreeSet::new();

        for id in self.blocks.allocated_ids()? {
            let block = self.blocks.read(id)?;
            let occupied = block.slots.iter().filter(|slot| slot.is_some()).count();
            if block.slots.len() != self.slots_per_block {
                problems.push(format!(
                    "record block {} has {} slots instead of {}",
                    id,
                    block.slots.len(),
                    self.slots_per_block
                ));
            }
            if occupied != block.count as usize {
                problems.push(format!(
                    "record block {} counts {} records but holds {}",
                    id, block.count, occupied
                ));
            }
            if occupied == 0 {
                problems.push(format!("record block {} is empty but not freed", id));
            }
            if occupied < block.slots.len() {
                vacant.insert(id);
            }
            records += occupied as u64;
        }

        let meta = self.meta.get();
        if meta.records != records {
            problems.push(format!(
                "heap counts {} records but holds {}",
                meta.records, records
            ));
        }
        if meta.vacant != vacant {
            problems.push(format!(
                "heap lists vacant blocks {:?} but {:?} have room",
                meta.vacant, vacant
            ));
        }
        Ok(problems)
    }

    pub fn image(&self) -> EngineResult<(HeapMeta, FileImage<RecordBlock>)> {
        Ok((self.meta.get().clone(), self.blocks.image()?))
    }

    pub fn stats(&self) -> BlockFileStats {
        self.blocks.stats()
    }

    pub fn sync(&self) -> EngineResult<()> {
        self.blocks.sync()
    }
}

impl Journaled for RecordHeap {
    fn begin(&mut self) -> EngineResult<()> {
        self.blocks.begin_journal()?;
        self.meta.begin();
        Ok(())
    }

    fn save(&mut self, sync: bool) -> EngineResult<()> {
        if sync {
            self.blocks.sync()?;
        }
        self.meta.save(sync)
    }

    fn commit(&mut self) {
        self.blocks.commit_journal();
        self.meta.commit();
    }

    fn rollback(&mut self) -> EngineResult<()> {
        self.blocks.rollback_journal()?;
        self.meta.rollback()
    }
}
