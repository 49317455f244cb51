//! Extendible hash index from record keys to record locations.
//!
//! The directory holds `2^global_depth` bucket ids and is addressed with the
//! low `global_depth` bits of a key's hash. A bucket with local depth `d` is
//! referenced by the `2^(global_depth - d)` directory slots that agree on
//! the low `d` bits.
//!
//! Inserting into a full bucket splits it on the next hash bit, doubling the
//! directory first when the bucket already uses every directory bit. Once a
//! bucket reaches the configured maximum depth it stops splitting and chains
//! overflow blocks instead.
//!
//! Deletes are eager about giving space back: the bucket chain is compacted
//! and emptied overflow blocks are freed, a bucket is merged with its split
//! image whenever both have the same depth, no overflow and their entries
//! fit one bucket, and the directory halves while its two halves are
//! identical. The global depth is therefore always the largest local depth.

mod bucket;
mod hash_function;

pub use bucket::{Bucket, BucketDump, Chain, HashBlock, HashEntry, OverflowBlock};
pub use hash_function::HashFunction;

use std::collections::{BTreeSet, HashSet};
use std::path::Path;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::config::StoreLayout;
use crate::errors::{EngineError, EngineResult};
use crate::record::RecordLocation;
use crate::storage::{
    BlockFile, BlockFileStats, BlockId, FileImage, FileKind, Journaled, MetaFile, NULL_BLOCK,
};
use hash_function::low_bits;

pub const HASH_BLOCKS_FILE: &str = "hash.blk";
pub const HASH_META_FILE: &str = "hash.meta";

/// Persisted directory and counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HashMeta {
    pub hash_function: HashFunction,
    pub global_depth: u8,
    pub directory: Vec<BlockId>,
    pub entries: u64,
    pub overflow_blocks: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HashIndexStats {
    pub entries: u64,
    pub global_depth: u8,
    pub directory_len: usize,
    pub buckets: u64,
    pub overflow_blocks: u64,
    pub blocks: BlockFileStats,
}

pub struct ExtendibleHashIndex {
    blocks: BlockFile<HashBlock>,
    meta: MetaFile<HashMeta>,
    bucket_capacity: usize,
    overflow_capacity: usize,
    max_depth: u8,
}

impl ExtendibleHashIndex {
    /// Creates an index with a single empty bucket.
    pub fn create(dir: &Path, layout: &StoreLayout, cache_blocks: usize) -> EngineResult<Self> {
        let mut blocks = BlockFile::create(&dir.join(HASH_BLOCKS_FILE), layout.block_size, cache_blocks)?;
        let root = blocks.allocate()?;
        blocks.write(root, &HashBlock::Bucket(Bucket::new(0, Vec::new())))?;

        let meta = MetaFile::create(
            &dir.join(HASH_META_FILE),
            FileKind::HashIndex,
            HashMeta {
                hash_function: layout.hash_function,
                global_depth: 0,
                directory: vec![root],
                entries: 0,
                overflow_blocks: 0,
            },
        )?;
        Ok(Self::from_parts(blocks, meta, layout))
    }

    pub fn open(dir: &Path, layout: &StoreLayout, cache_blocks: usize) -> EngineResult<Self> {
        let blocks = BlockFile::open(&dir.join(HASH_BLOCKS_FILE), layout.block_size, cache_blocks)?;
        let meta: MetaFile<HashMeta> = MetaFile::open(&dir.join(HASH_META_FILE), FileKind::HashIndex)?;

        let stored = meta.get();
        if stored.hash_function != layout.hash_function {
            return Err(EngineError::Corrupted(format!(
                "{}: built with {:?}, layout says {:?}",
                HASH_META_FILE, stored.hash_function, layout.hash_function
            )));
        }
        if stored.directory.len() != 1usize << stored.global_depth {
            return Err(EngineError::Corrupted(format!(
                "{}: directory has {} slots at depth {}",
                HASH_META_FILE,
                stored.directory.len(),
                stored.global_depth
            )));
        }
        Ok(Self::from_parts(blocks, meta, layout))
    }

    fn from_parts(blocks: BlockFile<HashBlock>, meta: MetaFile<HashMeta>, layout: &StoreLayout) -> Self {
        ExtendibleHashIndex {
            blocks,
            meta,
            bucket_capacity: layout.bucket_capacity,
            overflow_capacity: layout.overflow_capacity,
            max_depth: layout.max_hash_depth,
        }
    }

    pub fn len(&self) -> u64 {
        self.meta.get().entries
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn global_depth(&self) -> u8 {
        self.meta.get().global_depth
    }

    pub fn directory(&self) -> &[BlockId] {
        &self.meta.get().directory
    }

    /// Adds `key`, splitting buckets or chaining overflow as needed.
    pub fn insert(&mut self, key: u64, location: RecordLocation) -> EngineResult<()> {
        let hash = self.hash(key);
        let entry = HashEntry { key, location };

        loop {
            let chain = self.load_chain(self.bucket_at(self.slot_for(hash))?)?;
            if chain.find(key).is_some() {
                return Err(EngineError::DuplicateKey(key.to_string()));
            }

            if chain.bucket.entries.len() < self.bucket_capacity {
                let Chain { id, mut bucket, .. } = chain;
                bucket.entries.push(entry);
                self.blocks.write(id, &HashBlock::Bucket(bucket))?;
                break;
            }
            if chain.bucket.local_depth < self.max_depth {
                self.split(chain.id, chain.bucket)?;
                continue;
            }
            self.append_overflow(chain, entry)?;
            break;
        }

        self.meta.get_mut().entries += 1;
        Ok(())
    }

    /// The location stored for `key`, if any.
    pub fn get(&self, key: u64) -> EngineResult<Option<RecordLocation>> {
        let hash = self.hash(key);
        let chain = self.load_chain(self.bucket_at(self.slot_for(hash))?)?;
        Ok(chain.find(key).map(|entry| entry.location))
    }

    /// Like [`get`](Self::get), but a missing key is an error.
    pub fn lookup(&self, key: u64) -> EngineResult<RecordLocation> {
        self.get(key)?
            .ok_or_else(|| EngineError::KeyNotFound(key.to_string()))
    }

    pub fn contains(&self, key: u64) -> EngineResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Removes `key` and returns the location it mapped to.
    pub fn delete(&mut self, key: u64) -> EngineResult<RecordLocation> {
        let hash = self.hash(key);
        let chain = self.load_chain(self.bucket_at(self.slot_for(hash))?)?;

        let mut entries: Vec<HashEntry> = chain.entries().copied().collect();
        let at = entries
            .iter()
            .position(|entry| entry.key == key)
            .ok_or_else(|| EngineError::KeyNotFound(key.to_string()))?;
        let removed = entries.remove(at);

        self.rewrite_chain(chain, entries)?;
        let meta = self.meta.get_mut();
        meta.entries = meta.entries.saturating_sub(1);

        self.merge_buddies(hash)?;
        self.shrink_directory();
        Ok(removed.location)
    }

    /// Every `(key, location)` pair, ordered by key.
    pub fn entries(&self) -> EngineResult<Vec<(u64, RecordLocation)>> {
        let mut all = Vec::with_capacity(self.len() as usize);
        for id in self.distinct_buckets() {
            let chain = self.load_chain(id)?;
            all.extend(chain.entries().map(|entry| (entry.key, entry.location)));
        }
        all.sort_unstable_by_key(|(key, _)| *key);
        Ok(all)
    }

    /// Every bucket with its overflow chain, in order of first appearance in
    /// the directory.
    pub fn sequential_dump(&self) -> EngineResult<Vec<BucketDump>> {
        let directory = &self.meta.get().directory;
        let mut dump = Vec::new();
        for id in self.distinct_buckets() {
            let chain = self.load_chain(id)?;
            dump.push(BucketDump {
                block: id,
                local_depth: chain.bucket.local_depth,
                slots: (0..directory.len()).filter(|&s| directory[s] == id).collect(),
                entries: chain.bucket.entries,
                overflow: chain
                    .overflow
                    .into_iter()
                    .map(|(block, overflow)| (block, overflow.entries))
                    .collect(),
            });
        }
        Ok(dump)
    }

    pub fn stats(&self) -> HashIndexStats {
        let meta = self.meta.get();
        let blocks = self.blocks.stats();
        HashIndexStats {
            entries: meta.entries,
            global_depth: meta.global_depth,
            directory_len: meta.directory.len(),
            buckets: blocks.blocks.saturating_sub(meta.overflow_blocks),
            overflow_blocks: meta.overflow_blocks,
            blocks,
        }
    }

    pub fn image(&self) -> EngineResult<(HashMeta, FileImage<HashBlock>)> {
        Ok((self.meta.get().clone(), self.blocks.image()?))
    }

    pub fn sync(&self) -> EngineResult<()> {
        self.blocks.sync()
    }

    /// Verifies the directory and bucket invariants, returning every
    /// violation found.
    pub fn check_invariants(&self) -> EngineResult<Vec<String>> {
        let meta = self.meta.get();
        let global = meta.global_depth;
        let mut problems = Vec::new();

        if meta.directory.len() != 1usize << global {
            problems.push(format!(
                "directory has {} slots at global depth {}",
                meta.directory.len(),
                global
            ));
            return Ok(problems);
        }

        let mut reachable = BTreeSet::new();
        let mut keys = HashSet::new();
        let mut entries = 0u64;
        let mut overflow_blocks = 0u64;
        let mut deepest = 0u8;

        for id in self.distinct_buckets() {
            let chain = match self.load_chain(id) {
                Ok(chain) => chain,
                Err(err) => {
                    problems.push(format!("bucket {}: {}", id, err));
                    continue;
                }
            };
            let depth = chain.bucket.local_depth;
            deepest = deepest.max(depth);
            reachable.insert(id);

            if depth > global {
                problems.push(format!(
                    "bucket {} has local depth {} above global depth {}",
                    id, depth, global
                ));
                continue;
            }

            let slots: Vec<usize> = (0..meta.directory.len())
                .filter(|&s| meta.directory[s] == id)
                .collect();
            let mask = low_bits(depth);
            let prefix = slots[0] as u64 & mask;
            if slots.len() != 1usize << (global - depth) {
                problems.push(format!(
                    "bucket {} at depth {} is addressed by {} slots",
                    id,
                    depth,
                    slots.len()
                ));
            }
            if slots.iter().any(|&s| s as u64 & mask != prefix) {
                problems.push(format!("bucket {} is addressed by slots {:?}", id, slots));
            }

            if chain.bucket.entries.len() > self.bucket_capacity {
                problems.push(format!(
                    "bucket {} holds {} entries, capacity {}",
                    id,
                    chain.bucket.entries.len(),
                    self.bucket_capacity
                ));
            }
            if !chain.overflow.is_empty() && depth < self.max_depth {
                problems.push(format!(
                    "bucket {} chains overflow blocks at depth {} below the maximum {}",
                    id, depth, self.max_depth
                ));
            }
            for (block, overflow) in &chain.overflow {
                overflow_blocks += 1;
                reachable.insert(*block);
                if overflow.entries.is_empty() || overflow.entries.len() > self.overflow_capacity {
                    problems.push(format!(
                        "overflow block {} holds {} entries, capacity {}",
                        block,
                        overflow.entries.len(),
                        self.overflow_capacity
                    ));
                }
            }

            for entry in chain.entries() {
                entries += 1;
                if !keys.insert(entry.key) {
                    problems.push(format!("key {} is stored twice", entry.key));
                }
                if meta.hash_function.hash(entry.key) & mask != prefix {
                    problems.push(format!("key {} is stored in the wrong bucket {}", entry.key, id));
                }
            }
        }

        if global > 0 && deepest < global {
            problems.push(format!(
                "global depth {} exceeds the deepest bucket {}",
                global, deepest
            ));
        }
        if entries != meta.entries {
            problems.push(format!("index counts {} entries but holds {}", meta.entries, entries));
        }
        if overflow_blocks != meta.overflow_blocks {
            problems.push(format!(
                "index counts {} overflow blocks but chains {}",
                meta.overflow_blocks, overflow_blocks
            ));
        }

        let allocated: BTreeSet<BlockId> = self.blocks.allocated_ids()?.into_iter().collect();
        let unreachable: Vec<_> = allocated.difference(&reachable).collect();
        if !unreachable.is_empty() {
            problems.push(format!("blocks {:?} are not reachable from the directory", unreachable));
        }
        Ok(problems)
    }

    fn hash(&self, key: u64) -> u64 {
        self.meta.get().hash_function.hash(key)
    }

    fn slot_for(&self, hash: u64) -> usize {
        (hash & low_bits(self.meta.get().global_depth)) as usize
    }

    fn bucket_at(&self, slot: usize) -> EngineResult<BlockId> {
        self.meta.get().directory.get(slot).copied().ok_or_else(|| {
            EngineError::Corrupted(format!("hash directory has no slot {}", slot))
        })
    }

    fn distinct_buckets(&self) -> Vec<BlockId> {
        let mut seen = HashSet::new();
        self.meta
            .get()
            .directory
            .iter()
            .copied()
            .filter(|id| seen.insert(*id))
            .collect()
    }

    fn read_bucket(&self, id: BlockId) -> EngineResult<Bucket> {
        match self.blocks.read(id)? {
            HashBlock::Bucket(bucket) => Ok(bucket),
            HashBlock::Overflow(_) => Err(EngineError::Corrupted(format!(
                "hash block {} is an overflow block, expected a bucket",
                id
            ))),
        }
    }

    fn load_chain(&self, id: BlockId) -> EngineResult<Chain> {
        let bucket = self.read_bucket(id)?;
        let mut overflow = Vec::new();
        let mut visited = HashSet::from([id]);
        let mut next = bucket.overflow;

        while next != NULL_BLOCK {
            if !visited.insert(next) {
                return Err(EngineError::Corrupted(format!(
                    "overflow chain of bucket {} loops at block {}",
                    id, next
                )));
            }
            match self.blocks.read(next)? {
                HashBlock::Overflow(block) => {
                    let following = block.next;
                    overflow.push((next, block));
                    next = following;
                }
                HashBlock::Bucket(_) => {
                    return Err(EngineError::Corrupted(format!(
                        "overflow chain of bucket {} links to bucket {}",
                        id, next
                    )))
                }
            }
        }
        Ok(Chain { id, bucket, overflow })
    }

    /// Splits a bucket on its next hash bit into itself and a new image.
    fn split(&mut self, id: BlockId, bucket: Bucket) -> EngineResult<()> {
        let depth = bucket.local_depth;
        if depth == self.meta.get().global_depth {
            self.double_directory();
        }

        let image = self.blocks.allocate()?;
        let bit = 1u64 << depth;
        let hash_function = self.meta.get().hash_function;
        let (upper, lower): (Vec<HashEntry>, Vec<HashEntry>) = bucket
            .entries
            .into_iter()
            .partition(|entry| hash_function.hash(entry.key) & bit != 0);

        debug!(
            "Splitting hash bucket {} at depth {}: {} stay, {} move to {}",
            id,
            depth,
            lower.len(),
            upper.len(),
            image
        );
        self.blocks.write(id, &HashBlock::Bucket(Bucket::new(depth + 1, lower)))?;
        self.blocks.write(image, &HashBlock::Bucket(Bucket::new(depth + 1, upper)))?;

        for (slot, target) in self.meta.get_mut().directory.iter_mut().enumerate() {
            if *target == id && slot as u64 & bit != 0 {
                *target = image;
            }
        }
        Ok(())
    }

    fn double_directory(&mut self) {
        let meta = self.meta.get_mut();
        meta.directory.extend_from_within(..);
        meta.global_depth += 1;
        debug!("Hash directory doubled to depth {}", meta.global_depth);
    }

    fn shrink_directory(&mut self) {
        let meta = self.meta.get_mut();
        while meta.global_depth > 0 {
            let half = meta.directory.len() / 2;
            if (0..half).any(|slot| meta.directory[slot] != meta.directory[slot + half]) {
                break;
            }
            meta.directory.truncate(half);
            meta.global_depth -= 1;
            debug!("Hash directory halved to depth {}", meta.global_depth);
        }
    }

    fn append_overflow(&mut self, chain: Chain, entry: HashEntry) -> EngineResult<()> {
        let Chain {
            id,
            mut bucket,
            mut overflow,
        } = chain;
        let capacity = self.overflow_capacity;

        if let Some((block_id, block)) = overflow
            .iter_mut()
            .find(|(_, block)| block.entries.len() < capacity)
        {
            block.entries.push(entry);
            return self.blocks.write(*block_id, &HashBlock::Overflow(block.clone()));
        }

        let new_id = self.blocks.allocate()?;
        self.blocks.write(
            new_id,
            &HashBlock::Overflow(OverflowBlock {
                entries: vec![entry],
                next: NULL_BLOCK,
            }),
        )?;
        match overflow.last_mut() {
            Some((last_id, last)) => {
                last.next = new_id;
                self.blocks.write(*last_id, &HashBlock::Overflow(last.clone()))?;
            }
            None => {
                bucket.overflow = new_id;
                self.blocks.write(id, &HashBlock::Bucket(bucket))?;
            }
        }

        self.meta.get_mut().overflow_blocks += 1;
        debug!("Hash bucket {} chained overflow block {}", id, new_id);
        Ok(())
    }

    /// Lays `entries` out over the chain again, front to back, and frees
    /// overflow blocks left empty.
    fn rewrite_chain(&mut self, chain: Chain, mut entries: Vec<HashEntry>) -> EngineResult<()> {
        let Chain {
            id,
            mut bucket,
            overflow,
        } = chain;

        let mut rest = entries.split_off(entries.len().min(self.bucket_capacity));
        bucket.entries = entries;

        let mut kept: Vec<(BlockId, OverflowBlock)> = Vec::new();
        let mut released = 0u64;
        for (block_id, mut block) in overflow {
            if rest.is_empty() {
                self.blocks.free(block_id)?;
                released += 1;
                continue;
            }
            let tail = rest.split_off(rest.len().min(self.overflow_capacity));
            block.entries = rest;
            rest = tail;
            kept.push((block_id, block));
        }

        bucket.overflow = kept.first().map_or(NULL_BLOCK, |(block_id, _)| *block_id);
        let links: Vec<BlockId> = kept
            .iter()
            .skip(1)
            .map(|(block_id, _)| *block_id)
            .chain(std::iter::once(NULL_BLOCK))
            .collect();
        for ((block_id, mut block), next) in kept.into_iter().zip(links) {
            block.next = next;
            self.blocks.write(block_id, &HashBlock::Overflow(block))?;
        }
        self.blocks.write(id, &HashBlock::Bucket(bucket))?;

        if released > 0 {
            let meta = self.meta.get_mut();
            meta.overflow_blocks = meta.overflow_blocks.saturating_sub(released);
            debug!("Hash bucket {} released {} overflow blocks", id, released);
        }
        Ok(())
    }

    /// Folds the bucket `hash` maps to into its split image for as long as
    /// both fit one bucket.
    fn merge_buddies(&mut self, hash: u64) -> EngineResult<()> {
        loop {
            let slot = self.slot_for(hash);
            let id = self.bucket_at(slot)?;
            let bucket = self.read_bucket(id)?;
            let depth = bucket.local_depth;
            if depth == 0 || bucket.overflow != NULL_BLOCK {
                return Ok(());
            }

            let bit = 1usize << (depth - 1);
            let buddy_id = self.bucket_at(slot ^ bit)?;
            if buddy_id == id {
                return Ok(());
            }
            let buddy = self.read_bucket(buddy_id)?;
            if buddy.local_depth != depth
                || buddy.overflow != NULL_BLOCK
                || bucket.entries.len() + buddy.entries.len() > self.bucket_capacity
            {
                return Ok(());
            }

            let (keep_id, mut keep, gone_id, gone) = if slot & bit == 0 {
                (id, bucket, buddy_id, buddy)
            } else {
                (buddy_id, buddy, id, bucket)
            };
            keep.local_depth = depth - 1;
            keep.entries.extend(gone.entries);
            self.blocks.write(keep_id, &HashBlock::Bucket(keep))?;
            self.blocks.free(gone_id)?;
            for target in self.meta.get_mut().directory.iter_mut() {
                if *target == gone_id {
                    *target = keep_id;
                }
            }
            debug!(
                "Merged hash bucket {} into {} at depth {}",
                gone_id,
                keep_id,
                depth - 1
            );
        }
    }
}

impl Journaled for ExtendibleHashIndex {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn layout(capacity: usize, hash_function: HashFunction) -> StoreLayout {
        StoreLayout {
            bucket_capacity: capacity,
            overflow_capacity: capacity,
            hash_function,
            ..StoreLayout::default()
        }
    }

    fn at(key: u64) -> RecordLocation {
        RecordLocation::new(key / 8 + 1, (key % 8) as u16)
    }

    fn assert_sound(index: &ExtendibleHashIndex) {
        let problems = index.check_invariants().unwrap();
        assert!(problems.is_empty(), "{:#?}", problems);
    }

    #[test]
    fn test_insert_lookup_delete() {
        let dir = tempdir().unwrap();
        let mut index = ExtendibleHashIndex::create(dir.path(), &layout(4, HashFunction::Xxh3), 16).unwrap();

        for key in 0..50 {
            index.insert(key, at(key)).unwrap();
        }
        assert_eq!(index.len(), 50);
        for key in 0..50 {
            assert_eq!(index.lookup(key).unwrap(), at(key));
        }
        assert_eq!(index.get(99).unwrap(), None);
        assert_eq!(index.lookup(99).unwrap_err().kind(), ErrorKind::KeyNotFound);

        assert_eq!(index.delete(7).unwrap(), at(7));
        assert_eq!(index.get(7).unwrap(), None);
        assert_eq!(index.delete(7).unwrap_err().kind(), ErrorKind::KeyNotFound);
        assert_sound(&index);
    }

    #[test]
    fn test_duplicate_key_is_rejected() {
        let dir = tempdir().unwrap();
        let mut index = ExtendibleHashIndex::create(dir.path(), &layout(2, HashFunction::Identity), 16).unwrap();
        index.insert(5, at(5)).unwrap();
        let err = index.insert(5, at(6)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateKey);
        assert_eq!(index.lookup(5).unwrap(), at(5));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_one_overfull_bucket_splits_once() {
        let dir = tempdir().unwrap();
        let mut index = ExtendibleHashIndex::create(dir.path(), &layout(4, HashFunction::Identity), 16).unwrap();

        for key in 0..=4 {
            index.insert(key, at(key)).unwrap();
        }
        let stats = index.stats();
        assert_eq!(stats.global_depth, 1);
        assert_eq!(stats.buckets, 2);
        assert_eq!(stats.overflow_blocks, 0);
        for key in 0..=4 {
            assert_eq!(index.lookup(key).unwrap(), at(key));
        }

        let dump = index.sequential_dump().unwrap();
        let keys: Vec<Vec<u64>> = dump
            .iter()
            .map(|bucket| bucket.entries.iter().map(|e| e.key).collect())
            .collect();
        assert_eq!(keys, vec![vec![0, 2, 4], vec![1, 3]]);
        assert_sound(&index);
    }

    #[test]
    fn test_colliding_keys_chain_overflow_blocks() {
        let dir = tempdir().unwrap();
        let layout = StoreLayout {
            bucket_capacity: 2,
            overflow_capacity: 2,
            max_hash_depth: 1,
            hash_function: HashFunction::Modulo(4),
            ..StoreLayout::default()
        };
        let mut index = ExtendibleHashIndex::create(dir.path(), &layout, 16).unwrap();

        let keys = [0u64, 4, 8, 12, 16, 20];
        for key in keys {
            index.insert(key, at(key)).unwrap();
        }
        let stats = index.stats();
        assert_eq!(stats.global_depth, 1);
        assert_eq!(stats.overflow_blocks, 2);
        for key in keys {
            assert_eq!(index.lookup(key).unwrap(), at(key));
        }
        assert_sound(&index);

        index.delete(0).unwrap();
        index.delete(4).unwrap();
        assert_eq!(index.stats().overflow_blocks, 1);
        assert_sound(&index);

        for key in [8, 12, 16, 20] {
            index.delete(key).unwrap();
        }
        let stats = index.stats();
        assert_eq!(stats.overflow_blocks, 0);
        assert_eq!(stats.global_depth, 0);
        assert_eq!(stats.buckets, 1);
        assert_sound(&index);
    }

    #[test]
    fn test_directory_shrinks_back_after_deletes() {
        let dir = tempdir().unwrap();
        let mut index = ExtendibleHashIndex::create(dir.path(), &layout(2, HashFunction::Identity), 16).unwrap();
        for key in 0..32 {
            index.insert(key, at(key)).unwrap();
        }
        assert_eq!(index.global_depth(), 4);
        assert_sound(&index);

        for key in 0..32 {
            index.delete(key).unwrap();
            assert_sound(&index);
        }
        assert_eq!(index.global_depth(), 0);
        assert_eq!(index.directory().len(), 1);
        assert_eq!(index.stats().blocks.blocks, 1);
    }

    #[test]
    fn test_random_operations_against_model() {
        let dir = tempdir().unwrap();
        let layout = StoreLayout {
            max_hash_depth: 8,
            ..layout(3, HashFunction::Modulo(50))
        };
        let mut index = ExtendibleHashIndex::create(dir.path(), &layout, 64).unwrap();
        let mut model = BTreeMap::new();
        let mut rng = StdRng::seed_from_u64(50);

        for round in 0..600 {
            let key = rng.gen_range(0..400u64);
            if rng.gen_bool(0.6) {
                let result = index.insert(key, at(key));
                if model.insert(key, at(key)).is_some() {
                    assert_eq!(result.unwrap_err().kind(), ErrorKind::DuplicateKey);
                } else {
                    result.unwrap();
                }
            } else {
                let result = index.delete(key);
                match model.remove(&key) {
                    Some(location) => assert_eq!(result.unwrap(), location),
                    None => assert_eq!(result.unwrap_err().kind(), ErrorKind::KeyNotFound),
                }
            }
            if round % 50 == 0 {
                assert_sound(&index);
            }
        }

        assert_sound(&index);
        let stored = index.entries().unwrap();
        let expected: Vec<_> = model.into_iter().collect();
        assert_eq!(stored, expected);
    }

    #[test]
    fn test_rollback_restores_structure() {
        let dir = tempdir().unwrap();
        let mut index = ExtendibleHashIndex::create(dir.path(), &layout(2, HashFunction::Identity), 16).unwrap();
        for key in [0, 2] {
            index.insert(key, at(key)).unwrap();
        }
        let before = index.image().unwrap();

        index.begin().unwrap();
        // two splits, each doubling the directory
        index.insert(4, at(4)).unwrap();
        index.insert(1, at(1)).unwrap();
        index.save(false).unwrap();
        assert_ne!(index.image().unwrap(), before);
        index.rollback().unwrap();

        assert_eq!(index.image().unwrap(), before);
        assert_eq!(index.get(4).unwrap(), None);
        assert_sound(&index);
    }

    #[test]
    fn test_reopen() {
        let dir = tempdir().unwrap();
        let layout = layout(2, HashFunction::Identity);
        {
            let mut index = ExtendibleHashIndex::create(dir.path(), &layout, 16).unwrap();
            index.begin().unwrap();
            for key in 0..10 {
                index.insert(key, at(key)).unwrap();
            }
            index.save(true).unwrap();
            index.commit();
        }

        let index = ExtendibleHashIndex::open(dir.path(), &layout, 16).unwrap();
        assert_eq!(index.len(), 10);
        assert_eq!(index.lookup(9).unwrap(), at(9));
        assert_sound(&index);

        let other = StoreLayout {
            hash_function: HashFunction::Xxh3,
            ..layout
        };
        assert_eq!(
            ExtendibleHashIndex::open(dir.path(), &other, 16).err().unwrap().kind(),
            ErrorKind::Corrupted
        );
    }
}
