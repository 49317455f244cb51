//! Point quadtree over record positions.
//!
//! Every node is a block. A leaf holds up to `capacity` entries; inserting
//! one more splits it into four child leaves at the center of its region,
//! unless it already sits at the maximum depth, in which case the extra
//! entries go to overflow blocks chained behind it.
//!
//! After a delete, an internal node whose four children are plain leaves
//! whose entries fit into one leaf is collapsed back into a leaf, repeatedly
//! up the path to the root.

mod node;

pub use node::{QuadEntry, QuadNode};

use std::collections::{BTreeSet, HashSet};
use std::path::Path;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::config::StoreLayout;
use crate::errors::{EngineError, EngineResult};
use crate::geometry::{BoundingBox, Point};
use crate::record::RecordLocation;
use crate::storage::{
    BlockFile, BlockFileStats, BlockId, FileImage, FileKind, Journaled, MetaFile, NULL_BLOCK,
};
use node::Leaf;

pub const QUADTREE_BLOCKS_FILE: &str = "quadtree.blk";
pub const QUADTREE_META_FILE: &str = "quadtree.meta";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuadMeta {
    pub region: BoundingBox,
    pub root: BlockId,
    pub entries: u64,
    pub overflow_blocks: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuadTreeStats {
    pub entries: u64,
    pub internal_nodes: u64,
    pub leaves: u64,
    pub overflow_blocks: u64,
    pub depth: u32,
    pub blocks: BlockFileStats,
}

pub struct QuadTreeIndex {
    blocks: BlockFile<QuadNode>,
    meta: MetaFile<QuadMeta>,
    capacity: usize,
    max_depth: u32,
}

impl QuadTreeIndex {
    /// Creates a tree that is a single empty leaf covering the layout region.
    pub fn create(dir: &Path, layout: &StoreLayout, cache_blocks: usize) -> EngineResult<Self> {
        let mut blocks =
            BlockFile::create(&dir.join(QUADTREE_BLOCKS_FILE), layout.block_size, cache_blocks)?;
        let root = blocks.allocate()?;
        blocks.write(
            root,
            &QuadNode::Leaf {
                region: layout.region,
                depth: 0,
                entries: Vec::new(),
                overflow: NULL_BLOCK,
            },
        )?;

        let meta = MetaFile::create(
            &dir.join(QUADTREE_META_FILE),
            FileKind::QuadTree,
            QuadMeta {
                region: layout.region,
                root,
                entries: 0,
                overflow_blocks: 0,
            },
        )?;
        Ok(Self::from_parts(blocks, meta, layout))
    }

    pub fn open(dir: &Path, layout: &StoreLayout, cache_blocks: usize) -> EngineResult<Self> {
        let blocks =
            BlockFile::open(&dir.join(QUADTREE_BLOCKS_FILE), layout.block_size, cache_blocks)?;
        let meta: MetaFile<QuadMeta> =
            MetaFile::open(&dir.join(QUADTREE_META_FILE), FileKind::QuadTree)?;
        if meta.get().region != layout.region {
            return Err(EngineError::Corrupted(format!(
                "{}: covers {}, layout says {}",
                QUADTREE_META_FILE,
                meta.get().region,
                layout.region
            )));
        }
        Ok(Self::from_parts(blocks, meta, layout))
    }

    fn from_parts(blocks: BlockFile<QuadNode>, meta: MetaFile<QuadMeta>, layout: &StoreLayout) -> Self {
        QuadTreeIndex {
            blocks,
            meta,
            capacity: layout.quadtree_capacity,
            max_depth: layout.quadtree_max_depth,
        }
    }

    pub fn region(&self) -> BoundingBox {
        self.meta.get().region
    }

    pub fn len(&self) -> u64 {
        self.meta.get().entries
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Adds a record's position, splitting full leaves on the way.
    pub fn insert(&mut self, point: Point, key: u64, location: RecordLocation) -> EngineResult<()> {
        if !self.region().contains(&point) {
            return Err(EngineError::OutOfBounds(point));
        }

        let entry = QuadEntry { point, key, location };
        let mut id = self.meta.get().root;
        loop {
            match self.blocks.read(id)? {
                QuadNode::Internal {
                    region, children, ..
                } => {
                    id = children[region.quadrant_of(&point).index()];
                }
                QuadNode::Leaf {
                    region,
                    depth,
                    entries,
                    overflow,
                } => {
                    let mut leaf = self.load_leaf(id, region, depth, entries, overflow)?;
                    if leaf.entries.iter().any(|e| e.key == key && e.point == point) {
                        return Err(EngineError::DuplicateKey(format!("{} at {}", key, point)));
                    }
                    if leaf.entries.len() < self.capacity || leaf.depth >= self.max_depth {
                        leaf.entries.push(entry);
                        self.store_leaf(leaf)?;
                        break;
                    }
                    self.split(leaf)?;
                }
                QuadNode::Overflow { .. } => return Err(self.misplaced_overflow(id)),
            }
        }

        self.meta.get_mut().entries += 1;
        Ok(())
    }

    /// Removes the entry of record `key` at `point`.
    pub fn delete(&mut self, point: Point, key: u64) -> EngineResult<RecordLocation> {
        let not_found = || EngineError::PointNotFound { point, key };
        if !self.region().contains(&point) {
            return Err(not_found());
        }

        let mut path = Vec::new();
        let mut id = self.meta.get().root;
        let mut leaf = loop {
            match self.blocks.read(id)? {
                QuadNode::Internal {
                    region, children, ..
                } => {
                    path.push(id);
                    id = children[region.quadrant_of(&point).index()];
                }
                QuadNode::Leaf {
                    region,
                    depth,
                    entries,
                    overflow,
                } => break self.load_leaf(id, region, depth, entries, overflow)?,
                QuadNode::Overflow { .. } => return Err(self.misplaced_overflow(id)),
            }
        };

        let at = leaf
            .entries
            .iter()
            .position(|e| e.key == key && e.point == point)
            .ok_or_else(not_found)?;
        let removed = leaf.entries.remove(at);
        self.store_leaf(leaf)?;
        let meta = self.meta.get_mut();
        meta.entries = meta.entries.saturating_sub(1);

        for parent in path.into_iter().rev() {
            if !self.collapse(parent)? {
                break;
            }
        }
        Ok(removed.location)
    }

    /// Entries whose point lies in `query`, visiting only subtrees whose
    /// region intersects it.
    pub fn query_region(&self, query: &BoundingBox) -> EngineResult<Vec<QuadEntry>> {
        let mut found = Vec::new();
        let meta = self.meta.get();
        if !meta.region.intersects(query) {
            return Ok(found);
        }

        let mut stack = vec![meta.root];
        while let Some(id) = stack.pop() {
            match self.blocks.read(id)? {
                QuadNode::Internal {
                    region, children, ..
                } => {
                    let regions = region.split();
                    for quadrant in (0..4).rev() {
                        if regions[quadrant].intersects(query) {
                            stack.push(children[quadrant]);
                        }
                    }
                }
                QuadNode::Leaf {
                    region,
                    depth,
                    entries,
                    overflow,
                } => {
                    let leaf = self.load_leaf(id, region, depth, entries, overflow)?;
                    found.extend(leaf.entries.into_iter().filter(|e| query.contains(&e.point)));
                }
                QuadNode::Overflow { .. } => return Err(self.misplaced_overflow(id)),
            }
        }
        Ok(found)
    }

    /// Entries stored exactly at `point`.
    pub fn find_at(&self, point: Point) -> EngineResult<Vec<QuadEntry>> {
        if !self.region().contains(&point) {
            return Ok(Vec::new());
        }
        let mut id = self.meta.get().root;
        loop {
            match self.blocks.read(id)? {
                QuadNode::Internal {
                    region, children, ..
                } => id = children[region.quadrant_of(&point).index()],
                QuadNode::Leaf {
                    region,
                    depth,
                    entries,
                    overflow,
                } => {
                    let leaf = self.load_leaf(id, region, depth, entries, overflow)?;
                    return Ok(leaf.entries.into_iter().filter(|e| e.point == point).collect());
                }
                QuadNode::Overflow { .. } => return Err(self.misplaced_overflow(id)),
            }
        }
    }

    /// Every entry in the tree.
    pub fn all(&self) -> EngineResult<Vec<QuadEntry>> {
        self.query_region(&self.region())
    }

    /// Depth of the deepest leaf.
    pub fn depth(&self) -> EngineResult<u32> {
        Ok(self.stats_walk()?.depth)
    }

    pub fn stats(&self) -> EngineResult<QuadTreeStats> {
        self.stats_walk()
    }

    pub fn image(&self) -> EngineResult<(QuadMeta, FileImage<QuadNode>)> {
        Ok((self.meta.get().clone(), self.blocks.image()?))
    }

    pub fn sync(&self) -> EngineResult<()> {
        self.blocks.sync()
    }

    /// Walks the whole tree and reports every broken invariant.
    pub fn check_invariants(&self) -> EngineResult<Vec<String>> {
        let meta = self.meta.get();
        let mut problems = Vec::new();
        let mut reachable = BTreeSet::new();
        let mut entries = 0u64;
        let mut overflow_blocks = 0u64;
        let mut stack = vec![(meta.root, meta.region, 0u32)];

        while let Some((id, expected_region, expected_depth)) = stack.pop() {
            if !reachable.insert(id) {
                problems.push(format!("node {} is reachable twice", id));
                continue;
            }
            let node = match self.blocks.read(id) {
                Ok(node) => node,
                Err(err) => {
                    problems.push(format!("node {}: {}", id, err));
                    continue;
                }
            };

            match node {
                QuadNode::Internal {
                    region,
                    depth,
                    children,
                } => {
                    check_placement(&mut problems, id, region, depth, expected_region, expected_depth);
                    if depth >= self.max_depth {
                        problems.push(format!("internal node {} sits at the maximum depth", id));
                    }
                    let regions = region.split();
                    for quadrant in 0..4 {
                        stack.push((children[quadrant], regions[quadrant], depth + 1));
                    }
                    if let Some(total) = self.collapsible_total(&children)? {
                        if total <= self.capacity {
                            problems.push(format!(
                                "internal node {} has leaf children holding only {} entries",
                                id, total
                            ));
                        }
                    }
                }
                QuadNode::Leaf {
                    region,
                    depth,
                    entries: primary,
                    overflow,
                } => {
                    check_placement(&mut problems, id, region, depth, expected_region, expected_depth);
                    if primary.len() > self.capacity {
                        problems.push(format!(
                            "leaf {} holds {} entries, capacity {}",
                            id,
                            primary.len(),
                            self.capacity
                        ));
                    }
                    if overflow != NULL_BLOCK && depth < self.max_depth {
                        problems.push(format!("leaf {} chains overflow above the maximum depth", id));
                    }

                    let mut all = primary;
                    let mut next = overflow;
                    while next != NULL_BLOCK {
                        if !reachable.insert(next) {
                            problems.push(format!("overflow chain of leaf {} loops at {}", id, next));
                            break;
                        }
                        match self.blocks.read(next)? {
                            QuadNode::Overflow {
                                entries: extra,
                                next: following,
                            } => {
                                overflow_blocks += 1;
                                if extra.is_empty() || extra.len() > self.capacity {
                                    problems.push(format!(
                                        "overflow block {} holds {} entries, capacity {}",
                                        next,
                                        extra.len(),
                                        self.capacity
                                    ));
                                }
                                all.extend(extra);
                                next = following;
                            }
                            _ => {
                                problems.push(format!("leaf {} links to non-overflow block {}", id, next));
                                break;
                            }
                        }
                    }

                    for entry in &all {
                        if !region.contains(&entry.point) {
                            problems.push(format!(
                                "record {} at {} lies outside leaf {} region {}",
                                entry.key, entry.point, id, region
                            ));
                        }
                    }
                    entries += all.len() as u64;
                }
                QuadNode::Overflow { .. } => {
                    problems.push(format!("overflow block {} is linked as a tree node", id));
                }
            }
        }

        if entries != meta.entries {
            problems.push(format!("tree counts {} entries but holds {}", meta.entries, entries));
        }
        if overflow_blocks != meta.overflow_blocks {
            problems.push(format!(
                "tree counts {} overflow blocks but chains {}",
                meta.overflow_blocks, overflow_blocks
            ));
        }
        let allocated: BTreeSet<BlockId> = self.blocks.allocated_ids()?.into_iter().collect();
        let unreachable: Vec<_> = allocated.difference(&reachable).collect();
        if !unreachable.is_empty() {
            problems.push(format!("blocks {:?} are not reachable from the root", unreachable));
        }
        Ok(problems)
    }

    fn misplaced_overflow(&self, id: BlockId) -> EngineError {
        EngineError::Corrupted(format!("overflow block {} is linked as a tree node", id))
    }

    fn load_leaf(
        &self,
        id: BlockId,
        region: BoundingBox,
        depth: u32,
        mut entries: Vec<QuadEntry>,
        first_overflow: BlockId,
    ) -> EngineResult<Leaf> {
        let mut overflow = Vec::new();
        let mut visited = HashSet::from([id]);
        let mut next = first_overflow;
        while next != NULL_BLOCK {
            if !visited.insert(next) {
                return Err(EngineError::Corrupted(format!(
                    "overflow chain of leaf {} loops at block {}",
                    id, next
                )));
            }
            match self.blocks.read(next)? {
                QuadNode::Overflow {
                    entries: extra,
                    next: following,
                } => {
                    entries.extend(extra);
                    overflow.push(next);
                    next = following;
                }
                _ => {
                    return Err(EngineError::Corrupted(format!(
                        "leaf {} links to non-overflow block {}",
                        id, next
                    )))
                }
            }
        }
        Ok(Leaf {
            id,
            region,
            depth,
            entries,
            overflow,
        })
    }

    /// Writes a leaf back, spreading its entries over the primary block and
    /// as many overflow blocks as needed.
    fn store_leaf(&mut self, leaf: Leaf) -> EngineResult<()> {
        let Leaf {
            id,
            region,
            depth,
            mut entries,
            overflow,
        } = leaf;

        let mut rest = entries.split_off(entries.len().min(self.capacity));
        let mut existing = overflow.into_iter();
        let mut chunks: Vec<(BlockId, Vec<QuadEntry>)> = Vec::new();
        let mut allocated = 0u64;
        while !rest.is_empty() {
            let tail = rest.split_off(rest.len().min(self.capacity));
            let block = match existing.next() {
                Some(block) => block,
                None => {
                    allocated += 1;
                    self.blocks.allocate()?
                }
            };
            chunks.push((block, rest));
            rest = tail;
        }
        let mut released = 0u64;
        for block in existing {
            self.blocks.free(block)?;
            released += 1;
        }

        let first = chunks.first().map_or(NULL_BLOCK, |(block, _)| *block);
        let links: Vec<BlockId> = chunks
            .iter()
            .skip(1)
            .map(|(block, _)| *block)
            .chain(std::iter::once(NULL_BLOCK))
            .collect();
        for ((block, extra), next) in chunks.into_iter().zip(links) {
            self.blocks.write(
                block,
                &QuadNode::Overflow {
                    entries: extra,
                    next,
                },
            )?;
        }
        self.blocks.write(
            id,
            &QuadNode::Leaf {
                region,
                depth,
                entries,
                overflow: first,
            },
        )?;

        if allocated != released {
            let meta = self.meta.get_mut();
            meta.overflow_blocks = (meta.overflow_blocks + allocated).saturating_sub(released);
            debug!(
                "Quadtree leaf {} at depth {} now chains {} overflow blocks",
                id, depth, meta.overflow_blocks
            );
        }
        Ok(())
    }

    /// Turns a full leaf into an internal node with four child leaves.
    fn split(&mut self, leaf: Leaf) -> EngineResult<()> {
        let regions = leaf.region.split();
        let mut buckets: [Vec<QuadEntry>; 4] = Default::default();
        for entry in leaf.entries {
            buckets[leaf.region.quadrant_of(&entry.point).index()].push(entry);
        }

        let mut children = [NULL_BLOCK; 4];
        for (quadrant, entries) in buckets.into_iter().enumerate() {
            let child = self.blocks.allocate()?;
            self.blocks.write(
                child,
                &QuadNode::Leaf {
                    region: regions[quadrant],
                    depth: leaf.depth + 1,
                    entries,
                    overflow: NULL_BLOCK,
                },
            )?;
            children[quadrant] = child;
        }
        self.blocks.write(
            leaf.id,
            &QuadNode::Internal {
                region: leaf.region,
                depth: leaf.depth,
                children,
            },
        )?;
        debug!(
            "Split quadtree leaf {} at depth {} into {:?}",
            leaf.id, leaf.depth, children
        );
        Ok(())
    }

    /// Total entries of the children if all four are leaves without
    /// overflow, `None` otherwise.
    fn collapsible_total(&self, children: &[BlockId; 4]) -> EngineResult<Option<usize>> {
        let mut total = 0;
        for child in children {
            match self.blocks.read(*child)? {
                QuadNode::Leaf {
                    entries, overflow, ..
                } if overflow == NULL_BLOCK => total += entries.len(),
                _ => return Ok(None),
            }
        }
        Ok(Some(total))
    }

    /// Folds the four leaf children of `id` back into it when they fit one
    /// leaf. Returns whether it did.
    fn collapse(&mut self, id: BlockId) -> EngineResult<bool> {
        let (region, depth, children) = match self.blocks.read(id)? {
            QuadNode::Internal {
                region,
                depth,
                children,
            } => (region, depth, children),
            _ => return Ok(false),
        };
        match self.collapsible_total(&children)? {
            Some(total) if total <= self.capacity => {}
            _ => return Ok(false),
        }

        let mut entries = Vec::new();
        for child in children {
            if let QuadNode::Leaf { entries: held, .. } = self.blocks.read(child)? {
                entries.extend(held);
            }
            self.blocks.free(child)?;
        }
        self.blocks.write(
            id,
            &QuadNode::Leaf {
                region,
                depth,
                entries,
                overflow: NULL_BLOCK,
            },
        )?;
        debug!("Collapsed quadtree node {} at depth {} into a leaf", id, depth);
        Ok(true)
    }

    fn stats_walk(&self) -> EngineResult<QuadTreeStats> {
        let meta = self.meta.get();
        let mut stats = QuadTreeStats {
            entries: meta.entries,
            overflow_blocks: meta.overflow_blocks,
            blocks: self.blocks.stats(),
            ..QuadTreeStats::default()
        };
        let mut stack = vec![meta.root];
        while let Some(id) = stack.pop() {
            match self.blocks.read(id)? {
                QuadNode::Internal { children, .. } => {
                    stats.internal_nodes += 1;
                    stack.extend(children);
                }
                QuadNode::Leaf { depth, .. } => {
                    stats.leaves += 1;
                    stats.depth = stats.depth.max(depth);
                }
                QuadNode::Overflow { .. } => return Err(self.misplaced_overflow(id)),
            }
        }
        Ok(stats)
    }
}

fn check_placement(
    problems: &mut Vec<String>,
    id: BlockId,
    region: BoundingBox,
    depth: u32,
    expected_region: BoundingBox,
    expected_depth: u32,
) {
    if region != expected_region {
        problems.push(format!(
            "node {} covers {} but its parent assigns {}",
            id, region, expected_region
        ));
    }
    if depth != expected_depth {
        problems.push(format!(
            "node {} records depth {} but sits at depth {}",
            id, depth, expected_depth
        ));
    }
}

impl Journaled for QuadTreeIndex {
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
    use std::collections::BTreeSet;
    use tempfile::tempdir;

    fn layout(capacity: usize, max_depth: u32) -> StoreLayout {
        StoreLayout {
            quadtree_capacity: capacity,
            quadtree_max_depth: max_depth,
            region: BoundingBox::new(0.0, 0.0, 10.0, 10.0),
            ..StoreLayout::default()
        }
    }

    fn at(key: u64) -> RecordLocation {
        RecordLocation::new(key + 1, 0)
    }

    fn keys(entries: &[QuadEntry]) -> BTreeSet<u64> {
        entries.iter().map(|e| e.key).collect()
    }

    fn assert_sound(tree: &QuadTreeIndex) {
        let problems = tree.check_invariants().unwrap();
        assert!(problems.is_empty(), "{:#?}", problems);
    }

    #[test]
    fn test_region_query_prunes_to_matching_points() {
        let dir = tempdir().unwrap();
        let mut tree = QuadTreeIndex::create(dir.path(), &layout(4, 8), 16).unwrap();
        tree.insert(Point::new(2.0, 2.0), 1, at(1)).unwrap();
        tree.insert(Point::new(8.0, 8.0), 2, at(2)).unwrap();

        let south_west = tree.query_region(&BoundingBox::new(0.0, 0.0, 5.0, 5.0)).unwrap();
        assert_eq!(keys(&south_west), BTreeSet::from([1]));
        assert_eq!(keys(&tree.all().unwrap()), BTreeSet::from([1, 2]));
        assert!(tree
            .query_region(&BoundingBox::new(20.0, 20.0, 30.0, 30.0))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_out_of_bounds_and_missing_points() {
        let dir = tempdir().unwrap();
        let mut tree = QuadTreeIndex::create(dir.path(), &layout(4, 8), 16).unwrap();

        let err = tree.insert(Point::new(10.0, 3.0), 1, at(1)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfBounds);
        let err = tree.insert(Point::new(-0.1, 3.0), 1, at(1)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfBounds);

        tree.insert(Point::new(3.0, 3.0), 1, at(1)).unwrap();
        let err = tree.delete(Point::new(3.0, 3.1), 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PointNotFound);
        let err = tree.delete(Point::new(3.0, 3.0), 2).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PointNotFound);
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_full_leaf_splits_into_quadrants() {
        let dir = tempdir().unwrap();
        let mut tree = QuadTreeIndex::create(dir.path(), &layout(2, 8), 16).unwrap();
        tree.insert(Point::new(1.0, 9.0), 1, at(1)).unwrap();
        tree.insert(Point::new(9.0, 9.0), 2, at(2)).unwrap();
        assert_eq!(tree.stats().unwrap().leaves, 1);

        tree.insert(Point::new(1.0, 1.0), 3, at(3)).unwrap();
        let stats = tree.stats().unwrap();
        assert_eq!(stats.internal_nodes, 1);
        assert_eq!(stats.leaves, 4);
        assert_eq!(stats.depth, 1);
        assert_sound(&tree);

        // dropping back to capacity folds the children into the root again
        tree.delete(Point::new(9.0, 9.0), 2).unwrap();
        let stats = tree.stats().unwrap();
        assert_eq!(stats.internal_nodes, 0);
        assert_eq!(stats.leaves, 1);
        assert_eq!(stats.blocks.blocks, 1);
        assert_sound(&tree);
    }

    #[test]
    fn test_center_point_belongs_to_north_east() {
        let dir = tempdir().unwrap();
        let mut tree = QuadTreeIndex::create(dir.path(), &layout(1, 8), 16).unwrap();
        tree.insert(Point::new(5.0, 5.0), 1, at(1)).unwrap();
        tree.insert(Point::new(4.0, 4.0), 2, at(2)).unwrap();

        let north_east = tree.query_region(&BoundingBox::new(5.0, 5.0, 10.0, 10.0)).unwrap();
        assert_eq!(keys(&north_east), BTreeSet::from([1]));
        let south_west = tree.query_region(&BoundingBox::new(0.0, 0.0, 5.0, 5.0)).unwrap();
        assert_eq!(keys(&south_west), BTreeSet::from([2]));
        assert_sound(&tree);
    }

    #[test]
    fn test_shared_position_overflows_at_max_depth() {
        let dir = tempdir().unwrap();
        let mut tree = QuadTreeIndex::create(dir.path(), &layout(2, 2), 16).unwrap();
        let spot = Point::new(7.5, 2.5);
        for key in 0..7 {
            tree.insert(spot, key, at(key)).unwrap();
        }

        let stats = tree.stats().unwrap();
        assert_eq!(stats.depth, 2);
        assert_eq!(stats.overflow_blocks, 3);
        assert_eq!(keys(&tree.find_at(spot).unwrap()).len(), 7);
        assert_sound(&tree);

        let err = tree.insert(spot, 3, at(3)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateKey);

        for key in 0..7 {
            assert_eq!(tree.delete(spot, key).unwrap(), at(key));
            assert_sound(&tree);
        }
        let stats = tree.stats().unwrap();
        assert_eq!(stats.overflow_blocks, 0);
        assert_eq!(stats.leaves, 1);
        assert!(tree.is_empty());
    }

    #[test]
    fn test_random_points_match_brute_force() {
        let dir = tempdir().unwrap();
        let mut tree = QuadTreeIndex::create(dir.path(), &layout(3, 6), 64).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let mut stored: Vec<(Point, u64)> = Vec::new();

        for key in 0..300u64 {
            // coarse grid so positions repeat
            let point = Point::new(
                rng.gen_range(0..40u32) as f64 / 4.0,
                rng.gen_range(0..40u32) as f64 / 4.0,
            );
            tree.insert(point, key, at(key)).unwrap();
            stored.push((point, key));
        }
        for _ in 0..120 {
            let (point, key) = stored.swap_remove(rng.gen_range(0..stored.len()));
            tree.delete(point, key).unwrap();
        }
        assert_sound(&tree);
        assert_eq!(tree.len(), stored.len() as u64);

        for _ in 0..40 {
            let x = rng.gen_range(0.0..10.0);
            let y = rng.gen_range(0.0..10.0);
            let query = BoundingBox::new(x, y, x + rng.gen_range(0.1..6.0), y + rng.gen_range(0.1..6.0));
            let expected: BTreeSet<u64> = stored
                .iter()
                .filter(|(p, _)| query.contains(p))
                .map(|(_, k)| *k)
                .collect();
            assert_eq!(keys(&tree.query_region(&query).unwrap()), expected);
        }
    }

    #[test]
    fn test_rollback_undoes_split() {
        let dir = tempdir().unwrap();
        let mut tree = QuadTreeIndex::create(dir.path(), &layout(2, 8), 16).unwrap();
        tree.insert(Point::new(1.0, 1.0), 1, at(1)).unwrap();
        tree.insert(Point::new(2.0, 2.0), 2, at(2)).unwrap();
        let before = tree.image().unwrap();

        tree.begin().unwrap();
        tree.insert(Point::new(3.0, 3.0), 3, at(3)).unwrap();
        assert_ne!(tree.image().unwrap(), before);
        tree.rollback().unwrap();

        assert_eq!(tree.image().unwrap(), before);
        assert_sound(&tree);
    }

    #[test]
    fn test_reopen_checks_region() {
        let dir = tempdir().unwrap();
        {
            let mut tree = QuadTreeIndex::create(dir.path(), &layout(2, 8), 16).unwrap();
            tree.begin().unwrap();
            for key in 0..9 {
                tree.insert(Point::new(key as f64, 9.0 - key as f64), key, at(key)).unwrap();
            }
            tree.save(true).unwrap();
            tree.commit();
        }

        let tree = QuadTreeIndex::open(dir.path(), &layout(2, 8), 16).unwrap();
        assert_eq!(tree.len(), 9);
        assert_sound(&tree);

        let wider = StoreLayout {
            region: BoundingBox::new(0.0, 0.0, 20.0, 20.0),
            ..layout(2, 8)
        };
        assert_eq!(
            QuadTreeIndex::open(dir.path(), &wider, 16).err().unwrap().kind(),
            ErrorKind::Corrupted
        );
    }
}
