//! Character trie over record names.
//!
//! Names are not unique: every terminal node carries the postings of all
//! records with that name. A node keeps as many of them as fit next to its
//! children and chains further [`TriePostings`] blocks for the rest.
//! Children are kept in a `BTreeMap`, so walking a subtree yields names in
//! ascending character order. Nodes left with neither postings nor children
//! are pruned on delete, walking back towards the root.

mod node;

pub use node::{inline_capacity, Posting, TrieBlock, TrieNode, TriePostings};

use std::collections::{BTreeSet, HashSet};
use std::path::Path;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::config::StoreLayout;
use crate::errors::{EngineError, EngineResult};
use crate::record::RecordLocation;
use crate::storage::{BlockFile, BlockFileStats, BlockId, FileImage, FileKind, Journaled, MetaFile, NULL_BLOCK};

pub const TRIE_BLOCKS_FILE: &str = "trie.blk";
pub const TRIE_META_FILE: &str = "trie.meta";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrieMeta {
    pub root: BlockId,
    pub postings: u64,
    pub terminals: u64,
    /// Blocks holding chained postings
    pub posting_blocks: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrieStats {
    pub postings: u64,
    pub terminals: u64,
    pub nodes: u64,
    pub posting_blocks: u64,
    pub blocks: BlockFileStats,
}

pub struct TrieIndex {
    blocks: BlockFile<TrieBlock>,
    meta: MetaFile<TrieMeta>,
    node_postings: usize,
    chain_postings: usize,
}

impl TrieIndex {
    pub fn create(dir: &Path, layout: &StoreLayout, cache_blocks: usize) -> EngineResult<Self> {
        let mut blocks = BlockFile::create(&dir.join(TRIE_BLOCKS_FILE), layout.block_size, cache_blocks)?;
        let root = blocks.allocate()?;
        blocks.write(root, &TrieBlock::Node(TrieNode::new(0)))?;
        let meta = MetaFile::create(
            &dir.join(TRIE_META_FILE),
            FileKind::Trie,
            TrieMeta {
                root,
                postings: 0,
                terminals: 0,
                posting_blocks: 0,
            },
        )?;
        Ok(Self::from_parts(blocks, meta, layout))
    }

    pub fn open(dir: &Path, layout: &StoreLayout, cache_blocks: usize) -> EngineResult<Self> {
        let blocks = BlockFile::open(&dir.join(TRIE_BLOCKS_FILE), layout.block_size, cache_blocks)?;
        let meta = MetaFile::open(&dir.join(TRIE_META_FILE), FileKind::Trie)?;
        Ok(Self::from_parts(blocks, meta, layout))
    }

    fn from_parts(blocks: BlockFile<TrieBlock>, meta: MetaFile<TrieMeta>, layout: &StoreLayout) -> Self {
        TrieIndex {
            blocks,
            meta,
            node_postings: inline_capacity(layout.block_size),
            chain_postings: TriePostings::capacity(layout.block_size).max(1),
        }
    }

    /// Number of postings.
    pub fn len(&self) -> u64 {
        self.meta.get().postings
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of distinct names.
    pub fn terminal_count(&self) -> u64 {
        self.meta.get().terminals
    }

    /// Files record `key` under `name`, creating missing nodes on the way.
    pub fn insert(&mut self, name: &str, key: u64, location: RecordLocation) -> EngineResult<()> {
        let mut id = self.meta.get().root;
        let mut node = self.read_node(id)?;
        for symbol in name.chars() {
            let next = match node.children.get(&symbol) {
                Some(child) => *child,
                None => {
                    let child = self.blocks.allocate()?;
                    self.write_node(child, &TrieNode::new(node.depth + 1))?;
                    node.children.insert(symbol, child);
                    self.write_node(id, &node)?;
                    child
                }
            };
            id = next;
            node = self.read_node(id)?;
        }

        let (mut postings, chain) = self.load_postings(id, &node)?;
        let at = match postings.binary_search_by_key(&key, |posting| posting.key) {
            Ok(_) => return Err(EngineError::DuplicateKey(format!("{} #{}", name, key))),
            Err(at) => at,
        };
        let was_terminal = node.is_terminal();
        postings.insert(at, Posting { key, location });
        self.store_postings(id, node, postings, chain)?;

        let meta = self.meta.get_mut();
        meta.postings += 1;
        if !was_terminal {
            meta.terminals += 1;
        }
        Ok(())
    }

    /// Postings filed under exactly `name`; empty when there are none.
    pub fn postings(&self, name: &str) -> EngineResult<Vec<Posting>> {
        match self.find(name)? {
            Some((id, node)) => Ok(self.load_postings(id, &node)?.0),
            None => Ok(Vec::new()),
        }
    }

    /// Like [`postings`](Self::postings), but a name without records is an
    /// error.
    pub fn lookup(&self, name: &str) -> EngineResult<Vec<Posting>> {
        let postings = self.postings(name)?;
        if postings.is_empty() {
            return Err(EngineError::KeyNotFound(name.to_string()));
        }
        Ok(postings)
    }

    /// Every `(name, posting)` whose name starts with `prefix`, ordered by
    /// name and then by key.
    pub fn prefix_search(&self, prefix: &str) -> EngineResult<Vec<(String, Posting)>> {
        let mut found = Vec::new();
        let start = match self.find(prefix)? {
            Some((id, _)) => id,
            None => return Ok(found),
        };

        let mut stack = vec![(start, prefix.to_string())];
        while let Some((id, name)) = stack.pop() {
            let node = self.read_node(id)?;
            let (postings, _) = self.load_postings(id, &node)?;
            found.extend(postings.into_iter().map(|posting| (name.clone(), posting)));
            for (symbol, child) in node.children.iter().rev() {
                let mut longer = name.clone();
                longer.push(*symbol);
                stack.push((*child, longer));
            }
        }
        Ok(found)
    }

    /// Withdraws record `key` from `name`, compacting its posting chain and
    /// pruning nodes that become dead.
    pub fn delete(&mut self, name: &str, key: u64) -> EngineResult<RecordLocation> {
        let not_found = || EngineError::KeyNotFound(format!("{} #{}", name, key));

        let mut path = Vec::new();
        let mut id = self.meta.get().root;
        let mut node = self.read_node(id)?;
        for symbol in name.chars() {
            let child = *node.children.get(&symbol).ok_or_else(not_found)?;
            path.push((id, symbol));
            id = child;
            node = self.read_node(id)?;
        }

        let (mut postings, chain) = self.load_postings(id, &node)?;
        let at = postings
            .binary_search_by_key(&key, |posting| posting.key)
            .map_err(|_| not_found())?;
        let removed = postings.remove(at);
        let mut node = self.store_postings(id, node, postings, chain)?;

        let meta = self.meta.get_mut();
        meta.postings = meta.postings.saturating_sub(1);
        if !node.is_terminal() {
            meta.terminals = meta.terminals.saturating_sub(1);
        }

        let mut pruned = 0;
        while node.is_dead() {
            let (parent_id, symbol) = match path.pop() {
                Some(step) => step,
                None => break,
            };
            self.blocks.free(id)?;
            pruned += 1;
            let mut parent = self.read_node(parent_id)?;
            parent.children.remove(&symbol);
            self.write_node(parent_id, &parent)?;
            id = parent_id;
            node = parent;
        }
        if pruned > 0 {
            debug!("Pruned {} trie nodes below '{}'", pruned, name.chars().take(path.len()).collect::<String>());
        }
        Ok(removed.location)
    }

    pub fn stats(&self) -> TrieStats {
        let meta = self.meta.get();
        let blocks = self.blocks.stats();
        TrieStats {
            postings: meta.postings,
            terminals: meta.terminals,
            nodes: blocks.blocks.saturating_sub(meta.posting_blocks),
            posting_blocks: meta.posting_blocks,
            blocks,
        }
    }

    pub fn image(&self) -> EngineResult<(TrieMeta, FileImage<TrieBlock>)> {
        Ok((self.meta.get().clone(), self.blocks.image()?))
    }

    pub fn sync(&self) -> EngineResult<()> {
        self.blocks.sync()
    }

    /// Walks the whole trie and reports every broken invariant.
    pub fn check_invariants(&self) -> EngineResult<Vec<String>> {
        let meta = self.meta.get();
        let mut problems = Vec::new();
        let mut reachable = BTreeSet::new();
        let mut postings = 0u64;
        let mut terminals = 0u64;
        let mut posting_blocks = 0u64;
        let mut stack = vec![(meta.root, 0u32)];

        while let Some((id, depth)) = stack.pop() {
            if !reachable.insert(id) {
                problems.push(format!("trie node {} is reachable twice", id));
                continue;
            }
            let node = match self.read_node(id) {
                Ok(node) => node,
                Err(err) => {
                    problems.push(format!("trie node {}: {}", id, err));
                    continue;
                }
            };
            if node.depth != depth {
                problems.push(format!(
                    "trie node {} records depth {} but sits at depth {}",
                    id, node.depth, depth
                ));
            }
            if id != meta.root && node.is_dead() {
                problems.push(format!("trie node {} is dead but not pruned", id));
            }
            if node.postings.len() > self.node_postings {
                problems.push(format!(
                    "trie node {} keeps {} postings inline, at most {} allowed",
                    id,
                    node.postings.len(),
                    self.node_postings
                ));
            }
            if node.postings_overflow != NULL_BLOCK && node.postings.len() < self.node_postings {
                problems.push(format!("trie node {} chains postings before it is full", id));
            }

            match self.load_postings(id, &node) {
                Ok((all, chain)) => {
                    if all.windows(2).any(|pair| pair[0].key >= pair[1].key) {
                        problems.push(format!("trie node {} has unsorted postings", id));
                    }
                    let needed = all
                        .len()
                        .saturating_sub(self.node_postings)
                        .div_ceil(self.chain_postings);
                    if chain.len() != needed {
                        problems.push(format!(
                            "trie node {} chains {} posting blocks but needs {}",
                            id,
                            chain.len(),
                            needed
                        ));
                    }
                    for block in &chain {
                        if !reachable.insert(*block) {
                            problems.push(format!("posting block {} is reachable twice", block));
                        }
                    }
                    posting_blocks += chain.len() as u64;
                    postings += all.len() as u64;
                }
                Err(err) => problems.push(format!("trie node {}: {}", id, err)),
            }
            if node.is_terminal() {
                terminals += 1;
            }
            stack.extend(node.children.values().map(|child| (*child, depth + 1)));
        }

        if postings != meta.postings {
            problems.push(format!("trie counts {} postings but holds {}", meta.postings, postings));
        }
        if terminals != meta.terminals {
            problems.push(format!(
                "trie counts {} terminals but holds {}",
                meta.terminals, terminals
            ));
        }
        if posting_blocks != meta.posting_blocks {
            problems.push(format!(
                "trie counts {} posting blocks but chains {}",
                meta.posting_blocks, posting_blocks
            ));
        }
        let allocated: BTreeSet<BlockId> = self.blocks.allocated_ids()?.into_iter().collect();
        let unreachable: Vec<_> = allocated.difference(&reachable).collect();
        if !unreachable.is_empty() {
            problems.push(format!("trie blocks {:?} are not reachable from the root", unreachable));
        }
        Ok(problems)
    }

    fn find(&self, name: &str) -> EngineResult<Option<(BlockId, TrieNode)>> {
        let mut id = self.meta.get().root;
        let mut node = self.read_node(id)?;
        for symbol in name.chars() {
            match node.children.get(&symbol) {
                Some(child) => {
                    id = *child;
                    node = self.read_node(id)?;
                }
                None => return Ok(None),
            }
        }
        Ok(Some((id, node)))
    }

    fn read_node(&self, id: BlockId) -> EngineResult<TrieNode> {
        match self.blocks.read(id)? {
            TrieBlock::Node(node) => Ok(node),
            TrieBlock::Postings(_) => Err(EngineError::Corrupted(format!(
                "posting block {} is linked as a trie node",
                id
            ))),
        }
    }

    fn write_node(&mut self, id: BlockId, node: &TrieNode) -> EngineResult<()> {
        self.blocks.write(id, &TrieBlock::Node(node.clone()))
    }

    /// All postings of a node, with the ids of its chain in chain order.
    fn load_postings(&self, id: BlockId, node: &TrieNode) -> EngineResult<(Vec<Posting>, Vec<BlockId>)> {
        let mut postings = node.postings.clone();
        let mut chain = Vec::new();
        let mut visited = HashSet::from([id]);
        let mut next = node.postings_overflow;
        while next != NULL_BLOCK {
            if !visited.insert(next) {
                return Err(EngineError::Corrupted(format!(
                    "posting chain of trie node {} loops at block {}",
                    id, next
                )));
            }
            match self.blocks.read(next)? {
                TrieBlock::Postings(block) => {
                    postings.extend(block.postings);
                    chain.push(next);
                    next = block.next;
                }
                TrieBlock::Node(_) => {
                    return Err(EngineError::Corrupted(format!(
                        "trie node {} chains node block {} as postings",
                        id, next
                    )))
                }
            }
        }
        Ok((postings, chain))
    }

    /// Writes `postings` back into the node and as many chained blocks as
    /// needed, reusing `chain` and freeing what is left over. Returns the
    /// node as written.
    fn store_postings(
        &mut self,
        id: BlockId,
        mut node: TrieNode,
        mut postings: Vec<Posting>,
        chain: Vec<BlockId>,
    ) -> EngineResult<TrieNode> {
        let mut rest = postings.split_off(postings.len().min(self.node_postings));
        let mut existing = chain.into_iter();
        let mut chunks: Vec<(BlockId, Vec<Posting>)> = Vec::new();
        let mut allocated = 0u64;
        while !rest.is_empty() {
            let tail = rest.split_off(rest.len().min(self.chain_postings));
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

        let links: Vec<BlockId> = chunks
            .iter()
            .skip(1)
            .map(|(block, _)| *block)
            .chain(std::iter::once(NULL_BLOCK))
            .collect();
        let chained = chunks.len();
        node.postings_overflow = chunks.first().map_or(NULL_BLOCK, |(block, _)| *block);
        for ((block, postings), next) in chunks.into_iter().zip(links) {
            self.blocks
                .write(block, &TrieBlock::Postings(TriePostings { postings, next }))?;
        }
        node.postings = postings;
        self.write_node(id, &node)?;

        if allocated != released {
            let meta = self.meta.get_mut();
            meta.posting_blocks = (meta.posting_blocks + allocated).saturating_sub(released);
            debug!(
                "Trie node {} at depth {} now chains {} posting blocks",
                id, node.depth, chained
            );
        }
        Ok(node)
    }
}

impl Journaled for TrieIndex {
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
