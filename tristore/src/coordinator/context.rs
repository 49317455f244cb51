use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::config::{StoreConfig, StoreLayout};
use crate::coordinator::failpoint::{FailPoint, FailPoints};
use crate::coordinator::integrity::IntegrityReport;
use crate::coordinator::stats::{StoreStats, StoreStructure};
use crate::errors::{EngineError, EngineResult};
use crate::geometry::BoundingBox;
use crate::index::{ExtendibleHashIndex, QuadTreeIndex, TrieIndex};
use crate::record::{Record, RecordLocation};
use crate::storage::{read_meta, write_meta, FileKind, Journaled, RecordHeap};

pub const MANIFEST_FILE: &str = "store.meta";

/// What a store directory was created with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Manifest {
    pub layout: StoreLayout,
}

/// Everything an open store owns: the record heap, the three indices and
/// the identity to location table.
///
/// The heap is the authority on which records exist. The location table is
/// rebuilt from a heap scan on open and the indices only ever hold copies
/// of its locations.
pub(crate) struct EngineContext {
    dir: PathBuf,
    layout: StoreLayout,
    sync_on_commit: bool,
    heap: RecordHeap,
    hash: ExtendibleHashIndex,
    quadtree: QuadTreeIndex,
    trie: TrieIndex,
    locations: BTreeMap<u64, RecordLocation>,
    /// Previous table values of keys changed by the running mutation
    location_undo: Vec<(u64, Option<RecordLocation>)>,
    failpoints: FailPoints,
    poisoned: bool,
}

impl EngineContext {
    /// Opens the store in `config.path`, creating it when the directory
    /// holds no manifest yet.
    pub fn open(config: &StoreConfig) -> EngineResult<Self> {
        config.validate()?;
        let manifest_path = config.path.join(MANIFEST_FILE);
        if manifest_path.exists() {
            Self::reopen(config, &manifest_path)
        } else {
            Self::create(config, &manifest_path)
        }
    }

    fn create(config: &StoreConfig, manifest_path: &Path) -> EngineResult<Self> {
        let dir = &config.path;
        let layout = config.layout.clone();
        fs::create_dir_all(dir)?;

        let heap = RecordHeap::create(dir, &layout, config.cache_blocks)?;
        let hash = ExtendibleHashIndex::create(dir, &layout, config.cache_blocks)?;
        let quadtree = QuadTreeIndex::create(dir, &layout, config.cache_blocks)?;
        let trie = TrieIndex::create(dir, &layout, config.cache_blocks)?;
        // written last, a directory without it is recreated from scratch
        write_meta(
            manifest_path,
            FileKind::Manifest,
            &Manifest {
                layout: layout.clone(),
            },
            true,
        )?;

        info!("Created store in {}", dir.display());
        Ok(Self::assemble(config, layout, heap, hash, quadtree, trie, BTreeMap::new()))
    }

    fn reopen(config: &StoreConfig, manifest_path: &Path) -> EngineResult<Self> {
        let dir = &config.path;
        let manifest: Manifest = read_meta(manifest_path, FileKind::Manifest)?;
        let layout = manifest.layout;
        layout.validate()?;
        if layout != config.layout {
            warn!(
                "Store in {} was created with a different layout, using the persisted one",
                dir.display()
            );
        }

        let heap = RecordHeap::open(dir, &layout, config.cache_blocks)?;
        let hash = ExtendibleHashIndex::open(dir, &layout, config.cache_blocks)?;
        let quadtree = QuadTreeIndex::open(dir, &layout, config.cache_blocks)?;
        let trie = TrieIndex::open(dir, &layout, config.cache_blocks)?;

        let locations: BTreeMap<u64, RecordLocation> = heap
            .scan()?
            .into_iter()
            .map(|(location, record)| (record.key, location))
            .collect();
        let counts = [heap.len(), hash.len(), quadtree.len(), trie.len()];
        if counts.iter().any(|count| *count != locations.len() as u64) {
            warn!(
                "Store in {} holds {} records but counts {:?} (heap, hash, quadtree, trie)",
                dir.display(),
                locations.len(),
                counts
            );
        }

        info!("Opened store in {} with {} records", dir.display(), locations.len());
        Ok(Self::assemble(config, layout, heap, hash, quadtree, trie, locations))
    }

    fn assemble(
        config: &StoreConfig,
        layout: StoreLayout,
        heap: RecordHeap,
        hash: ExtendibleHashIndex,
        quadtree: QuadTreeIndex,
        trie: TrieIndex,
        locations: BTreeMap<u64, RecordLocation>,
    ) -> Self {
        EngineContext {
            dir: config.path.clone(),
            layout,
            sync_on_commit: config.sync_on_commit,
            heap,
            hash,
            quadtree,
            trie,
            locations,
            location_undo: Vec::new(),
            failpoints: FailPoints::default(),
            poisoned: false,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    pub fn len(&self) -> u64 {
        self.locations.len() as u64
    }

    #[cfg(any(test, feature = "failpoints"))]
    pub fn failpoints(&mut self) -> &mut FailPoints {
        &mut self.failpoints
    }

    pub fn insert(&mut self, record: Record) -> EngineResult<()> {
        self.atomically(|ctx| {
            ctx.check_identity_free(record.key)?;
            ctx.add(&record)
        })
    }

    /// Stores `record` under one past the highest key in use and returns
    /// that key.
    pub fn insert_generated(&mut self, mut record: Record) -> EngineResult<u64> {
        let key = match self.locations.keys().next_back() {
            Some(last) => last
                .checked_add(1)
                .ok_or(EngineError::DuplicateIdentity(*last))?,
            None => 1,
        };
        record.key = key;
        self.insert(record)?;
        Ok(key)
    }

    pub fn update(&mut self, record: Record) -> EngineResult<()> {
        self.atomically(|ctx| {
            let location = ctx.location_of(record.key)?;
            let current = ctx.materialize(record.key, location)?;
            if current.differs_in_indexed_fields(&record) {
                ctx.remove(record.key)?;
                ctx.add(&record)
            } else {
                ctx.heap.rewrite(location, &record)
            }
        })
    }

    /// Swaps the record stored under `old_key` for `record`, which may carry
    /// a different key.
    pub fn replace(&mut self, old_key: u64, record: Record) -> EngineResult<()> {
        self.atomically(|ctx| {
            ctx.location_of(old_key)?;
            if record.key != old_key {
                ctx.check_identity_free(record.key)?;
            }
            ctx.remove(old_key)?;
            ctx.add(&record)
        })
    }

    pub fn delete(&mut self, key: u64) -> EngineResult<Record> {
        self.atomically(|ctx| ctx.remove(key))
    }

    /// Runs `apply` as one unit over the heap and all three indices: either
    /// every change it makes is committed or none is.
    fn atomically<R>(&mut self, apply: impl FnOnce(&mut Self) -> EngineResult<R>) -> EngineResult<R> {
        if self.poisoned {
            return Err(EngineError::Poisoned);
        }

        let outcome = match self.begin() {
            Ok(()) => apply(self).and_then(|value| self.finish().map(|()| value)),
            Err(err) => Err(err),
        };
        match outcome {
            Ok(value) => {
                self.commit();
                Ok(value)
            }
            Err(cause) => Err(self.abort(cause)),
        }
    }

    fn components(&mut self) -> [&mut dyn Journaled; 4] {
        [&mut self.heap, &mut self.hash, &mut self.quadtree, &mut self.trie]
    }

    fn begin(&mut self) -> EngineResult<()> {
        self.location_undo.clear();
        for component in self.components() {
            component.begin()?;
        }
        Ok(())
    }

    fn finish(&mut self) -> EngineResult<()> {
        let sync = self.sync_on_commit;
        for component in self.components() {
            component.save(sync)?;
        }
        self.failpoints.check(FailPoint::BeforeCommit)
    }

    fn commit(&mut self) {
        for component in self.components() {
            component.commit();
        }
        self.location_undo.clear();
    }

    fn abort(&mut self, cause: EngineError) -> EngineError {
        warn!("Rolling back mutation after failure: {}", cause);
        match self.rollback() {
            Ok(()) => cause,
            Err(rollback) => {
                error!(
                    "Rollback after '{}' failed, store in {} is poisoned: {}",
                    cause,
                    self.dir.display(),
                    rollback
                );
                self.poisoned = true;
                EngineError::RollbackFailed {
                    cause: Box::new(cause),
                    rollback: Box::new(rollback),
                }
            }
        }
    }

    fn rollback(&mut self) -> EngineResult<()> {
        self.failpoints.check(FailPoint::DuringRollback)?;

        let mut failure = None;
        for component in self.components() {
            if let Err(err) = component.rollback() {
                error!("Failed to roll back store component: {}", err);
                failure.get_or_insert(err);
            }
        }
        while let Some((key, previous)) = self.location_undo.pop() {
            match previous {
                Some(location) => self.locations.insert(key, location),
                None => self.locations.remove(&key),
            };
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn set_location(&mut self, key: u64, location: Option<RecordLocation>) {
        let previous = match location {
            Some(location) => self.locations.insert(key, location),
            None => self.locations.remove(&key),
        };
        self.location_undo.push((key, previous));
    }

    fn check_identity_free(&self, key: u64) -> EngineResult<()> {
        if self.locations.contains_key(&key) {
            return Err(EngineError::DuplicateIdentity(key));
        }
        Ok(())
    }

    fn location_of(&self, key: u64) -> EngineResult<RecordLocation> {
        self.locations
            .get(&key)
            .copied()
            .ok_or(EngineError::RecordNotFound(key))
    }

    /// Stores a record and files it in the hash index, the quadtree and the
    /// trie, in that order.
    fn add(&mut self, record: &Record) -> EngineResult<()> {
        let location = self.heap.store(record)?;
        self.failpoints.check(FailPoint::AfterStorageWrite)?;
        self.hash.insert(record.key, location)?;
        self.failpoints.check(FailPoint::AfterHashInsert)?;
        self.quadtree.insert(record.position, record.key, location)?;
        self.failpoints.check(FailPoint::AfterQuadTreeInsert)?;
        self.trie.insert(&record.name, record.key, location)?;
        self.failpoints.check(FailPoint::AfterTrieInsert)?;

        self.set_location(record.key, Some(location));
        debug!("Stored record {} at {}", record, location);
        Ok(())
    }

    fn remove(&mut self, key: u64) -> EngineResult<Record> {
        let location = self.location_of(key)?;
        let record = self.heap.remove(location)?;
        if record.key != key {
            return Err(EngineError::Corrupted(format!(
                "slot {} holds record {} instead of {}",
                location, record.key, key
            )));
        }

        let filed = [
            ("hash", self.hash.delete(key)?),
            ("quadtree", self.quadtree.delete(record.position, key)?),
            ("trie", self.trie.delete(&record.name, key)?),
        ];
        for (index, indexed) in filed {
            if indexed != location {
                return Err(EngineError::Corrupted(format!(
                    "{} index files record {} at {} instead of {}",
                    index, key, indexed, location
                )));
            }
        }

        self.set_location(key, None);
        debug!("Removed record {} from {}", record, location);
        Ok(record)
    }

    pub fn find_by_key(&self, key: u64) -> EngineResult<Option<Record>> {
        match self.hash.get(key)? {
            Some(location) => self.materialize(key, location).map(Some),
            None => Ok(None),
        }
    }

    pub fn find_in_region(&self, region: &BoundingBox) -> EngineResult<Vec<Record>> {
        let mut entries = self.quadtree.query_region(region)?;
        entries.sort_by_key(|entry| entry.key);
        entries
            .into_iter()
            .map(|entry| self.materialize(entry.key, entry.location))
            .collect()
    }

    pub fn find_by_prefix(&self, prefix: &str) -> EngineResult<Vec<Record>> {
        self.trie
            .prefix_search(prefix)?
            .into_iter()
            .map(|(_, posting)| self.materialize(posting.key, posting.location))
            .collect()
    }

    pub fn find_by_name(&self, name: &str) -> EngineResult<Vec<Record>> {
        self.trie
            .postings(name)?
            .into_iter()
            .map(|posting| self.materialize(posting.key, posting.location))
            .collect()
    }

    /// Every record, ordered by key.
    pub fn all(&self) -> EngineResult<Vec<Record>> {
        self.locations
            .iter()
            .map(|(key, location)| self.materialize(*key, *location))
            .collect()
    }

    fn materialize(&self, key: u64, location: RecordLocation) -> EngineResult<Record> {
        let record = self.heap.load(location)?;
        if record.key != key {
            return Err(EngineError::Corrupted(format!(
                "index points record {} at {} which holds record {}",
                key, location, record.key
            )));
        }
        Ok(record)
    }

    pub fn stats(&self) -> EngineResult<StoreStats> {
        Ok(StoreStats {
            records: self.len(),
            heap: self.heap.stats(),
            hash: self.hash.stats(),
            quadtree: self.quadtree.stats()?,
            trie: self.trie.stats(),
        })
    }

    pub fn structure(&self) -> EngineResult<StoreStructure> {
        Ok(StoreStructure {
            heap: self.heap.image()?,
            hash: self.hash.image()?,
            quadtree: self.quadtree.image()?,
            trie: self.trie.image()?,
        })
    }

    /// Checks every structure on its own and then checks that all of them
    /// agree with the heap.
    pub fn check_integrity(&self) -> EngineResult<IntegrityReport> {
        let mut report = IntegrityReport {
            records: self.len(),
            ..IntegrityReport::default()
        };
        report.extend("heap", self.heap.check()?);
        report.extend("hash", self.hash.check_invariants()?);
        report.extend("quadtree", self.quadtree.check_invariants()?);
        report.extend("trie", self.trie.check_invariants()?);

        let stored: BTreeMap<u64, (RecordLocation, Record)> = self
            .heap
            .scan()?
            .into_iter()
            .map(|(location, record)| (record.key, (location, record)))
            .collect();

        let table: BTreeMap<u64, RecordLocation> = stored
            .iter()
            .map(|(key, (location, _))| (*key, *location))
            .collect();
        if table != self.locations {
            report.push("coordinator", "location table disagrees with the heap".to_string());
        }

        let mut hashed = BTreeSet::new();
        for (key, location) in self.hash.entries()? {
            hashed.insert(key);
            match stored.get(&key) {
                Some((stored_at, _)) if *stored_at == location => {}
                Some((stored_at, _)) => report.push(
                    "hash",
                    format!("record {} filed at {} but stored at {}", key, location, stored_at),
                ),
                None => report.push("hash", format!("record {} is not stored", key)),
            }
        }

        let mut placed = BTreeSet::new();
        for entry in self.quadtree.all()? {
            placed.insert(entry.key);
            match stored.get(&entry.key) {
                Some((stored_at, record))
                    if *stored_at == entry.location && record.position == entry.point => {}
                Some(_) => report.push(
                    "quadtree",
                    format!("record {} filed at {} disagrees with the heap", entry.key, entry.point),
                ),
                None => report.push("quadtree", format!("record {} is not stored", entry.key)),
            }
        }

        let mut named = BTreeSet::new();
        for (name, posting) in self.trie.prefix_search("")? {
            named.insert(posting.key);
            match stored.get(&posting.key) {
                Some((stored_at, record)) if *stored_at == posting.location && record.name == name => {}
                Some(_) => report.push(
                    "trie",
                    format!("record {} filed under '{}' disagrees with the heap", posting.key, name),
                ),
                None => report.push("trie", format!("record {} is not stored", posting.key)),
            }
        }

        for (index, seen) in [("hash", &hashed), ("quadtree", &placed), ("trie", &named)] {
            let missing: Vec<_> = stored.keys().filter(|key| !seen.contains(key)).collect();
            if !missing.is_empty() {
                report.push(index, format!("records {:?} are not indexed", missing));
            }
        }
        Ok(report)
    }

    /// Forces every block file to disk. Metadata files are rewritten by each
    /// committed mutation.
    pub fn flush(&self) -> EngineResult<()> {
        self.heap.sync()?;
        self.hash.sync()?;
        self.quadtree.sync()?;
        self.trie.sync()?;
        debug!("Flushed store in {}", self.dir.display());
        Ok(())
    }
}
