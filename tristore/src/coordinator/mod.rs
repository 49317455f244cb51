//! The public face of a store.
//!
//! [`RecordCoordinator`] owns an [`EngineContext`](context::EngineContext)
//! behind a single read/write lock: queries share the read lock, every
//! mutation takes the write lock and runs as one atomic unit over the record
//! heap and the three indices.

mod context;
mod failpoint;
mod integrity;
mod stats;

pub use failpoint::FailPoint;
pub use integrity::IntegrityReport;
pub use stats::{StoreStats, StoreStructure};

pub use context::MANIFEST_FILE;

use std::path::PathBuf;
use std::sync::Arc;

use log::{info, warn};
use parking_lot::{MappedRwLockReadGuard, MappedRwLockWriteGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::builder::StoreBuilder;
use crate::config::{StoreConfig, StoreLayout};
use crate::errors::{EngineError, EngineResult};
use crate::geometry::BoundingBox;
use crate::record::Record;
use context::EngineContext;

/// A file-backed record store indexed by key, position and name.
///
/// `RecordCoordinator` is cheap to clone; clones share the same open store.
/// Queries may run concurrently with each other, mutations are serialized.
///
/// Every mutation either reaches the heap and all three indices or none of
/// them. When a step fails, the changes made so far are rolled back and the
/// failing step's error is returned. If the rollback itself fails, the
/// mutation reports [`EngineError::RollbackFailed`] and the store answers
/// every later call with [`EngineError::Poisoned`].
///
/// # Examples
///
/// ```rust,no_run
/// use tristore::{BoundingBox, Point, Record, RecordCoordinator};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let store = RecordCoordinator::builder().path("parcels").open_or_create()?;
///
/// store.insert(Record::new(1, Point::new(2.0, 2.0), "ann"))?;
/// store.insert(Record::new(2, Point::new(8.0, 8.0), "bob"))?;
///
/// let near_origin = store.find_in_region(&BoundingBox::new(0.0, 0.0, 5.0, 5.0))?;
/// assert_eq!(near_origin.len(), 1);
/// assert_eq!(store.find_by_prefix("a")?[0].key, 1);
///
/// store.close()?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RecordCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    path: PathBuf,
    context: RwLock<Option<EngineContext>>,
}

impl RecordCoordinator {
    pub fn builder() -> StoreBuilder {
        StoreBuilder::new()
    }

    /// Opens the store described by `config`, creating it if the directory
    /// does not hold one yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, a file cannot be
    /// read or written, or an existing file is corrupted or was written with
    /// another format version.
    pub fn open(config: StoreConfig) -> EngineResult<Self> {
        let context = EngineContext::open(&config)?;
        Ok(RecordCoordinator {
            inner: Arc::new(CoordinatorInner {
                path: config.path,
                context: RwLock::new(Some(context)),
            }),
        })
    }

    /// Directory the store lives in.
    pub fn path(&self) -> PathBuf {
        self.inner.path.clone()
    }

    /// The layout the store was created with.
    pub fn layout(&self) -> EngineResult<StoreLayout> {
        Ok(self.read()?.layout().clone())
    }

    /// Inserts a new record.
    ///
    /// # Errors
    ///
    /// * [`EngineError::DuplicateIdentity`] if a record with the same key
    ///   exists.
    /// * [`EngineError::OutOfBounds`] if the position lies outside the
    ///   region the quadtree covers.
    /// * [`EngineError::RecordTooLarge`] if the name or description exceed
    ///   the layout's limits.
    pub fn insert(&self, record: Record) -> EngineResult<()> {
        self.write()?.insert(record)
    }

    /// Inserts `record` under a freshly generated key, one past the highest
    /// key in use, and returns that key. The key carried by `record` is
    /// ignored.
    pub fn insert_generated(&self, record: Record) -> EngineResult<u64> {
        self.write()?.insert_generated(record)
    }

    /// Replaces the stored record with the same key.
    ///
    /// A change of position or name moves the record in the indices; a
    /// change of the description alone rewrites it in place.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::RecordNotFound`] if no record has that key.
    pub fn update(&self, record: Record) -> EngineResult<()> {
        self.write()?.update(record)
    }

    /// Replaces the record stored under `old_key` with `record`, which may
    /// carry a new key.
    pub fn replace(&self, old_key: u64, record: Record) -> EngineResult<()> {
        self.write()?.replace(old_key, record)
    }

    /// Deletes the record with `key` and returns it.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::RecordNotFound`] if no record has that key.
    pub fn delete(&self, key: u64) -> EngineResult<Record> {
        self.write()?.delete(key)
    }

    pub fn find_by_key(&self, key: u64) -> EngineResult<Option<Record>> {
        self.read()?.find_by_key(key)
    }

    /// Records positioned inside `region`, ordered by key.
    pub fn find_in_region(&self, region: &BoundingBox) -> EngineResult<Vec<Record>> {
        self.read()?.find_in_region(region)
    }

    /// Records whose name starts with `prefix`, ordered by name and then by
    /// key.
    pub fn find_by_prefix(&self, prefix: &str) -> EngineResult<Vec<Record>> {
        self.read()?.find_by_prefix(prefix)
    }

    /// Records named exactly `name`, ordered by key.
    pub fn find_by_name(&self, name: &str) -> EngineResult<Vec<Record>> {
        self.read()?.find_by_name(name)
    }

    /// Every record, ordered by key.
    pub fn all(&self) -> EngineResult<Vec<Record>> {
        self.read()?.all()
    }

    pub fn len(&self) -> EngineResult<u64> {
        Ok(self.read()?.len())
    }

    pub fn is_empty(&self) -> EngineResult<bool> {
        Ok(self.len()? == 0)
    }

    pub fn stats(&self) -> EngineResult<StoreStats> {
        self.read()?.stats()
    }

    /// Snapshot of every block and every piece of bookkeeping in the store.
    pub fn structure(&self) -> EngineResult<StoreStructure> {
        self.read()?.structure()
    }

    /// Checks the heap and every index on its own and against each other.
    pub fn check_integrity(&self) -> EngineResult<IntegrityReport> {
        self.read()?.check_integrity()
    }

    /// Forces all block files to disk.
    pub fn flush(&self) -> EngineResult<()> {
        self.read()?.flush()
    }

    /// Flushes and closes the store. Every clone sees it closed afterwards.
    pub fn close(&self) -> EngineResult<()> {
        let context = self.inner.context.write().take().ok_or(EngineError::Closed)?;
        if context.is_poisoned() {
            warn!("Closing poisoned store in {} without flushing", context.dir().display());
            return Ok(());
        }
        context.flush()?;
        info!("Closed store in {}", context.dir().display());
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.context.read().is_none()
    }

    /// Makes the next mutation fail at `point`.
    #[cfg(any(test, feature = "failpoints"))]
    pub fn arm_failpoint(&self, point: FailPoint) -> EngineResult<()> {
        self.write()?.failpoints().arm(point);
        Ok(())
    }

    #[cfg(any(test, feature = "failpoints"))]
    pub fn disarm_failpoints(&self) -> EngineResult<()> {
        self.write()?.failpoints().disarm();
        Ok(())
    }

    fn read(&self) -> EngineResult<MappedRwLockReadGuard<'_, EngineContext>> {
        let context = RwLockReadGuard::try_map(self.inner.context.read(), Option::as_ref)
            .map_err(|_| EngineError::Closed)?;
        if context.is_poisoned() {
            return Err(EngineError::Poisoned);
        }
        Ok(context)
    }

    fn write(&self) -> EngineResult<MappedRwLockWriteGuard<'_, EngineContext>> {
        let context = RwLockWriteGuard::try_map(self.inner.context.write(), Option::as_mut)
            .map_err(|_| EngineError::Closed)?;
        if context.is_poisoned() {
            return Err(EngineError::Poisoned);
        }
        Ok(context)
    }
}

impl Drop for CoordinatorInner {
    fn drop(&mut self) {
        if let Some(context) = self.context.get_mut().take() {
            if context.is_poisoned() {
                return;
            }
            if let Err(err) = context.flush() {
                warn!("Failed to flush store in {} on drop: {}", self.path.display(), err);
            }
        }
    }
}
