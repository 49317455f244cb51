use std::path::PathBuf;

use crate::config::{StoreConfig, StoreLayout, MAX_HASH_DEPTH_LIMIT, MAX_QUADTREE_DEPTH_LIMIT};
use crate::coordinator::RecordCoordinator;
use crate::errors::{EngineError, EngineResult};
use crate::geometry::BoundingBox;
use crate::index::HashFunction;

/// Builder for opening or creating a store.
///
/// `StoreBuilder` provides a fluent API over [`StoreConfig`]. Setters that
/// receive an unusable value remember the first such error and
/// [`open_or_create`](Self::open_or_create) returns it; the remaining
/// checks run on the finished configuration when the store is opened.
///
/// Layout settings only take effect when the store is created. An existing
/// store is always opened with the layout it was created with.
///
/// # Examples
///
/// ```rust,no_run
/// use tristore::{BoundingBox, HashFunction, StoreBuilder};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let store = StoreBuilder::new()
///     .path("/var/lib/parcels")
///     .region(BoundingBox::new(0.0, 0.0, 1000.0, 1000.0))
///     .bucket_capacity(32)
///     .hash_function(HashFunction::Xxh3)
///     .open_or_create()?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct StoreBuilder {
    error: Option<EngineError>,
    config: StoreConfig,
}

impl StoreBuilder {
    pub fn new() -> Self {
        StoreBuilder {
            error: None,
            config: StoreConfig::default(),
        }
    }

    /// Starts from an existing configuration.
    pub fn from_config(config: StoreConfig) -> Self {
        StoreBuilder { error: None, config }
    }

    /// Directory holding the store's files. It is created if missing.
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.path = path.into();
        self
    }

    /// Replaces the whole layout.
    pub fn layout(mut self, layout: StoreLayout) -> Self {
        self.config.layout = layout;
        self
    }

    pub fn block_size(mut self, block_size: usize) -> Self {
        self.config.layout.block_size = block_size;
        self
    }

    pub fn records_per_block(mut self, records: usize) -> Self {
        self.config.layout.records_per_block = records;
        self
    }

    pub fn bucket_capacity(mut self, capacity: usize) -> Self {
        self.config.layout.bucket_capacity = capacity;
        self
    }

    pub fn overflow_capacity(mut self, capacity: usize) -> Self {
        self.config.layout.overflow_capacity = capacity;
        self
    }

    /// Deepest the hash directory may grow. Must not exceed
    /// [`MAX_HASH_DEPTH_LIMIT`].
    pub fn max_hash_depth(mut self, depth: u8) -> Self {
        if depth > MAX_HASH_DEPTH_LIMIT {
            self.fail(format!(
                "max hash depth {} exceeds {}",
                depth, MAX_HASH_DEPTH_LIMIT
            ));
        }
        self.config.layout.max_hash_depth = depth;
        self
    }

    pub fn hash_function(mut self, hash_function: HashFunction) -> Self {
        if hash_function == HashFunction::Modulo(0) {
            self.fail("modulo hash needs a non-zero modulus".to_string());
        }
        self.config.layout.hash_function = hash_function;
        self
    }

    pub fn quadtree_capacity(mut self, capacity: usize) -> Self {
        self.config.layout.quadtree_capacity = capacity;
        self
    }

    /// Depth at which quadtree leaves stop splitting. Must not exceed
    /// [`MAX_QUADTREE_DEPTH_LIMIT`].
    pub fn quadtree_max_depth(mut self, depth: u32) -> Self {
        if depth > MAX_QUADTREE_DEPTH_LIMIT {
            self.fail(format!(
                "quadtree max depth {} exceeds {}",
                depth, MAX_QUADTREE_DEPTH_LIMIT
            ));
        }
        self.config.layout.quadtree_max_depth = depth;
        self
    }

    /// Region covered by the quadtree; positions outside it are rejected.
    pub fn region(mut self, region: BoundingBox) -> Self {
        if !region.is_valid() {
            self.fail(format!("region {} is empty or unbounded", region));
        }
        self.config.layout.region = region;
        self
    }

    pub fn max_name_len(mut self, len: usize) -> Self {
        self.config.layout.max_name_len = len;
        self
    }

    pub fn max_description_len(mut self, len: usize) -> Self {
        self.config.layout.max_description_len = len;
        self
    }

    /// Blocks kept in each block file's read cache.
    pub fn cache_blocks(mut self, blocks: usize) -> Self {
        if blocks == 0 {
            self.fail("cache must hold at least one block".to_string());
        }
        self.config.cache_blocks = blocks;
        self
    }

    /// Whether block files are synced to disk after every mutation.
    pub fn sync_on_commit(mut self, sync: bool) -> Self {
        self.config.sync_on_commit = sync;
        self
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Opens the store, creating it if the directory holds none.
    ///
    /// # Errors
    ///
    /// Returns the first error captured by a setter, or any error raised
    /// while validating the configuration and opening the store.
    pub fn open_or_create(self) -> EngineResult<RecordCoordinator> {
        if let Some(err) = self.error {
            return Err(err);
        }
        RecordCoordinator::open(self.config)
    }

    fn fail(&mut self, message: String) {
        if self.error.is_none() {
            self.error = Some(EngineError::InvalidConfig(message));
        }
    }
}
