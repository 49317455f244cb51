use rand::Rng;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::{env, fs};
use tristore::errors::EngineResult;
use tristore::{BoundingBox, HashFunction, Point, Record, RecordCoordinator, StoreBuilder, StoreLayout};

/// Names handed out by [`random_record`]. Several share prefixes so prefix
/// queries have something to separate.
pub const NAMES: [&str; 8] = ["ann", "anna", "annabel", "bob", "bobby", "carl", "carla", "dora"];

/// Runs `test` against the context created by `before`, then always runs
/// `after`. A failing test is reported after the cleanup.
pub fn run_test<B, T, A>(before: B, test: T, after: A)
where
    B: Fn() -> EngineResult<TestContext>,
    T: Fn(TestContext) -> EngineResult<()>,
    A: Fn(TestContext) -> EngineResult<()>,
{
    let ctx = match before() {
        Ok(ctx) => ctx,
        Err(e) => panic!("Before run failed: {:?}", e),
    };

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| test(ctx.clone())));
    let cleanup = after(ctx);

    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => panic!("Test failed: {:?}", e),
        Err(panic) => panic::resume_unwind(panic),
    }
    if let Err(e) = cleanup {
        panic!("After run failed: {:?}", e);
    }
}

#[derive(Clone)]
pub struct TestContext {
    path: PathBuf,
    store: RecordCoordinator,
}

impl TestContext {
    pub fn new(path: PathBuf, store: RecordCoordinator) -> Self {
        Self { path, store }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn store(&self) -> RecordCoordinator {
        self.store.clone()
    }

    /// Closes the store and opens it again from disk.
    pub fn reopen(&self) -> EngineResult<RecordCoordinator> {
        if !self.store.is_closed() {
            self.store.close()?;
        }
        StoreBuilder::new().path(&self.path).open_or_create()
    }
}

pub fn random_path() -> PathBuf {
    let id: u64 = rand::random();
    env::temp_dir().join(format!("tristore-{:016x}", id))
}

/// A small layout over `[0, 10) x [0, 10)` that splits, overflows and
/// collapses after a handful of records.
pub fn test_layout() -> StoreLayout {
    StoreLayout {
        region: BoundingBox::new(0.0, 0.0, 10.0, 10.0),
        records_per_block: 4,
        bucket_capacity: 4,
        overflow_capacity: 4,
        max_hash_depth: 8,
        hash_function: HashFunction::Identity,
        quadtree_capacity: 4,
        quadtree_max_depth: 8,
        ..StoreLayout::default()
    }
}

pub fn create_test_context() -> EngineResult<TestContext> {
    create_test_context_with(test_layout())
}

pub fn create_test_context_with(layout: StoreLayout) -> EngineResult<TestContext> {
    let path = random_path();
    let store = StoreBuilder::new().path(&path).layout(layout).open_or_create()?;
    Ok(TestContext::new(path, store))
}

pub fn cleanup(ctx: TestContext) -> EngineResult<()> {
    if !ctx.store.is_closed() {
        ctx.store.close()?;
    }
    if ctx.path.exists() {
        fs::remove_dir_all(&ctx.path)?;
    }
    Ok(())
}

pub fn parcel(key: u64, x: f64, y: f64, name: &str) -> Record {
    Record::new(key, Point::new(x, y), name)
}

/// A record with a random position inside `region` and a random name.
pub fn random_record<R: Rng>(rng: &mut R, key: u64, region: &BoundingBox) -> Record {
    let x = rng.gen_range(region.min_x..region.max_x);
    let y = rng.gen_range(region.min_y..region.max_y);
    let name = NAMES[rng.gen_range(0..NAMES.len())];
    Record::new(key, Point::new(x, y), name).with_description(format!("generated parcel {}", key))
}

pub fn assert_consistent(store: &RecordCoordinator) {
    let report = store.check_integrity().expect("integrity check failed to run");
    assert!(report.is_consistent(), "{}", report);
}

pub fn keys(records: &[Record]) -> Vec<u64> {
    records.iter().map(|record| record.key).collect()
}
