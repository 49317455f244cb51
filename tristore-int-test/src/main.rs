use rand::rngs::StdRng;
use rand::SeedableRng;
use std::time::Instant;
use tristore::errors::EngineResult;
use tristore::BoundingBox;
use tristore_int_test::test_util::{cleanup, create_test_context_with, random_record, test_layout};

fn main() -> EngineResult<()> {
    colog::init();
    println!("Starting stress test...");

    let mut layout = test_layout();
    layout.bucket_capacity = 32;
    layout.quadtree_capacity = 16;
    layout.max_hash_depth = 16;
    layout.quadtree_max_depth = 16;
    let ctx = create_test_context_with(layout.clone())?;
    let store = ctx.store();
    let mut rng = StdRng::seed_from_u64(2024);

    let count = 20_000u64;
    let start = Instant::now();
    for _ in 0..count {
        store.insert_generated(random_record(&mut rng, 0, &layout.region))?;
    }
    println!("Inserted {} records in {:?}", count, start.elapsed());

    let start = Instant::now();
    let found = store.find_in_region(&BoundingBox::new(2.5, 2.5, 5.0, 5.0))?;
    println!("Found {} records in region in {:?}", found.len(), start.elapsed());

    let start = Instant::now();
    let found = store.find_by_prefix("ann")?;
    println!("Found {} records by prefix in {:?}", found.len(), start.elapsed());

    let start = Instant::now();
    for key in (1..=count).step_by(2) {
        store.delete(key)?;
    }
    println!("Deleted {} records in {:?}", count / 2, start.elapsed());

    println!("{}", store.stats()?);
    println!("{}", store.check_integrity()?);
    cleanup(ctx)
}
