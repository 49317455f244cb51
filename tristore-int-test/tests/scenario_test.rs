use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fs;
use tristore::{BoundingBox, HashFunction, StoreLayout};
use tristore_int_test::test_util::{
    assert_consistent, cleanup, create_test_context, create_test_context_with, keys, parcel,
    random_record, run_test, test_layout,
};

#[ctor::ctor]
fn init() {
    colog::init();
}

#[test]
fn test_two_parcels() {
    run_test(
        || create_test_context(),
        |ctx| {
            let store = ctx.store();
            let a = parcel(1, 2.0, 2.0, "ann");
            let b = parcel(2, 8.0, 8.0, "bob");
            store.insert(a.clone())?;
            store.insert(b.clone())?;

            let found = store.find_in_region(&BoundingBox::new(0.0, 0.0, 5.0, 5.0))?;
            assert_eq!(found, vec![a.clone()]);
            assert_eq!(store.find_by_prefix("a")?, vec![a]);

            store.delete(1)?;
            assert_eq!(store.find_by_key(1)?, None);
            assert_eq!(store.find_by_key(2)?, Some(b.clone()));
            assert_eq!(store.find_by_prefix("b")?, vec![b.clone()]);
            assert_eq!(store.find_in_region(&BoundingBox::new(5.0, 5.0, 10.0, 10.0))?, vec![b]);
            assert_consistent(&store);
            Ok(())
        },
        |ctx| cleanup(ctx),
    )
}

#[test]
fn test_overfull_bucket_splits_exactly_once() {
    run_test(
        || create_test_context(),
        |ctx| {
            let store = ctx.store();
            let capacity = test_layout().bucket_capacity as u64;
            for key in 1..=capacity {
                store.insert(parcel(key, key as f64, 1.0, "lot"))?;
            }
            let stats = store.stats()?;
            assert_eq!(stats.hash.global_depth, 0);
            assert_eq!(stats.hash.buckets, 1);

            store.insert(parcel(capacity + 1, 0.5, 0.5, "lot"))?;
            let stats = store.stats()?;
            assert_eq!(stats.hash.global_depth, 1);
            assert_eq!(stats.hash.buckets, 2);
            assert_eq!(stats.hash.overflow_blocks, 0);

            for key in 1..=capacity + 1 {
                assert_eq!(store.find_by_key(key)?.map(|record| record.key), Some(key));
            }
            assert_consistent(&store);
            Ok(())
        },
        |ctx| cleanup(ctx),
    )
}

#[test]
fn test_colliding_keys_chain_overflow_blocks() {
    run_test(
        || {
            create_test_context_with(StoreLayout {
                max_hash_depth: 1,
                hash_function: HashFunction::Modulo(4),
                ..test_layout()
            })
        },
        |ctx| {
            let store = ctx.store();
            let colliding = [4u64, 8, 12, 16, 20];
            for (i, key) in colliding.iter().enumerate() {
                store.insert(parcel(*key, i as f64 + 0.5, 5.0, "lot"))?;
            }

            let stats = store.stats()?;
            assert_eq!(stats.hash.global_depth, 1);
            assert_eq!(stats.hash.overflow_blocks, 1);
            for key in colliding {
                assert!(store.find_by_key(key)?.is_some());
            }
            assert_consistent(&store);

            store.delete(12)?;
            assert_eq!(store.stats()?.hash.overflow_blocks, 0);
            assert_eq!(keys(&store.all()?), vec![4, 8, 16, 20]);
            assert_consistent(&store);
            Ok(())
        },
        |ctx| cleanup(ctx),
    )
}

#[test]
fn test_queries_match_brute_force() {
    run_test(
        || create_test_context(),
        |ctx| {
            let store = ctx.store();
            let region = test_layout().region;
            let mut rng = StdRng::seed_from_u64(11);
            let mut records = Vec::new();
            for key in 1..=200 {
                let record = random_record(&mut rng, key, &region);
                store.insert(record.clone())?;
                records.push(record);
            }

            for query in [
                BoundingBox::new(0.0, 0.0, 5.0, 5.0),
                BoundingBox::new(2.5, 1.0, 7.5, 9.0),
                BoundingBox::new(9.0, 9.0, 20.0, 20.0),
                BoundingBox::new(-5.0, -5.0, 0.1, 0.1),
            ] {
                let expected: Vec<u64> = records
                    .iter()
                    .filter(|record| query.contains(&record.position))
                    .map(|record| record.key)
                    .collect();
                assert_eq!(keys(&store.find_in_region(&query)?), expected, "{}", query);
            }

            for prefix in ["", "a", "ann", "anna", "bob", "carla", "x"] {
                let mut expected: Vec<(String, u64)> = records
                    .iter()
                    .filter(|record| record.name.starts_with(prefix))
                    .map(|record| (record.name.clone(), record.key))
                    .collect();
                expected.sort();
                let found: Vec<(String, u64)> = store
                    .find_by_prefix(prefix)?
                    .into_iter()
                    .map(|record| (record.name, record.key))
                    .collect();
                assert_eq!(found, expected, "prefix '{}'", prefix);
            }
            assert_consistent(&store);
            Ok(())
        },
        |ctx| cleanup(ctx),
    )
}

#[test]
fn test_structures_shrink_back_when_emptied() {
    run_test(
        || create_test_context(),
        |ctx| {
            let store = ctx.store();
            let region = test_layout().region;
            let mut rng = StdRng::seed_from_u64(3);
            for key in 1..=60 {
                store.insert(random_record(&mut rng, key, &region))?;
            }
            let grown = store.stats()?;
            let file_len = |name: &str| fs::metadata(ctx.path().join(name)).map(|meta| meta.len());
            let grown_hash = file_len("hash.blk")?;
            let grown_quadtree = file_len("quadtree.blk")?;
            assert!(grown.quadtree.internal_nodes > 0);
            assert!(grown.hash.global_depth > 0);
            assert!(grown.heap.blocks >= 15);

            for key in 1..=60 {
                store.delete(key)?;
                if key % 15 == 0 {
                    assert_consistent(&store);
                }
            }

            let stats = store.stats()?;
            assert_eq!(stats.records, 0);
            assert_eq!(stats.heap.blocks, 0);
            assert_eq!(stats.hash.global_depth, 0);
            assert_eq!(stats.hash.buckets, 1);
            assert_eq!(stats.quadtree.internal_nodes, 0);
            assert_eq!(stats.quadtree.leaves, 1);
            assert_eq!(stats.trie.nodes, 1);
            assert!(store.is_empty()?);

            // freed blocks at the end of each file are cut off
            store.flush()?;
            let block_size = test_layout().block_size as u64;
            assert_eq!(file_len("records.blk")?, block_size);
            assert_eq!(file_len("trie.blk")?, 2 * block_size);
            assert!(file_len("hash.blk")? < grown_hash);
            assert!(file_len("quadtree.blk")? < grown_quadtree);
            Ok(())
        },
        |ctx| cleanup(ctx),
    )
}

#[test]
fn test_generated_keys_continue_after_highest() {
    run_test(
        || create_test_context(),
        |ctx| {
            let store = ctx.store();
            assert_eq!(store.insert_generated(parcel(0, 1.0, 1.0, "first"))?, 1);
            store.insert(parcel(41, 2.0, 2.0, "manual"))?;
            assert_eq!(store.insert_generated(parcel(0, 3.0, 3.0, "next"))?, 42);
            assert_eq!(store.find_by_name("next")?[0].key, 42);
            Ok(())
        },
        |ctx| cleanup(ctx),
    )
}

#[test]
fn test_hundreds_of_records_share_one_name() {
    run_test(
        || create_test_context(),
        |ctx| {
            let store = ctx.store();
            let region = test_layout().region;
            let mut rng = StdRng::seed_from_u64(11);
            for key in 1..=400 {
                let mut record = random_record(&mut rng, key, &region);
                record.name = "ann".into();
                store.insert(record)?;
            }
            store.insert(parcel(401, 1.0, 1.0, "anna"))?;

            let named = store.find_by_name("ann")?;
            assert_eq!(keys(&named), (1..=400).collect::<Vec<_>>());
            assert_eq!(store.find_by_prefix("an")?.len(), 401);
            assert!(store.stats()?.trie.posting_blocks > 0);
            assert_consistent(&store);

            for key in (1..=400).filter(|key| key % 4 != 0) {
                store.delete(key)?;
            }
            let named = store.find_by_name("ann")?;
            assert_eq!(keys(&named), (1..=100).map(|key| key * 4).collect::<Vec<_>>());
            assert_eq!(store.stats()?.trie.posting_blocks, 0);
            assert_consistent(&store);

            let reopened = ctx.reopen()?;
            assert_eq!(reopened.find_by_prefix("ann")?.len(), 101);
            assert_consistent(&reopened);
            reopened.close()
        },
        |ctx| cleanup(ctx),
    )
}
