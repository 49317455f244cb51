use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fs;
use std::path::Path;
use tempfile::tempdir;
use tristore::{EngineError, ErrorKind, RecordCoordinator, StoreBuilder};
use tristore_int_test::test_util::{
    assert_consistent, cleanup, create_test_context, random_record, run_test, test_layout,
};

#[ctor::ctor]
fn init() {
    colog::init();
}

fn build_store(dir: &Path, records: u64) -> RecordCoordinator {
    let store = StoreBuilder::new()
        .path(dir)
        .layout(test_layout())
        .open_or_create()
        .unwrap();
    let mut rng = StdRng::seed_from_u64(records);
    for key in 1..=records {
        store.insert(random_record(&mut rng, key, &test_layout().region)).unwrap();
    }
    store
}

fn reopen_error(dir: &Path) -> EngineError {
    StoreBuilder::new()
        .path(dir)
        .open_or_create()
        .err()
        .expect("store opened despite a damaged file")
}

fn patch(path: &Path, at: usize, bytes: &[u8]) {
    let mut content = fs::read(path).unwrap();
    content[at..at + bytes.len()].copy_from_slice(bytes);
    fs::write(path, content).unwrap();
}

#[test]
fn test_reopen_restores_records_and_structure() {
    run_test(
        || create_test_context(),
        |ctx| {
            let store = ctx.store();
            let mut rng = StdRng::seed_from_u64(5);
            for key in 1..=80 {
                store.insert(random_record(&mut rng, key, &test_layout().region))?;
            }
            for key in (1..=80).filter(|key| key % 3 == 0) {
                store.delete(key)?;
            }
            let records = store.all()?;
            let structure = store.structure()?;

            let reopened = ctx.reopen()?;
            assert_eq!(reopened.all()?, records);
            assert_eq!(reopened.structure()?, structure);
            assert_eq!(reopened.layout()?, test_layout());
            assert_consistent(&reopened);
            reopened.close()
        },
        |ctx| cleanup(ctx),
    )
}

#[test]
fn test_reopen_ignores_a_different_layout() {
    let dir = tempdir().unwrap();
    build_store(dir.path(), 10).close().unwrap();

    let store = StoreBuilder::new()
        .path(dir.path())
        .bucket_capacity(64)
        .quadtree_capacity(2)
        .open_or_create()
        .unwrap();
    assert_eq!(store.layout().unwrap(), test_layout());
    assert_eq!(store.len().unwrap(), 10);
    assert_consistent(&store);
}

#[test]
fn test_format_version_mismatch_in_metadata_file() {
    let dir = tempdir().unwrap();
    build_store(dir.path(), 5).close().unwrap();

    patch(&dir.path().join("hash.meta"), 4, &7u32.to_le_bytes());
    let err = reopen_error(dir.path());
    assert_eq!(err.kind(), ErrorKind::FormatVersionMismatch);
    assert!(err.to_string().contains("hash.meta"), "{}", err);
}

#[test]
fn test_format_version_mismatch_in_block_file() {
    let dir = tempdir().unwrap();
    build_store(dir.path(), 5).close().unwrap();

    patch(&dir.path().join("quadtree.blk"), 4, &2u32.to_le_bytes());
    match reopen_error(dir.path()) {
        EngineError::FormatVersionMismatch { file, expected, found } => {
            assert_eq!(file, "quadtree.blk");
            assert_eq!(expected, 1);
            assert_eq!(found, 2);
        }
        other => panic!("unexpected error {}", other),
    }
}

#[test]
fn test_damaged_files_are_reported_as_corrupted() {
    let dir = tempdir().unwrap();
    build_store(dir.path(), 5).close().unwrap();
    let block_size = test_layout().block_size;

    // a byte inside the payload of the first record block
    let records = dir.path().join("records.blk");
    let mut content = fs::read(&records).unwrap();
    content[block_size + 12] ^= 0xff;
    fs::write(&records, content).unwrap();
    assert_eq!(reopen_error(dir.path()).kind(), ErrorKind::Corrupted);

    let other = tempdir().unwrap();
    build_store(other.path(), 5).close().unwrap();
    patch(&other.path().join("trie.meta"), 0, b"JUNK");
    assert_eq!(reopen_error(other.path()).kind(), ErrorKind::Corrupted);
}

#[test]
fn test_flush_and_drop_keep_committed_records() {
    let dir = tempdir().unwrap();
    {
        let store = build_store(dir.path(), 30);
        store.flush().unwrap();
        store.delete(30).unwrap();
    }

    let store = StoreBuilder::new().path(dir.path()).open_or_create().unwrap();
    assert_eq!(store.len().unwrap(), 29);
    assert_eq!(store.find_by_key(30).unwrap(), None);
    assert_consistent(&store);
}
