use tristore::{ErrorKind, FailPoint};
use tristore_int_test::test_util::{
    assert_consistent, cleanup, create_test_context, parcel, run_test, TestContext,
};

#[ctor::ctor]
fn init() {
    colog::init();
}

fn seed(ctx: &TestContext, count: u64) -> tristore::EngineResult<()> {
    let store = ctx.store();
    for key in 1..=count {
        let x = (key * 7 % 10) as f64 + 0.25;
        let y = (key * 3 % 10) as f64 + 0.75;
        store.insert(parcel(key, x, y, ["ann", "anna", "bob"][key as usize % 3]))?;
    }
    Ok(())
}

#[test]
fn test_failure_between_hash_and_quadtree_leaves_no_trace() {
    run_test(
        || create_test_context(),
        |ctx| {
            seed(&ctx, 12)?;
            let store = ctx.store();
            let before = store.structure()?;

            store.arm_failpoint(FailPoint::AfterHashInsert)?;
            let err = store.insert(parcel(13, 4.0, 4.0, "annabel")).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Io);

            assert_eq!(store.structure()?, before);
            assert_eq!(store.find_by_key(13)?, None);
            assert!(store.find_by_prefix("annab")?.is_empty());
            assert_consistent(&store);
            Ok(())
        },
        |ctx| cleanup(ctx),
    )
}

#[test]
fn test_every_insert_step_rolls_back_on_disk() {
    run_test(
        || create_test_context(),
        |ctx| {
            seed(&ctx, 20)?;
            let store = ctx.store();
            let before = store.structure()?;

            for point in [
                FailPoint::AfterStorageWrite,
                FailPoint::AfterHashInsert,
                FailPoint::AfterQuadTreeInsert,
                FailPoint::AfterTrieInsert,
                FailPoint::BeforeCommit,
            ] {
                store.arm_failpoint(point)?;
                assert!(store.insert(parcel(21, 9.9, 0.1, "zed")).is_err(), "{}", point);
                assert_eq!(store.structure()?, before, "{}", point);
            }

            let reopened = ctx.reopen()?;
            assert_eq!(reopened.structure()?, before);
            assert_eq!(reopened.len()?, 20);
            assert_consistent(&reopened);

            reopened.insert(parcel(21, 9.9, 0.1, "zed"))?;
            assert_eq!(reopened.find_by_name("zed")?.len(), 1);
            reopened.close()
        },
        |ctx| cleanup(ctx),
    )
}

#[test]
fn test_failed_delete_and_update_keep_old_state() {
    run_test(
        || create_test_context(),
        |ctx| {
            seed(&ctx, 9)?;
            let store = ctx.store();
            let before = store.structure()?;
            let original = store.find_by_key(5)?;

            store.arm_failpoint(FailPoint::BeforeCommit)?;
            assert!(store.delete(5).is_err());
            assert_eq!(store.find_by_key(5)?, original);

            store.arm_failpoint(FailPoint::AfterTrieInsert)?;
            assert!(store.update(parcel(5, 0.5, 9.5, "moved")).is_err());
            assert_eq!(store.find_by_key(5)?, original);
            assert!(store.find_by_name("moved")?.is_empty());

            assert_eq!(store.structure()?, before);
            assert_consistent(&store);
            Ok(())
        },
        |ctx| cleanup(ctx),
    )
}

#[test]
fn test_index_error_rolls_back_storage_write() {
    run_test(
        || create_test_context(),
        |ctx| {
            seed(&ctx, 5)?;
            let store = ctx.store();
            let before = store.structure()?;

            let err = store.insert(parcel(6, 12.0, 1.0, "far")).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::OutOfBounds);
            assert_eq!(store.structure()?, before);
            assert_eq!(store.len()?, 5);
            Ok(())
        },
        |ctx| cleanup(ctx),
    )
}

#[test]
fn test_failed_rollback_is_reported_and_poisons() {
    run_test(
        || create_test_context(),
        |ctx| {
            seed(&ctx, 3)?;
            let store = ctx.store();

            store.arm_failpoint(FailPoint::DuringRollback)?;
            let err = store.insert(parcel(2, 1.0, 1.0, "dup")).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::RollbackFailed);
            assert!(err.is_fatal());

            assert_eq!(store.len().unwrap_err().kind(), ErrorKind::Poisoned);
            assert_eq!(store.delete(1).unwrap_err().kind(), ErrorKind::Poisoned);
            Ok(())
        },
        |ctx| cleanup(ctx),
    )
}
