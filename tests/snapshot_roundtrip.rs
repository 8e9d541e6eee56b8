//! Snapshot pipeline end-to-end: glean durable epochs into on-disk
//! pages, publish the manifest, drop volatile pages, and keep serving
//! the exact committed state, from snapshot pages in the same engine
//! and from a fresh engine restored off the manifest. Also: a snapshot
//! must never absorb commits past its epoch range, and re-gleaning with
//! nothing new must reproduce the same page tree.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use pactdb::engine::Engine;
use pactdb::epoch::Epoch;
use pactdb::snapshot::gleaner::LogGleaner;
use pactdb::storage::Storage;
use pactdb::thread::ThreadContext;
use pactdb::{EngineOptions, IsolationLevel};

const RECORDS: u64 = 100;
const PAYLOAD: u32 = 16;

fn options_for(dir: &std::path::Path) -> EngineOptions {
    let mut options = EngineOptions {
        base_path: dir.to_path_buf(),
        thread_count: 2,
        numa_node_count: 2,
        ..EngineOptions::default()
    };
    options.memory.page_pool_pages = 2048;
    // Epoch advancement is driven explicitly in these tests; a quiet
    // advancer keeps the durable horizon deterministic.
    options.log.flush_interval_milliseconds = 3_600_000;
    options
}

fn commit_value(
    engine: &Engine,
    ctx: &mut ThreadContext,
    storage: &Arc<Storage>,
    offset: u64,
    value: i64,
) -> Epoch {
    let xct_manager = engine.xct_manager();
    xct_manager
        .begin_xct(ctx, IsolationLevel::Serializable)
        .unwrap();
    storage
        .as_array()
        .unwrap()
        .overwrite_record(ctx.xct_mut(), offset, &value.to_le_bytes(), 0)
        .unwrap();
    let mut commit_epoch = Epoch::invalid();
    xct_manager.precommit_xct(ctx, &mut commit_epoch).unwrap();
    commit_epoch
}

fn read_value(
    engine: &Engine,
    ctx: &mut ThreadContext,
    storage: &Arc<Storage>,
    offset: u64,
) -> i64 {
    let xct_manager = engine.xct_manager();
    xct_manager
        .begin_xct(ctx, IsolationLevel::Serializable)
        .unwrap();
    let mut bytes = [0u8; 8];
    storage
        .as_array()
        .unwrap()
        .get_record_part(ctx.xct_mut(), offset, &mut bytes, 0)
        .unwrap();
    xct_manager.abort_xct(ctx).unwrap();
    i64::from_le_bytes(bytes)
}

/// S4: commit across several epochs, snapshot, and observe the exact
/// post-state, before and after dropping every volatile page, and
/// again from a freshly opened engine.
#[test]
fn snapshot_round_trip_drops_all_and_restores() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::open(options_for(dir.path())).unwrap();
    let storage = engine
        .storage_manager()
        .create_array("balances", PAYLOAD, RECORDS)
        .unwrap();
    let mut ctx = engine.thread_context(0).unwrap();

    // Spread 100 commits across a handful of epochs.
    let mut highest = Epoch::invalid();
    for offset in 0..RECORDS {
        highest.store_max(commit_value(
            &engine,
            &mut ctx,
            &storage,
            offset,
            offset as i64 * 3 + 1,
        ));
        if offset % 25 == 24 {
            engine.log_manager().flush_now().unwrap();
        }
    }
    engine.xct_manager().wait_for_commit(highest).unwrap();

    let free_before = engine.page_pool().free_count();
    let result = engine
        .snapshot_manager()
        .trigger_snapshot_immediate(true)
        .unwrap()
        .expect("wait_completion returns the result");
    assert!(result.dropped_all, "nothing ran concurrently; all covered");
    assert!(result.dropped_pages > 0);
    assert!(
        !highest.after(result.snapshot.valid_until_epoch),
        "snapshot covers every commit"
    );
    assert!(engine.page_pool().free_count() > free_before);
    assert!(result.manifest_path.exists());

    // Reads now come from snapshot pages.
    for offset in 0..RECORDS {
        assert_eq!(
            read_value(&engine, &mut ctx, &storage, offset),
            offset as i64 * 3 + 1
        );
    }
    engine.return_thread_context(ctx);
    engine.shutdown().unwrap();
    drop(engine);

    // A fresh engine loads the manifest and serves the same state.
    let engine = Engine::open(options_for(dir.path())).unwrap();
    let storage = engine.storage_manager().get_by_name("balances").unwrap();
    let mut ctx = engine.thread_context(0).unwrap();
    for offset in 0..RECORDS {
        assert_eq!(
            read_value(&engine, &mut ctx, &storage, offset),
            offset as i64 * 3 + 1
        );
    }
    engine.shutdown().unwrap();
}

/// Writes after a snapshot re-materialize volatile pages and are served
/// alongside the snapshot-resident records.
#[test]
fn writes_after_drop_rematerialize_volatile_pages() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::open(options_for(dir.path())).unwrap();
    let storage = engine
        .storage_manager()
        .create_array("balances", PAYLOAD, RECORDS)
        .unwrap();
    let mut ctx = engine.thread_context(0).unwrap();

    let mut highest = Epoch::invalid();
    for offset in 0..RECORDS {
        highest.store_max(commit_value(&engine, &mut ctx, &storage, offset, 7));
    }
    engine.xct_manager().wait_for_commit(highest).unwrap();
    let result = engine
        .snapshot_manager()
        .trigger_snapshot_immediate(true)
        .unwrap()
        .unwrap();
    assert!(result.dropped_all);

    // Overwrite one record; its leaf comes back as a volatile page, the
    // rest keep reading from the snapshot.
    let epoch = commit_value(&engine, &mut ctx, &storage, 42, 1000);
    engine.xct_manager().wait_for_commit(epoch).unwrap();
    assert_eq!(read_value(&engine, &mut ctx, &storage, 42), 1000);
    assert_eq!(read_value(&engine, &mut ctx, &storage, 41), 7);

    // The next snapshot folds the new write in and is clean again.
    let result = engine
        .snapshot_manager()
        .trigger_snapshot_immediate(true)
        .unwrap()
        .unwrap();
    assert!(result.dropped_all);
    assert_eq!(read_value(&engine, &mut ctx, &storage, 42), 1000);
    engine.shutdown().unwrap();
}

/// S5: commits past the snapshot's epoch range must not leak into it,
/// and their pages must survive the volatile drop.
#[test]
fn snapshot_excludes_commits_past_valid_until() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::open(options_for(dir.path())).unwrap();
    let storage = engine
        .storage_manager()
        .create_array("balances", PAYLOAD, RECORDS)
        .unwrap();
    let mut ctx = engine.thread_context(0).unwrap();

    // Batch A: committed and durable.
    let mut highest = Epoch::invalid();
    for offset in 0..RECORDS {
        highest.store_max(commit_value(&engine, &mut ctx, &storage, offset, 5));
    }
    engine.xct_manager().wait_for_commit(highest).unwrap();
    let durable = engine.epoch_clock().durable();

    // Batch B: committed but *not* durable; its epoch is past the
    // durable horizon the gleaner will pick.
    let late_epoch = commit_value(&engine, &mut ctx, &storage, 0, 999);
    assert!(durable.before(late_epoch));

    // Run the gleaner directly so nothing flushes batch B first.
    let gleaner = LogGleaner {
        options: Arc::new(engine.options().clone()),
        clock: Arc::clone(engine.epoch_clock()),
        storages: Arc::clone(engine.storage_manager()),
        pool: Arc::clone(engine.page_pool()),
        xct: Arc::clone(engine.xct_manager()),
        log: Arc::clone(engine.log_manager()),
        cache: Arc::clone(engine.snapshot_page_cache()),
        stop: Arc::new(AtomicBool::new(false)),
    };
    let result = gleaner.execute(None).unwrap();
    assert_eq!(result.snapshot.valid_until_epoch, durable);
    assert!(
        !result.dropped_all,
        "the record written at {late_epoch} keeps its page volatile"
    );

    // The live engine still sees batch B ...
    assert_eq!(read_value(&engine, &mut ctx, &storage, 0), 999);
    engine.return_thread_context(ctx);
    engine.shutdown().unwrap();
    drop(engine);

    // ... but the snapshot does not: a restored engine sees batch A only.
    let engine = Engine::open(options_for(dir.path())).unwrap();
    let storage = engine.storage_manager().get_by_name("balances").unwrap();
    let mut ctx = engine.thread_context(0).unwrap();
    assert_eq!(read_value(&engine, &mut ctx, &storage, 0), 5);
    assert_eq!(read_value(&engine, &mut ctx, &storage, 1), 5);
    engine.shutdown().unwrap();
}

/// Gleaning twice with no intervening writes reproduces the same page
/// tree: every leaf pointer in the new root equals the old one.
#[test]
fn re_gleaning_without_writes_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::open(options_for(dir.path())).unwrap();
    let storage = engine
        .storage_manager()
        .create_array("balances", PAYLOAD, RECORDS)
        .unwrap();
    let mut ctx = engine.thread_context(0).unwrap();

    let mut highest = Epoch::invalid();
    for offset in 0..RECORDS {
        highest.store_max(commit_value(&engine, &mut ctx, &storage, offset, 11));
    }
    engine.xct_manager().wait_for_commit(highest).unwrap();

    let first = engine
        .snapshot_manager()
        .trigger_snapshot_immediate(true)
        .unwrap()
        .unwrap();
    let second = engine
        .snapshot_manager()
        .trigger_snapshot_immediate(true)
        .unwrap()
        .unwrap();
    assert!(second.snapshot.id > first.snapshot.id);

    // Same child pointers in both root pages: no leaf was rewritten.
    let cache = engine.snapshot_page_cache();
    let first_root = cache.read(first.snapshot.root_pointers[&storage.id()]).unwrap();
    let second_root = cache
        .read(second.snapshot.root_pointers[&storage.id()])
        .unwrap();
    assert_eq!(
        &first_root.as_bytes()[64..],
        &second_root.as_bytes()[64..],
        "re-gleaning must reuse every leaf page"
    );

    assert_eq!(read_value(&engine, &mut ctx, &storage, 33), 11);
    engine.shutdown().unwrap();
}
