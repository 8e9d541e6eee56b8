//! Sequential storage through the commit protocol: appends ride the
//! lock-free write set, materialize at commit with the final commit id,
//! and scans are guarded by the chain version words: a scan that races
//! an append aborts instead of silently missing records. Snapshots fold
//! the appended records into immutable chunks.

use std::sync::Arc;

use pactdb::engine::Engine;
use pactdb::epoch::Epoch;
use pactdb::error::ErrorCode;
use pactdb::{EngineOptions, IsolationLevel};

fn open_engine(dir: &std::path::Path) -> Arc<Engine> {
    let mut options = EngineOptions {
        base_path: dir.to_path_buf(),
        thread_count: 2,
        numa_node_count: 1,
        ..EngineOptions::default()
    };
    options.memory.page_pool_pages = 1024;
    Arc::new(Engine::open(options).unwrap())
}

#[test]
fn committed_appends_scan_in_commit_order() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(dir.path());
    let xct_manager = engine.xct_manager();
    let storage = engine.storage_manager().create_sequential("events").unwrap();
    let sequential = storage.as_sequential().unwrap();
    let mut ctx = engine.thread_context(0).unwrap();

    for value in [b"alpha".as_slice(), b"beta", b"gamma"] {
        xct_manager
            .begin_xct(&mut ctx, IsolationLevel::Serializable)
            .unwrap();
        sequential.append_record(ctx.xct_mut(), value).unwrap();
        let mut commit_epoch = Epoch::invalid();
        xct_manager.precommit_xct(&mut ctx, &mut commit_epoch).unwrap();
    }

    xct_manager
        .begin_xct(&mut ctx, IsolationLevel::Serializable)
        .unwrap();
    let records = sequential.scan(ctx.xct_mut()).unwrap();
    xct_manager.abort_xct(&mut ctx).unwrap();

    assert_eq!(records.len(), 3);
    assert_eq!(records[0].1, b"alpha");
    assert_eq!(records[1].1, b"beta");
    assert_eq!(records[2].1, b"gamma");
    assert!(records[0].0.before(records[1].0));
    assert!(records[1].0.before(records[2].0));

    engine.shutdown().unwrap();
}

#[test]
fn a_scan_racing_an_append_aborts() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(dir.path());
    let xct_manager = engine.xct_manager();
    let storage = engine.storage_manager().create_sequential("events").unwrap();
    let sequential = storage.as_sequential().unwrap();
    let mut ctx0 = engine.thread_context(0).unwrap();
    let mut ctx1 = engine.thread_context(1).unwrap();

    // Reader scans (empty is fine; the version word is what matters) ...
    xct_manager
        .begin_xct(&mut ctx0, IsolationLevel::Serializable)
        .unwrap();
    let records = sequential.scan(ctx0.xct_mut()).unwrap();
    assert!(records.is_empty());

    // ... a writer appends and commits in between ...
    xct_manager
        .begin_xct(&mut ctx1, IsolationLevel::Serializable)
        .unwrap();
    sequential.append_record(ctx1.xct_mut(), b"interloper").unwrap();
    let mut commit_epoch = Epoch::invalid();
    xct_manager.precommit_xct(&mut ctx1, &mut commit_epoch).unwrap();

    // ... so the reader's validation must fail.
    let mut commit_epoch = Epoch::invalid();
    assert_eq!(
        xct_manager
            .precommit_xct(&mut ctx0, &mut commit_epoch)
            .unwrap_err(),
        ErrorCode::RaceAbort
    );

    engine.shutdown().unwrap();
}

#[test]
fn snapshot_preserves_appended_records() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(dir.path());
    let xct_manager = engine.xct_manager();
    let storage = engine.storage_manager().create_sequential("events").unwrap();
    let sequential = storage.as_sequential().unwrap();
    let mut ctx = engine.thread_context(0).unwrap();

    let mut highest = Epoch::invalid();
    for i in 0..40u32 {
        xct_manager
            .begin_xct(&mut ctx, IsolationLevel::Serializable)
            .unwrap();
        sequential
            .append_record(ctx.xct_mut(), &i.to_le_bytes())
            .unwrap();
        let mut commit_epoch = Epoch::invalid();
        xct_manager.precommit_xct(&mut ctx, &mut commit_epoch).unwrap();
        highest.store_max(commit_epoch);
    }
    xct_manager.wait_for_commit(highest).unwrap();

    let result = engine
        .snapshot_manager()
        .trigger_snapshot_immediate(true)
        .unwrap()
        .unwrap();
    assert!(result.dropped_all);

    // Served from snapshot chunks now, same records, same order.
    xct_manager
        .begin_xct(&mut ctx, IsolationLevel::Serializable)
        .unwrap();
    let records = sequential.scan(ctx.xct_mut()).unwrap();
    xct_manager.abort_xct(&mut ctx).unwrap();
    assert_eq!(records.len(), 40);
    for (i, (_, bytes)) in records.iter().enumerate() {
        assert_eq!(bytes.as_slice(), (i as u32).to_le_bytes());
    }

    engine.return_thread_context(ctx);
    engine.shutdown().unwrap();
    drop(engine);

    // And from a restored engine.
    let dir_path = dir.path().to_path_buf();
    let mut options = EngineOptions {
        base_path: dir_path,
        thread_count: 2,
        numa_node_count: 1,
        ..EngineOptions::default()
    };
    options.memory.page_pool_pages = 1024;
    let engine = Engine::open(options).unwrap();
    let storage = engine.storage_manager().get_by_name("events").unwrap();
    let mut ctx = engine.thread_context(0).unwrap();
    engine
        .xct_manager()
        .begin_xct(&mut ctx, IsolationLevel::Serializable)
        .unwrap();
    let records = storage.as_sequential().unwrap().scan(ctx.xct_mut()).unwrap();
    engine.xct_manager().abort_xct(&mut ctx).unwrap();
    assert_eq!(records.len(), 40);

    engine.shutdown().unwrap();
}
