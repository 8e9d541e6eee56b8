//! Abort-then-retry behavior: a validation race must surface as
//! `RaceAbort`, seed the retrospective lock list with the contested
//! lock, and let the retry take that lock up-front so it commits without
//! another abort in the uncontended case.

use std::sync::Arc;

use pactdb::engine::Engine;
use pactdb::epoch::Epoch;
use pactdb::error::ErrorCode;
use pactdb::xct::lock_list::UniversalLockId;
use pactdb::xct::mcs_lock::LockMode;
use pactdb::{EngineOptions, IsolationLevel};

fn open_engine(dir: &std::path::Path) -> Arc<Engine> {
    let options = EngineOptions {
        base_path: dir.to_path_buf(),
        thread_count: 2,
        numa_node_count: 1,
        ..EngineOptions::default()
    };
    Arc::new(Engine::open(options).unwrap())
}

#[test]
fn race_abort_seeds_rll_and_the_retry_takes_the_lock_up_front() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(dir.path());
    let xct_manager = engine.xct_manager();
    let storage = engine
        .storage_manager()
        .create_array("keys", 8, 4)
        .unwrap();
    let array = storage.as_array().unwrap();

    let mut ctx0 = engine.thread_context(0).unwrap();
    let mut ctx1 = engine.thread_context(1).unwrap();

    // Seed key 0 with value 1.
    xct_manager
        .begin_xct(&mut ctx0, IsolationLevel::Serializable)
        .unwrap();
    array
        .overwrite_record(ctx0.xct_mut(), 0, &1i64.to_le_bytes(), 0)
        .unwrap();
    let mut commit_epoch = Epoch::invalid();
    xct_manager
        .precommit_xct(&mut ctx0, &mut commit_epoch)
        .unwrap();

    // T0 reads key 0 ...
    xct_manager
        .begin_xct(&mut ctx0, IsolationLevel::Serializable)
        .unwrap();
    let mut bytes = [0u8; 8];
    array.get_record(ctx0.xct_mut(), 0, &mut bytes).unwrap();
    assert_eq!(i64::from_le_bytes(bytes), 1);

    // ... while T1 sneaks in a full read-modify-write on the same key.
    xct_manager
        .begin_xct(&mut ctx1, IsolationLevel::Serializable)
        .unwrap();
    let mut bytes = [0u8; 8];
    array.get_record(ctx1.xct_mut(), 0, &mut bytes).unwrap();
    array
        .overwrite_record(ctx1.xct_mut(), 0, &2i64.to_le_bytes(), 0)
        .unwrap();
    let mut commit_epoch = Epoch::invalid();
    xct_manager
        .precommit_xct(&mut ctx1, &mut commit_epoch)
        .unwrap();

    // T0's write now fails validation: its observed ownership word is
    // stale. The precommit aborts internally.
    array
        .overwrite_record(ctx0.xct_mut(), 0, &3i64.to_le_bytes(), 0)
        .unwrap();
    let mut commit_epoch = Epoch::invalid();
    let result = xct_manager.precommit_xct(&mut ctx0, &mut commit_epoch);
    assert_eq!(result.unwrap_err(), ErrorCode::RaceAbort);
    assert!(!ctx0.xct().is_active());

    // The RLL remembers the contested lock.
    // Key 0 sits in leaf 0, slot 0.
    let lock_id = UniversalLockId::new(storage.id(), 0, 0);
    assert!(
        ctx0.xct().retrospective_lock_list().contains(lock_id),
        "the aborted attempt must remember the contested lock"
    );

    // The retry takes it up-front, exclusively, during begin.
    xct_manager
        .begin_xct(&mut ctx0, IsolationLevel::Serializable)
        .unwrap();
    assert!(ctx0
        .xct()
        .current_lock_list()
        .entries()
        .iter()
        .any(|entry| entry.id == lock_id && entry.taken_mode == Some(LockMode::Exclusive)));

    // Uncontended now: the retry goes through with no further abort.
    let mut bytes = [0u8; 8];
    array.get_record(ctx0.xct_mut(), 0, &mut bytes).unwrap();
    assert_eq!(i64::from_le_bytes(bytes), 2);
    array
        .overwrite_record(ctx0.xct_mut(), 0, &3i64.to_le_bytes(), 0)
        .unwrap();
    let mut commit_epoch = Epoch::invalid();
    xct_manager
        .precommit_xct(&mut ctx0, &mut commit_epoch)
        .unwrap();
    assert!(ctx0.xct().retrospective_lock_list().is_empty());

    // And the committed value sticks.
    xct_manager
        .begin_xct(&mut ctx0, IsolationLevel::Serializable)
        .unwrap();
    let mut bytes = [0u8; 8];
    array.get_record(ctx0.xct_mut(), 0, &mut bytes).unwrap();
    assert_eq!(i64::from_le_bytes(bytes), 3);
    xct_manager.abort_xct(&mut ctx0).unwrap();

    engine.shutdown().unwrap();
}

#[test]
fn write_write_race_with_threads_converges() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(dir.path());
    let storage = engine
        .storage_manager()
        .create_array("counter", 8, 1)
        .unwrap();

    const PER_THREAD: i64 = 50;
    let mut handles = Vec::new();
    for thread in 0..2u16 {
        let engine = Arc::clone(&engine);
        let mut ctx = engine.thread_context(thread).unwrap();
        handles.push(std::thread::spawn(move || {
            let storage = engine.storage_manager().get_by_name("counter").unwrap();
            let array = storage.as_array().unwrap();
            let xct_manager = engine.xct_manager();
            let mut aborts = 0u32;
            let mut highest = Epoch::invalid();
            for _ in 0..PER_THREAD {
                loop {
                    xct_manager
                        .begin_xct(&mut ctx, IsolationLevel::Serializable)
                        .unwrap();
                    array.increment_record_i64(ctx.xct_mut(), 0, 0, 1).unwrap();
                    let mut commit_epoch = Epoch::invalid();
                    match xct_manager.precommit_xct(&mut ctx, &mut commit_epoch) {
                        Ok(()) => {
                            highest.store_max(commit_epoch);
                            break;
                        }
                        Err(ErrorCode::RaceAbort) => {
                            aborts += 1;
                            continue;
                        }
                        Err(other) => panic!("unexpected: {other}"),
                    }
                }
            }
            xct_manager.wait_for_commit(highest).unwrap();
            engine.return_thread_context(ctx);
            aborts
        }));
    }
    let total_aborts: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();

    let mut ctx = engine.thread_context(0).unwrap();
    engine
        .xct_manager()
        .begin_xct(&mut ctx, IsolationLevel::Serializable)
        .unwrap();
    let array = storage.as_array().unwrap();
    let mut bytes = [0u8; 8];
    array.get_record(ctx.xct_mut(), 0, &mut bytes).unwrap();
    engine.xct_manager().abort_xct(&mut ctx).unwrap();

    // Every increment landed exactly once, no matter how many retries it
    // took to get there.
    assert_eq!(i64::from_le_bytes(bytes), 2 * PER_THREAD);
    let _ = total_aborts;

    engine.shutdown().unwrap();
}
