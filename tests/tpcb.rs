//! A minimal TPC-B over array storage, exercising the full OCC path:
//! reads, increments, overwrites, validation, aborts, retries, and
//! durability waits; single-threaded and contended multi-threaded.
//!
//! Scaling is tiny on purpose: 8 branches, 2 tellers and 4 accounts per
//! branch, 100 transactions per client, amounts in 1..=20. After the
//! run, every balance must equal its initial value plus exactly the
//! amounts the history records say went in.

use std::sync::{Arc, Barrier};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use pactdb::engine::Engine;
use pactdb::epoch::Epoch;
use pactdb::error::ErrorCode;
use pactdb::storage::Storage;
use pactdb::thread::ThreadContext;
use pactdb::{EngineOptions, IsolationLevel};

const BRANCHES: u64 = 8;
const TELLERS_PER_BRANCH: u64 = 2;
const ACCOUNTS_PER_BRANCH: u64 = 4;
const TELLERS: u64 = BRANCHES * TELLERS_PER_BRANCH;
const ACCOUNTS: u64 = BRANCHES * ACCOUNTS_PER_BRANCH;
const ACCOUNTS_PER_TELLER: u64 = ACCOUNTS_PER_BRANCH / TELLERS_PER_BRANCH;
const INITIAL_BALANCE: i64 = 100;
const XCTS_PER_THREAD: u64 = 100;
const MAX_TEST_THREADS: u64 = 4;
const HISTORIES: u64 = XCTS_PER_THREAD * MAX_TEST_THREADS;

// Payload layouts (little-endian i64/u64 fields, zero filler behind):
//   branch:  [balance:8][filler..96]
//   teller:  [branch_id:8][balance:8][filler..96]
//   account: [branch_id:8][balance:8][filler..96]
//   history: [account_id:8][teller_id:8][branch_id:8][amount:8][filler..56]
const BRANCH_PAYLOAD: u32 = 96;
const TELLER_PAYLOAD: u32 = 96;
const ACCOUNT_PAYLOAD: u32 = 96;
const HISTORY_PAYLOAD: u32 = 56;
const BALANCE_OFFSET: u32 = 8;

struct Tables {
    branches: Arc<Storage>,
    tellers: Arc<Storage>,
    accounts: Arc<Storage>,
    histories: Arc<Storage>,
}

fn open_engine(dir: &std::path::Path, threads: u16) -> Engine {
    let mut options = EngineOptions {
        base_path: dir.to_path_buf(),
        thread_count: threads,
        numa_node_count: 1,
        ..EngineOptions::default()
    };
    options.memory.page_pool_pages = 2048;
    Engine::open(options).expect("engine opens")
}

fn commit(engine: &Engine, ctx: &mut ThreadContext) -> Epoch {
    let mut commit_epoch = Epoch::invalid();
    engine
        .xct_manager()
        .precommit_xct(ctx, &mut commit_epoch)
        .expect("setup commits never conflict");
    commit_epoch
}

fn create_tpcb_tables(engine: &Engine, ctx: &mut ThreadContext) -> Tables {
    let storage_manager = engine.storage_manager();
    let tables = Tables {
        branches: storage_manager
            .create_array("branches", BRANCH_PAYLOAD, BRANCHES)
            .unwrap(),
        tellers: storage_manager
            .create_array("tellers", TELLER_PAYLOAD, TELLERS)
            .unwrap(),
        accounts: storage_manager
            .create_array("accounts", ACCOUNT_PAYLOAD, ACCOUNTS)
            .unwrap(),
        histories: storage_manager
            .create_array("histories", HISTORY_PAYLOAD, HISTORIES)
            .unwrap(),
    };
    let xct_manager = engine.xct_manager();
    let mut highest = Epoch::invalid();

    xct_manager
        .begin_xct(ctx, IsolationLevel::Serializable)
        .unwrap();
    for branch in 0..BRANCHES {
        let balance = INITIAL_BALANCE * ACCOUNTS_PER_BRANCH as i64;
        tables
            .branches
            .as_array()
            .unwrap()
            .overwrite_record(ctx.xct_mut(), branch, &balance.to_le_bytes(), 0)
            .unwrap();
    }
    highest.store_max(commit(engine, ctx));

    xct_manager
        .begin_xct(ctx, IsolationLevel::Serializable)
        .unwrap();
    for teller in 0..TELLERS {
        let mut payload = [0u8; 16];
        payload[..8].copy_from_slice(&(teller / TELLERS_PER_BRANCH).to_le_bytes());
        payload[8..].copy_from_slice(
            &(INITIAL_BALANCE * ACCOUNTS_PER_TELLER as i64).to_le_bytes(),
        );
        tables
            .tellers
            .as_array()
            .unwrap()
            .overwrite_record(ctx.xct_mut(), teller, &payload, 0)
            .unwrap();
    }
    highest.store_max(commit(engine, ctx));

    xct_manager
        .begin_xct(ctx, IsolationLevel::Serializable)
        .unwrap();
    for account in 0..ACCOUNTS {
        let mut payload = [0u8; 16];
        payload[..8].copy_from_slice(&(account / ACCOUNTS_PER_BRANCH).to_le_bytes());
        payload[8..].copy_from_slice(&INITIAL_BALANCE.to_le_bytes());
        tables
            .accounts
            .as_array()
            .unwrap()
            .overwrite_record(ctx.xct_mut(), account, &payload, 0)
            .unwrap();
    }
    highest.store_max(commit(engine, ctx));

    engine.xct_manager().wait_for_commit(highest).unwrap();
    tables
}

fn lookup_tables(engine: &Engine) -> Tables {
    let storage_manager = engine.storage_manager();
    Tables {
        branches: storage_manager.get_by_name("branches").unwrap(),
        tellers: storage_manager.get_by_name("tellers").unwrap(),
        accounts: storage_manager.get_by_name("accounts").unwrap(),
        histories: storage_manager.get_by_name("histories").unwrap(),
    }
}

fn try_tpcb_transaction(
    engine: &Engine,
    ctx: &mut ThreadContext,
    tables: &Tables,
    account_id: u64,
    history_id: u64,
    amount: i64,
) -> Result<Epoch, ErrorCode> {
    let teller_id = account_id / ACCOUNTS_PER_TELLER;
    let branch_id = account_id / ACCOUNTS_PER_BRANCH;
    let xct_manager = engine.xct_manager();

    xct_manager.begin_xct(ctx, IsolationLevel::Serializable)?;
    let result = (|| {
        tables.branches.as_array()?.increment_record_i64(
            ctx.xct_mut(),
            branch_id,
            0,
            amount,
        )?;
        tables.tellers.as_array()?.increment_record_i64(
            ctx.xct_mut(),
            teller_id,
            BALANCE_OFFSET,
            amount,
        )?;
        tables.accounts.as_array()?.increment_record_i64(
            ctx.xct_mut(),
            account_id,
            BALANCE_OFFSET,
            amount,
        )?;
        let mut history = [0u8; 32];
        history[..8].copy_from_slice(&account_id.to_le_bytes());
        history[8..16].copy_from_slice(&teller_id.to_le_bytes());
        history[16..24].copy_from_slice(&branch_id.to_le_bytes());
        history[24..].copy_from_slice(&amount.to_le_bytes());
        tables
            .histories
            .as_array()?
            .overwrite_record(ctx.xct_mut(), history_id, &history, 0)?;
        Ok(())
    })();
    if let Err(code) = result {
        if ctx.xct().is_active() {
            xct_manager.abort_xct(ctx)?;
        }
        return Err(code);
    }
    let mut commit_epoch = Epoch::invalid();
    xct_manager.precommit_xct(ctx, &mut commit_epoch)?;
    Ok(commit_epoch)
}

fn run_client(
    engine: &Engine,
    ctx: &mut ThreadContext,
    tables: &Tables,
    client: u64,
    clients: u64,
    contended: bool,
) {
    let mut rng = StdRng::seed_from_u64(client);
    let mut highest = Epoch::invalid();
    for i in 0..XCTS_PER_THREAD {
        let account_id = if contended {
            rng.gen_range(0..ACCOUNTS)
        } else {
            let span = ACCOUNTS / clients;
            client * span + rng.gen_range(0..span)
        };
        let history_id = client * XCTS_PER_THREAD + i;
        let amount = rng.gen_range(1..=20i64);
        loop {
            match try_tpcb_transaction(engine, ctx, tables, account_id, history_id, amount) {
                Ok(commit_epoch) => {
                    highest.store_max(commit_epoch);
                    break;
                }
                Err(ErrorCode::RaceAbort) => continue,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
    }
    engine.xct_manager().wait_for_commit(highest).unwrap();
}

fn read_i64(
    ctx: &mut ThreadContext,
    storage: &Arc<Storage>,
    offset: u64,
    payload_offset: u32,
) -> i64 {
    let mut bytes = [0u8; 8];
    storage
        .as_array()
        .unwrap()
        .get_record_part(ctx.xct_mut(), offset, &mut bytes, payload_offset)
        .unwrap();
    i64::from_le_bytes(bytes)
}

fn verify_tpcb(engine: &Engine, ctx: &mut ThreadContext, tables: &Tables, clients: u64) {
    let xct_manager = engine.xct_manager();
    xct_manager
        .begin_xct(ctx, IsolationLevel::Serializable)
        .unwrap();

    let mut expected_branch =
        vec![INITIAL_BALANCE * ACCOUNTS_PER_BRANCH as i64; BRANCHES as usize];
    let mut expected_teller =
        vec![INITIAL_BALANCE * ACCOUNTS_PER_TELLER as i64; TELLERS as usize];
    let mut expected_account = vec![INITIAL_BALANCE; ACCOUNTS as usize];

    for client in 0..clients {
        for i in 0..XCTS_PER_THREAD {
            let history_id = client * XCTS_PER_THREAD + i;
            let mut history = [0u8; 32];
            tables
                .histories
                .as_array()
                .unwrap()
                .get_record(ctx.xct_mut(), history_id, &mut history)
                .unwrap();
            let account_id = u64::from_le_bytes(history[..8].try_into().unwrap());
            let teller_id = u64::from_le_bytes(history[8..16].try_into().unwrap());
            let branch_id = u64::from_le_bytes(history[16..24].try_into().unwrap());
            let amount = i64::from_le_bytes(history[24..].try_into().unwrap());

            assert!((1..=20).contains(&amount), "history {history_id}: {amount}");
            assert!(branch_id < BRANCHES);
            assert!(teller_id < TELLERS);
            assert!(account_id < ACCOUNTS);
            assert_eq!(branch_id, teller_id / TELLERS_PER_BRANCH);
            assert_eq!(branch_id, account_id / ACCOUNTS_PER_BRANCH);
            assert_eq!(teller_id, account_id / ACCOUNTS_PER_TELLER);

            expected_branch[branch_id as usize] += amount;
            expected_teller[teller_id as usize] += amount;
            expected_account[account_id as usize] += amount;
        }
    }

    for branch in 0..BRANCHES {
        let balance = read_i64(ctx, &tables.branches, branch, 0);
        assert_eq!(expected_branch[branch as usize], balance, "branch-{branch}");
    }
    for teller in 0..TELLERS {
        let branch_id = read_i64(ctx, &tables.tellers, teller, 0);
        assert_eq!(branch_id as u64, teller / TELLERS_PER_BRANCH);
        let balance = read_i64(ctx, &tables.tellers, teller, BALANCE_OFFSET);
        assert_eq!(expected_teller[teller as usize], balance, "teller-{teller}");
    }
    for account in 0..ACCOUNTS {
        let branch_id = read_i64(ctx, &tables.accounts, account, 0);
        assert_eq!(branch_id as u64, account / ACCOUNTS_PER_BRANCH);
        let balance = read_i64(ctx, &tables.accounts, account, BALANCE_OFFSET);
        assert_eq!(expected_account[account as usize], balance, "account-{account}");
    }

    xct_manager.abort_xct(ctx).unwrap();
}

fn multi_thread_test(thread_count: u64, contended: bool) {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(open_engine(dir.path(), MAX_TEST_THREADS as u16));
    let mut ctx0 = engine.thread_context(0).unwrap();
    let tables = create_tpcb_tables(&engine, &mut ctx0);
    drop(tables);

    let barrier = Arc::new(Barrier::new(thread_count as usize));
    let mut handles = Vec::new();
    for client in 1..thread_count {
        let engine = Arc::clone(&engine);
        let barrier = Arc::clone(&barrier);
        let mut ctx = engine.thread_context(client as u16).unwrap();
        handles.push(std::thread::spawn(move || {
            let tables = lookup_tables(&engine);
            barrier.wait();
            run_client(&engine, &mut ctx, &tables, client, thread_count, contended);
        }));
    }
    {
        let tables = lookup_tables(&engine);
        barrier.wait();
        run_client(&engine, &mut ctx0, &tables, 0, thread_count, contended);
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let tables = lookup_tables(&engine);
    verify_tpcb(&engine, &mut ctx0, &tables, thread_count);

    // The global conservation law: one amount goes to exactly one branch,
    // teller, and account, so the three sums move in lockstep.
    engine
        .xct_manager()
        .begin_xct(&mut ctx0, IsolationLevel::Serializable)
        .unwrap();
    let mut branch_sum = 0i64;
    for branch in 0..BRANCHES {
        branch_sum += read_i64(&mut ctx0, &tables.branches, branch, 0);
    }
    let mut teller_sum = 0i64;
    for teller in 0..TELLERS {
        teller_sum += read_i64(&mut ctx0, &tables.tellers, teller, BALANCE_OFFSET);
    }
    let mut account_sum = 0i64;
    for account in 0..ACCOUNTS {
        account_sum += read_i64(&mut ctx0, &tables.accounts, account, BALANCE_OFFSET);
    }
    let mut amount_sum = 0i64;
    for history_id in 0..thread_count * XCTS_PER_THREAD {
        let mut bytes = [0u8; 8];
        tables
            .histories
            .as_array()
            .unwrap()
            .get_record_part(ctx0.xct_mut(), history_id, &mut bytes, 24)
            .unwrap();
        amount_sum += i64::from_le_bytes(bytes);
    }
    engine.xct_manager().abort_xct(&mut ctx0).unwrap();

    let initial_total = INITIAL_BALANCE * ACCOUNTS as i64;
    assert_eq!(branch_sum, initial_total + amount_sum);
    assert_eq!(teller_sum, initial_total + amount_sum);
    assert_eq!(account_sum, initial_total + amount_sum);

    engine.shutdown().unwrap();
}

#[test]
fn single_threaded_no_contention() {
    multi_thread_test(1, false);
}

#[test]
fn two_threaded_no_contention() {
    multi_thread_test(2, false);
}

#[test]
fn four_threaded_contended() {
    multi_thread_test(4, true);
}

#[test]
fn four_threaded_no_contention() {
    multi_thread_test(4, false);
}
