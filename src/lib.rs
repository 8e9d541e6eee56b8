//! # PactDB: Main-Memory OLTP Engine
//!
//! PactDB is a main-memory, NUMA-partitioned OLTP engine running
//! serializable transactions over multiple storage organizations, with
//! periodic on-disk snapshots. Its two load-bearing subsystems:
//!
//! - **Optimistic concurrency control** with per-record versioning: every
//!   record carries a 128-bit header (a commit id that is simultaneously
//!   the timestamp, the visibility anchor, and (with its sibling word) an
//!   MCS-style reader/writer lock) and every transaction keeps ordered
//!   current/retrospective lock lists that make lock acquisition
//!   deadlock-free and teach retries which locks to take up-front.
//! - **The snapshot map-reduce pipeline**: a log gleaner drains durable
//!   log epochs through per-node mappers and reducers into per-storage
//!   composers that merge old snapshot pages with sorted log records into
//!   new immutable pages, publish a manifest atomically, and then drop
//!   the covered volatile pages under a short global transaction pause.
//!
//! The two meet through the epoch clock and the record ownership word.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │              Engine (lifecycle)               │
//! ├──────────────────────┬────────────────────────┤
//! │  XctManager (OCC)    │  SnapshotManager       │
//! │   Xct / CLL / RLL    │   LogGleaner           │
//! │   MCS record locks   │   mappers / reducers   │
//! ├──────────────────────┤   composers            │
//! │  Storages            │   snapshot writer      │
//! │   array │ sequential ├────────────────────────┤
//! ├──────────────────────┤  Log (per-thread       │
//! │  Pages & page pool   │   buffers, advancer,   │
//! │  local work memory   │   durable epoch)       │
//! └──────────────────────┴────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use pactdb::{Engine, EngineOptions, IsolationLevel};
//! use pactdb::epoch::Epoch;
//!
//! let engine = Engine::open(EngineOptions::default())?;
//! let accounts = engine.storage_manager().create_array("accounts", 16, 1024)?;
//!
//! let mut ctx = engine.thread_context(0)?;
//! let xct_manager = engine.xct_manager();
//! xct_manager.begin_xct(&mut ctx, IsolationLevel::Serializable)?;
//! accounts.as_array()?.overwrite_record(ctx.xct_mut(), 42, &100i64.to_le_bytes(), 0)?;
//! let mut commit_epoch = Epoch::invalid();
//! xct_manager.precommit_xct(&mut ctx, &mut commit_epoch)?;
//! xct_manager.wait_for_commit(commit_epoch)?;
//!
//! engine.snapshot_manager().trigger_snapshot_immediate(true)?;
//! ```
//!
//! ## Module Overview
//!
//! - [`engine`]: ordered init/teardown, thread contexts
//! - [`xct`]: commit ids, MCS record locks, lock lists, the commit
//!   protocol, the pause barrier
//! - [`storage`]: page model, array and sequential storages, composers
//! - [`log`]: log records, per-thread buffers, the epoch advancer
//! - [`snapshot`]: gleaner, mappers/reducers, snapshot files, manifests
//! - [`epoch`], [`memory`], [`config`], [`error`]: the shared substrate

pub mod config;
pub mod engine;
pub mod epoch;
pub mod error;
pub mod log;
pub mod memory;
pub mod snapshot;
pub mod storage;
pub mod thread;
pub mod xct;

pub use config::options::EngineOptions;
pub use engine::Engine;
pub use error::{CodeResult, ErrorCode};
pub use thread::ThreadContext;
pub use xct::IsolationLevel;
