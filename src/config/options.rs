//! # Engine Options
//!
//! The persisted configuration tree. Every knob an operator can change
//! without recompiling lives here; the structs derive `serde` and persist
//! as JSON (`pactdb_options.json`) inside the engine's base directory, so a
//! restarted engine runs with the same configuration that produced its log
//! files and snapshots.
//!
//! `SnapshotOptions::folder_path_pattern` supports a `$NODE$` placeholder
//! that expands to the NUMA node number, giving each node its own snapshot
//! directory (e.g. `snapshots/node_$NODE$` → `snapshots/node_1`).

use std::fs;
use std::path::{Path, PathBuf};

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::config::constants::NODE_PATTERN;

/// Name of the persisted options file inside the base directory.
pub const OPTIONS_FILE_NAME: &str = "pactdb_options.json";

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    /// Base directory for logs, snapshots, and the options file itself.
    pub base_path: PathBuf,
    /// Logical NUMA nodes. Mappers, reducers, snapshot folders, and page
    /// partitions are all per node.
    pub numa_node_count: u16,
    /// Worker thread contexts the engine preallocates.
    pub thread_count: u16,
    pub log: LogOptions,
    pub snapshot: SnapshotOptions,
    pub memory: MemoryOptions,
    pub xct: XctOptions,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            base_path: PathBuf::from("pactdb_data"),
            numa_node_count: 1,
            thread_count: 4,
            log: LogOptions::default(),
            snapshot: SnapshotOptions::default(),
            memory: MemoryOptions::default(),
            xct: XctOptions::default(),
        }
    }
}

impl EngineOptions {
    /// Persists the options as JSON under the base directory.
    pub fn save(&self) -> Result<()> {
        fs::create_dir_all(&self.base_path)
            .wrap_err_with(|| format!("creating base directory {}", self.base_path.display()))?;
        let path = self.base_path.join(OPTIONS_FILE_NAME);
        let json = serde_json::to_string_pretty(self)?;
        fs::write(&path, json).wrap_err_with(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    /// Loads previously saved options from `base_path`, if present.
    pub fn load(base_path: &Path) -> Result<Option<EngineOptions>> {
        let path = base_path.join(OPTIONS_FILE_NAME);
        if !path.exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(&path).wrap_err_with(|| format!("reading {}", path.display()))?;
        let options = serde_json::from_str(&json)?;
        Ok(Some(options))
    }
}

/// Log subsystem knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogOptions {
    /// Folder for per-thread log files, relative to the base path.
    pub folder_path: PathBuf,
    /// Per-thread log buffer capacity in KB.
    pub log_buffer_kb: u32,
    /// Interval at which the advancer thread bumps the global epoch and
    /// flushes buffers.
    pub flush_interval_milliseconds: u64,
}

impl Default for LogOptions {
    fn default() -> Self {
        LogOptions {
            folder_path: PathBuf::from("logs"),
            log_buffer_kb: 1024,
            flush_interval_milliseconds: 20,
        }
    }
}

/// External predicate deciding whether a clean volatile page survives
/// `drop_volatiles` anyway. Injected by configuration; the engine core only
/// evaluates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeepVolatilePolicy {
    /// Drop every page whose subtree is fully covered by the snapshot.
    DropAll,
    /// Keep every volatile page; snapshots still publish.
    KeepAll,
    /// Keep root pages resident, drop clean leaves.
    KeepRoots,
}

/// Snapshot subsystem knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotOptions {
    /// Per-node snapshot folder pattern; `$NODE$` expands to the node id.
    pub folder_path_pattern: String,
    /// Starts a snapshot early when the free portion of the volatile page
    /// pool falls below this percent.
    pub snapshot_trigger_page_pool_percent: u8,
    /// Interval between periodic snapshots.
    pub snapshot_interval_milliseconds: u64,
    /// Mapper bucket (per-partition staging buffer) size in KB.
    pub log_mapper_bucket_kb: u32,
    /// Mapper I/O buffer for reading log files, in KB.
    pub log_mapper_io_buffer_kb: u32,
    /// Reducer accumulation buffer in MB; exceeding spills a sorted run.
    pub log_reducer_buffer_mb: u32,
    /// Whether clean volatile pages are dropped after a snapshot.
    pub keep_volatile_policy: KeepVolatilePolicy,
}

impl Default for SnapshotOptions {
    fn default() -> Self {
        SnapshotOptions {
            folder_path_pattern: format!("snapshots/node_{NODE_PATTERN}"),
            snapshot_trigger_page_pool_percent: 100,
            snapshot_interval_milliseconds: 60_000,
            log_mapper_bucket_kb: 1024,
            log_mapper_io_buffer_kb: 1024,
            log_reducer_buffer_mb: 64,
            keep_volatile_policy: KeepVolatilePolicy::DropAll,
        }
    }
}

impl SnapshotOptions {
    /// Expands `$NODE$` in the folder pattern for the given node.
    pub fn convert_folder_path_pattern(&self, node: u16) -> PathBuf {
        PathBuf::from(
            self.folder_path_pattern
                .replace(NODE_PATTERN, &node.to_string()),
        )
    }
}

/// Volatile memory knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryOptions {
    /// Volatile page pool capacity, in pages, per engine.
    pub page_pool_pages: u32,
    /// Per-thread local work memory (transaction scratch) in KB.
    pub local_work_memory_kb: u32,
}

impl Default for MemoryOptions {
    fn default() -> Self {
        MemoryOptions {
            page_pool_pages: 16 * 1024,
            local_work_memory_kb: 256,
        }
    }
}

/// Transaction subsystem knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct XctOptions {
    /// Maximum read-set entries per transaction.
    pub max_read_set_size: u32,
    /// Maximum write-set entries per transaction.
    pub max_write_set_size: u32,
    /// Maximum lock-free write-set entries per transaction.
    pub max_lock_free_write_set_size: u32,
    /// Narrowed ordinal width for exercising the ordinal-overflow path in
    /// tests. `None` uses the full 24-bit width.
    pub ordinal_overflow_test_width: Option<u32>,
}

impl Default for XctOptions {
    fn default() -> Self {
        XctOptions {
            max_read_set_size: 64 * 1024,
            max_write_set_size: 16 * 1024,
            max_lock_free_write_set_size: 4 * 1024,
            ordinal_overflow_test_width: None,
        }
    }
}
