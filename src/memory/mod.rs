//! # Volatile Memory Management
//!
//! Two allocators with very different lifetimes:
//!
//! - [`LocalWorkMemory`]: a per-thread bump arena for transaction scratch
//!   (log payload images, temporary buffers). Reset wholesale at every
//!   transaction begin; allocation is a pointer bump and can only fail with
//!   `NoMoreLocalWorkMemory`.
//! - [`PagePool`]: the engine-wide pool of volatile pages. Pages are
//!   grabbed when a storage materializes data in memory and returned in
//!   batches when `drop_volatiles` retires them after a snapshot.

mod local_memory;
mod page_pool;

pub use local_memory::LocalWorkMemory;
pub use page_pool::{DroppedChunk, PagePool};
