//! # Snapshot Writer, File Set, and Page Cache
//!
//! On-disk snapshot pages live in one append-only file per (snapshot,
//! NUMA node): `<node_dir>/snapshot_<id>.data`, where a page's byte offset
//! is `local_page_id * PAGE_SIZE`. Three collaborators:
//!
//! - [`SnapshotWriter`]: allocates node-local, monotonically increasing
//!   page ids and writes pages sequentially through an aligned batch
//!   buffer. One writer per (node, snapshot); composers only ever write
//!   through their own writer.
//! - [`SnapshotFileSet`]: random-read access to previously written
//!   snapshot files, mapped read-only with `memmap2`.
//! - [`SnapshotPageCache`]: the hot-path cache storages use to read
//!   snapshot pages after their volatile twins were dropped. Misses fault
//!   through the file set; hits are an `Arc` clone.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{bail, Context, Result};
use hashbrown::HashMap;
use memmap2::Mmap;
use parking_lot::RwLock;
use tracing::debug;

use crate::config::{PAGE_SIZE, SNAPSHOT_IO_BUFFER_PAGES};
use crate::error::{CodeResult, ErrorCode};
use crate::storage::page::{Page, SnapshotPagePointer};

/// Id of one published snapshot. Zero is reserved (null pointers).
pub type SnapshotId = u16;

pub fn snapshot_file_name(snapshot_id: SnapshotId) -> String {
    format!("snapshot_{snapshot_id:05}.data")
}

/// Sequential page writer for one (node, snapshot).
pub struct SnapshotWriter {
    snapshot_id: SnapshotId,
    node: u8,
    path: PathBuf,
    file: File,
    buffer: Vec<u8>,
    next_local_page_id: u64,
    pages_written: u64,
}

impl SnapshotWriter {
    pub fn create(node_dir: &Path, snapshot_id: SnapshotId, node: u8) -> Result<SnapshotWriter> {
        std::fs::create_dir_all(node_dir)
            .wrap_err_with(|| format!("creating snapshot folder {}", node_dir.display()))?;
        let path = node_dir.join(snapshot_file_name(snapshot_id));
        // Truncate any leftover from a previously aborted attempt at the
        // same id; an aborted snapshot is never referenced by a manifest.
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .wrap_err_with(|| format!("creating snapshot file {}", path.display()))?;
        Ok(SnapshotWriter {
            snapshot_id,
            node,
            path,
            file,
            buffer: Vec::with_capacity(SNAPSHOT_IO_BUFFER_PAGES * PAGE_SIZE),
            next_local_page_id: 0,
            pages_written: 0,
        })
    }

    pub fn node(&self) -> u8 {
        self.node
    }

    pub fn snapshot_id(&self) -> SnapshotId {
        self.snapshot_id
    }

    pub fn pages_written(&self) -> u64 {
        self.pages_written
    }

    /// Assigns the next page id, stamps it into the page header, and
    /// queues the page for sequential writing.
    pub fn write_page(&mut self, page: &Page) -> Result<SnapshotPagePointer> {
        let pointer =
            SnapshotPagePointer::new(self.snapshot_id, self.node, self.next_local_page_id);
        self.next_local_page_id += 1;
        page.set_self_snapshot_pointer(pointer);
        self.buffer.extend_from_slice(page.as_bytes());
        self.pages_written += 1;
        if self.buffer.len() >= SNAPSHOT_IO_BUFFER_PAGES * PAGE_SIZE {
            self.flush_buffer()?;
        }
        Ok(pointer)
    }

    fn flush_buffer(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        self.file
            .write_all(&self.buffer)
            .wrap_err_with(|| format!("writing snapshot pages to {}", self.path.display()))?;
        self.buffer.clear();
        Ok(())
    }

    /// Flushes buffered pages and syncs the file.
    pub fn finish(mut self) -> Result<u64> {
        self.flush_buffer()?;
        self.file.sync_all().wrap_err("fsync snapshot file")?;
        debug!(
            snapshot_id = self.snapshot_id,
            node = self.node,
            pages = self.pages_written,
            "snapshot file sealed"
        );
        Ok(self.pages_written)
    }
}

/// Read-only access to already-written snapshot files, node directory per
/// NUMA node.
#[derive(Debug)]
pub struct SnapshotFileSet {
    node_dirs: Vec<PathBuf>,
    maps: RwLock<HashMap<(SnapshotId, u8), Arc<Mmap>>>,
}

impl SnapshotFileSet {
    pub fn new(node_dirs: Vec<PathBuf>) -> SnapshotFileSet {
        SnapshotFileSet {
            node_dirs,
            maps: RwLock::new(HashMap::new()),
        }
    }

    fn map_for(&self, snapshot_id: SnapshotId, node: u8) -> Result<Arc<Mmap>> {
        if let Some(map) = self.maps.read().get(&(snapshot_id, node)) {
            return Ok(Arc::clone(map));
        }
        let Some(dir) = self.node_dirs.get(node as usize) else {
            bail!("no snapshot directory for node {node}");
        };
        let path = dir.join(snapshot_file_name(snapshot_id));
        let file = File::open(&path)
            .wrap_err_with(|| format!("opening snapshot file {}", path.display()))?;
        // The file is sealed before its pointers are published; no writer
        // touches it again.
        let map = Arc::new(unsafe { Mmap::map(&file) }.wrap_err("mapping snapshot file")?);
        self.maps
            .write()
            .insert((snapshot_id, node), Arc::clone(&map));
        Ok(map)
    }

    /// Copies the page behind `pointer` into `out`.
    pub fn read_page(&self, pointer: SnapshotPagePointer, out: &Page) -> Result<()> {
        debug_assert!(!pointer.is_null());
        let map = self.map_for(pointer.snapshot_id(), pointer.node())?;
        let offset = pointer.local_page_id() as usize * PAGE_SIZE;
        if offset + PAGE_SIZE > map.len() {
            bail!(
                "snapshot page {:?} beyond end of file ({} bytes)",
                pointer,
                map.len()
            );
        }
        out.copy_from_bytes(&map[offset..offset + PAGE_SIZE]);
        Ok(())
    }
}

/// Hot-path cache of immutable snapshot pages.
#[derive(Debug)]
pub struct SnapshotPageCache {
    fileset: SnapshotFileSet,
    pages: RwLock<HashMap<u64, Arc<Page>>>,
}

impl SnapshotPageCache {
    pub fn new(fileset: SnapshotFileSet) -> SnapshotPageCache {
        SnapshotPageCache {
            fileset,
            pages: RwLock::new(HashMap::new()),
        }
    }

    pub fn fileset(&self) -> &SnapshotFileSet {
        &self.fileset
    }

    /// Returns the cached page, faulting it in from disk on a miss.
    pub fn read(&self, pointer: SnapshotPagePointer) -> CodeResult<Arc<Page>> {
        if let Some(page) = self.pages.read().get(&pointer.raw()) {
            return Ok(Arc::clone(page));
        }
        let page: Arc<Page> = Arc::from(Page::new_zeroed());
        self.fileset
            .read_page(pointer, &page)
            .map_err(|_| ErrorCode::IoError)?;
        let mut cache = self.pages.write();
        let entry = cache
            .entry(pointer.raw())
            .or_insert_with(|| Arc::clone(&page));
        Ok(Arc::clone(entry))
    }

    /// Drops cached pages of snapshots older than `keep_from`. Called
    /// under the transaction pause, where no reader holds a stale `Arc`
    /// across the barrier.
    pub fn evict_before(&self, keep_from: SnapshotId) {
        self.pages
            .write()
            .retain(|raw, _| SnapshotPagePointer::from_raw(*raw).snapshot_id() >= keep_from);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::PageType;

    #[test]
    fn writer_assigns_monotone_local_ids() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SnapshotWriter::create(dir.path(), 1, 0).unwrap();
        let page = Page::new_zeroed();
        page.init_header(1, PageType::ArrayLeaf, 0, 0, 0, 4);
        let a = writer.write_page(&page).unwrap();
        let b = writer.write_page(&page).unwrap();
        assert_eq!(a.local_page_id(), 0);
        assert_eq!(b.local_page_id(), 1);
        assert_eq!(a.snapshot_id(), 1);
        assert_eq!(writer.finish().unwrap(), 2);
    }

    #[test]
    fn fileset_reads_back_written_pages() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SnapshotWriter::create(dir.path(), 1, 0).unwrap();
        let page = Page::new_zeroed();
        page.init_header(7, PageType::ArrayLeaf, 0, 3, 96, 32);
        let pointer = writer.write_page(&page).unwrap();
        writer.finish().unwrap();

        let fileset = SnapshotFileSet::new(vec![dir.path().to_path_buf()]);
        let loaded = Page::new_zeroed();
        fileset.read_page(pointer, &loaded).unwrap();
        assert_eq!(loaded.header().storage_id, 7);
        assert_eq!(loaded.header().page_index, 3);
        assert_eq!(loaded.header().key_base, 96);
        assert_eq!(
            SnapshotPagePointer::from_raw(loaded.header().self_snapshot_pointer),
            pointer
        );
    }

    #[test]
    fn cache_returns_the_same_page_on_hits() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SnapshotWriter::create(dir.path(), 1, 0).unwrap();
        let page = Page::new_zeroed();
        page.init_header(7, PageType::ArrayLeaf, 0, 0, 0, 1);
        let pointer = writer.write_page(&page).unwrap();
        writer.finish().unwrap();

        let cache = SnapshotPageCache::new(SnapshotFileSet::new(vec![dir.path().to_path_buf()]));
        let first = cache.read(pointer).unwrap();
        let second = cache.read(pointer).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn cache_miss_on_absent_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SnapshotPageCache::new(SnapshotFileSet::new(vec![dir.path().to_path_buf()]));
        let pointer = SnapshotPagePointer::new(9, 0, 0);
        assert_eq!(cache.read(pointer).unwrap_err(), ErrorCode::IoError);
    }
}
