//! # Snapshot Metadata and the Manifest
//!
//! A snapshot is published by atomically renaming a freshly written
//! manifest over the previous one. The manifest carries everything a
//! fresh engine needs to serve reads from the snapshot: the epoch range
//! it covers and the full storage metadata including each storage's root
//! snapshot page. Log records with epoch ≤ `valid_until_epoch` are fully
//! reflected; later records are not.

use std::path::{Path, PathBuf};

use eyre::{Context, Result};
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::epoch::Epoch;
use crate::snapshot::writer::SnapshotId;
use crate::storage::page::{SnapshotPagePointer, StorageId};
use crate::storage::StorageMetadata;

pub const MANIFEST_FILE: &str = "manifest.json";

/// An in-memory view of one published snapshot.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub base_epoch: Epoch,
    pub valid_until_epoch: Epoch,
    pub root_pointers: HashMap<StorageId, SnapshotPagePointer>,
}

/// The persisted form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub snapshot_id: SnapshotId,
    pub base_epoch: Epoch,
    pub valid_until_epoch: Epoch,
    pub storages: Vec<StorageMetadata>,
}

impl SnapshotManifest {
    pub fn manifest_path(snapshot_dir: &Path) -> PathBuf {
        snapshot_dir.join(MANIFEST_FILE)
    }

    /// Publishes the manifest: write to a temporary file, fsync, rename.
    /// The rename is the single atomic publication point; a crashed
    /// snapshot leaves the previous manifest untouched.
    pub fn publish(&self, snapshot_dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(snapshot_dir)
            .wrap_err_with(|| format!("creating snapshot dir {}", snapshot_dir.display()))?;
        let final_path = Self::manifest_path(snapshot_dir);
        let tmp_path = snapshot_dir.join(format!("{MANIFEST_FILE}.tmp"));
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&tmp_path, &json)
            .wrap_err_with(|| format!("writing {}", tmp_path.display()))?;
        let tmp = std::fs::File::open(&tmp_path)?;
        tmp.sync_all().wrap_err("fsync manifest")?;
        std::fs::rename(&tmp_path, &final_path).wrap_err("publishing manifest")?;
        Ok(final_path)
    }

    pub fn load(snapshot_dir: &Path) -> Result<Option<SnapshotManifest>> {
        let path = Self::manifest_path(snapshot_dir);
        if !path.exists() {
            return Ok(None);
        }
        let json = std::fs::read_to_string(&path)
            .wrap_err_with(|| format!("reading {}", path.display()))?;
        Ok(Some(serde_json::from_str(&json)?))
    }

    pub fn to_snapshot(&self) -> Snapshot {
        Snapshot {
            id: self.snapshot_id,
            base_epoch: self.base_epoch,
            valid_until_epoch: self.valid_until_epoch,
            root_pointers: self
                .storages
                .iter()
                .map(|meta| (meta.id, meta.root_snapshot_pointer))
                .collect(),
        }
    }
}
