//! Manifest store: per-path metadata for one side of a synchronized pair.
//!
//! The client keeps an in-memory store of last-known remote manifests. The
//! server persists one JSON document per path at
//! `<root>/.treesync/manifests/<sha256(path)>.json`.
//! Writes use the atomic `.tmp` + rename pattern.
//!
//! Deleted paths keep a tombstone carrying their last revision so that a
//! later re-creation continues the revision sequence instead of restarting it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use treesync_core::types::METADATA_DIR;
use treesync_core::{Manifest, RelPath, RemoteState};

use crate::error::{io_err, SyncError};

/// On-disk manifest payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredState {
    pub synced_at: DateTime<Utc>,
    #[serde(flatten)]
    pub state: RemoteState,
}

/// Thread-safe map of `path → RemoteState`, optionally persisted.
#[derive(Debug, Default)]
pub struct ManifestStore {
    entries: RwLock<HashMap<RelPath, RemoteState>>,
    persist_root: Option<PathBuf>,
}

/// `<root>/.treesync/manifests/`
pub fn manifests_dir_at(root: &Path) -> PathBuf {
    root.join(METADATA_DIR).join("manifests")
}

/// Path to the persisted state of `path` beneath `root`.
pub fn store_path_at(root: &Path, path: &RelPath) -> PathBuf {
    let mut h = Sha256::new();
    h.update(path.as_str().as_bytes());
    manifests_dir_at(root).join(format!("{}.json", hex::encode(h.finalize())))
}

impl ManifestStore {
    /// A store that lives only in memory (client side).
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Open the persisted store beneath `root`, loading every entry.
    ///
    /// Returns an empty store if the manifests directory does not yet exist.
    /// Unparseable entries are skipped with a warning; the path is then
    /// treated as never synced.
    pub fn open_at(root: &Path) -> Result<Self, SyncError> {
        let dir = manifests_dir_at(root);
        let mut entries = HashMap::new();
        if dir.exists() {
            for entry in std::fs::read_dir(&dir).map_err(|e| io_err(&dir, e))? {
                let entry = entry.map_err(|e| io_err(&dir, e))?;
                let path = entry.path();
                if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                    continue;
                }
                let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
                match serde_json::from_str::<StoredState>(&contents) {
                    Ok(stored) => {
                        let key = state_path(&stored.state).clone();
                        entries.insert(key, stored.state);
                    }
                    Err(err) => {
                        tracing::warn!(file = %path.display(), error = %err, "skipping unreadable manifest");
                    }
                }
            }
        }
        tracing::debug!(count = entries.len(), root = %root.display(), "manifest store loaded");
        Ok(Self {
            entries: RwLock::new(entries),
            persist_root: Some(root.to_path_buf()),
        })
    }

    /// Current state of `path`; `Absent { revision: 0 }` if never seen.
    pub fn state(&self, path: &RelPath) -> RemoteState {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(path).cloned().unwrap_or_else(|| RemoteState::Absent {
            path: path.clone(),
            revision: 0,
        })
    }

    pub fn get(&self, path: &RelPath) -> Option<Manifest> {
        self.state(path).into_manifest()
    }

    pub fn revision(&self, path: &RelPath) -> u64 {
        self.state(path).revision()
    }

    /// Every live manifest, sorted by path.
    pub fn list(&self) -> Vec<Manifest> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut manifests: Vec<Manifest> = entries
            .values()
            .filter_map(|state| state.manifest().cloned())
            .collect();
        manifests.sort_by(|a, b| a.path.cmp(&b.path));
        manifests
    }

    pub fn len(&self) -> usize {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.values().filter(|s| s.manifest().is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replace every entry with `manifests` (client startup reconciliation).
    pub fn seed(&self, manifests: Vec<Manifest>) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.clear();
        for manifest in manifests {
            entries.insert(manifest.path.clone(), RemoteState::Present { manifest });
        }
    }

    /// Record `state` for its path, persisting first when the store is on disk.
    pub fn record(&self, state: RemoteState) -> Result<(), SyncError> {
        if let Some(root) = &self.persist_root {
            save_at(root, &state)?;
        }
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(state_path(&state).clone(), state);
        Ok(())
    }

    pub fn commit(&self, manifest: Manifest) -> Result<(), SyncError> {
        self.record(RemoteState::Present { manifest })
    }

    pub fn tombstone(&self, path: RelPath, revision: u64) -> Result<(), SyncError> {
        self.record(RemoteState::Absent { path, revision })
    }

    /// Tombstone every live entry strictly beneath `dir`, each at its
    /// revision + 1. Both sides apply the same rule when a directory goes, so
    /// their revisions stay in step. Returns the tombstoned paths.
    pub fn tombstone_beneath(&self, dir: &RelPath) -> Result<Vec<RelPath>, SyncError> {
        let mut beneath: Vec<(RelPath, u64)> = {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            entries
                .values()
                .filter_map(|state| state.manifest())
                .filter(|m| &m.path != dir && m.path.starts_with(dir))
                .map(|m| (m.path.clone(), m.revision))
                .collect()
        };
        beneath.sort();
        for (path, revision) in &beneath {
            self.tombstone(path.clone(), revision + 1)?;
        }
        Ok(beneath.into_iter().map(|(path, _)| path).collect())
    }
}

fn state_path(state: &RemoteState) -> &RelPath {
    match state {
        RemoteState::Present { manifest } => &manifest.path,
        RemoteState::Absent { path, .. } => path,
    }
}

/// Save the state of one path atomically.
///
/// Writes to `<file>.json.tmp` then renames to `<file>.json`.
pub fn save_at(root: &Path, state: &RemoteState) -> Result<(), SyncError> {
    let path = store_path_at(root, state_path(state));
    let Some(dir) = path.parent() else {
        return Err(io_err(
            path,
            std::io::Error::other("invalid manifest store path"),
        ));
    };

    // Ensure the manifests directory exists.
    std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;

    let stored = StoredState {
        synced_at: Utc::now(),
        state: state.clone(),
    };
    let json = serde_json::to_string_pretty(&stored)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &json).map_err(|e| io_err(&tmp, e))?;
    std::fs::rename(&tmp, &path).map_err(|e| io_err(&path, e))?;
    Ok(())
}
