//! Receiving side: applies op batches to the storage tree.
//!
//! ## Commit protocol
//!
//! 1. Lock the batch's path (and the rename source, in sorted order).
//! 2. Check the revision precondition; mismatch → `Conflict`, nothing touched.
//! 3. Copy the base file (the rename source, or the path itself) to
//!    `<dir>/.<name>.treesync-stage`.
//! 4. Apply `Truncate`/`PutChunk` ops to the stage file, `fsync`, set mtime.
//! 5. Rename the stage file over the destination (atomic on POSIX).
//! 6. Persist the new manifest (and the rename source's tombstone).
//!
//! Any failure before step 5 removes the stage file and leaves both the tree
//! and the manifest store as they were.
//!
//! Directories are entries too: `MakeDir` creates one, and deleting one
//! removes its subtree and tombstones every manifest beneath it. Deleting a
//! file never touches its parent directories.

use std::collections::{BTreeSet, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;

use filetime::FileTime;

use treesync_core::chunk::chunk_count;
use treesync_core::types::STAGE_SUFFIX;
use treesync_core::{
    ChunkFingerprint, ChunkOp, ChunkStore, EntryKind, Manifest, OpBatch, RelPath, RemoteState,
};

use crate::error::{apply_io_err, ReconcileError, SyncError};
use crate::manifest_store::ManifestStore;
use crate::transfer::ApplyResponse;

#[derive(Debug)]
pub struct Reconciler {
    root: PathBuf,
    store: ManifestStore,
    locks: Mutex<HashMap<RelPath, Arc<Mutex<()>>>>,
}

impl Reconciler {
    /// Open (creating if needed) the storage tree at `root` and load its
    /// persisted manifests.
    pub fn open(root: &Path) -> Result<Self, ReconcileError> {
        std::fs::create_dir_all(root).map_err(|e| apply_io_err(root, e))?;
        let store = ManifestStore::open_at(root)?;
        tracing::info!(root = %root.display(), files = store.len(), "storage opened");
        Ok(Self {
            root: root.to_path_buf(),
            store,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn store(&self) -> &ManifestStore {
        &self.store
    }

    pub fn get_manifest(&self, path: &RelPath) -> RemoteState {
        self.store.state(path)
    }

    pub fn list_tree(&self) -> Vec<Manifest> {
        self.store.list()
    }

    /// Apply `batch` atomically. A revision mismatch is not an error: it is
    /// answered with [`ApplyResponse::Conflict`].
    pub fn apply(&self, batch: &OpBatch) -> Result<ApplyResponse, ReconcileError> {
        validate(batch)?;

        let mut keys = vec![batch.path.clone()];
        if let Some(from) = batch.rename_source() {
            keys.push(from.clone());
        }
        keys.sort();
        keys.dedup();

        let result = {
            let locks: Vec<Arc<Mutex<()>>> = keys.iter().map(|key| self.lock_for(key)).collect();
            let _guards: Vec<_> = locks
                .iter()
                .map(|lock| lock.lock().unwrap_or_else(PoisonError::into_inner))
                .collect();
            self.apply_locked(batch)
        };
        self.release(&keys);

        match &result {
            Ok(ApplyResponse::Applied { state }) => tracing::info!(
                path = %batch.path,
                revision = state.revision(),
                ops = batch.ops.len(),
                bytes = batch.payload_bytes(),
                "applied batch"
            ),
            Ok(ApplyResponse::Conflict { current }) => tracing::info!(
                path = %batch.path,
                expected = batch.revision,
                current,
                "rejected stale batch"
            ),
            Err(err) => tracing::warn!(path = %batch.path, error = %err, "batch failed"),
        }
        result
    }

    fn lock_for(&self, path: &RelPath) -> Arc<Mutex<()>> {
        let mut table = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        table.entry(path.clone()).or_default().clone()
    }

    fn release(&self, keys: &[RelPath]) {
        let mut table = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        for key in keys {
            if table.get(key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
                table.remove(key);
            }
        }
    }

    fn apply_locked(&self, batch: &OpBatch) -> Result<ApplyResponse, ReconcileError> {
        let current = self.store.state(batch.precondition_path());
        if current.revision() != batch.revision {
            return Ok(ApplyResponse::Conflict {
                current: current.revision(),
            });
        }

        if batch.is_delete() {
            return self.apply_delete(&batch.path, current);
        }
        if batch.is_make_dir() {
            return self.apply_make_dir(batch, current);
        }
        match batch.rename_source() {
            Some(from) => self.apply_rename(batch, from, current),
            None => self.apply_content(batch, current),
        }
    }

    fn apply_delete(&self, path: &RelPath, current: RemoteState) -> Result<ApplyResponse, ReconcileError> {
        let RemoteState::Present { manifest } = current else {
            // Already gone.
            return Ok(ApplyResponse::Applied { state: current });
        };
        if manifest.is_dir() {
            self.clear_directory(path)?;
        } else {
            remove_file(&path.to_fs(&self.root))?;
        }
        let state = RemoteState::Absent {
            path: path.clone(),
            revision: manifest.revision + 1,
        };
        self.store.record(state.clone())?;
        Ok(ApplyResponse::Applied { state })
    }

    fn apply_make_dir(&self, batch: &OpBatch, current: RemoteState) -> Result<ApplyResponse, ReconcileError> {
        let host = batch.path.to_fs(&self.root);
        if host.is_file() {
            remove_file(&host)?;
        }
        std::fs::create_dir_all(&host).map_err(|e| apply_io_err(&host, e))?;
        let manifest = Manifest::directory(
            batch.path.clone(),
            current.revision() + 1,
            batch.chunk_size,
            batch.mtime,
        );
        self.store.commit(manifest.clone())?;
        Ok(ApplyResponse::Applied {
            state: RemoteState::Present { manifest },
        })
    }

    fn apply_rename(
        &self,
        batch: &OpBatch,
        from: &RelPath,
        current: RemoteState,
    ) -> Result<ApplyResponse, ReconcileError> {
        let RemoteState::Present { manifest: source } = current else {
            return Err(ReconcileError::InvalidBatch {
                path: batch.path.clone(),
                reason: format!("rename source {from} does not exist"),
            });
        };
        if source.is_dir() {
            return Err(ReconcileError::InvalidBatch {
                path: batch.path.clone(),
                reason: format!("rename source {from} is a directory"),
            });
        }
        let source_host = from.to_fs(&self.root);
        if !source_host.exists() {
            return self.lost_file(source);
        }

        let dest = self.store.state(&batch.path);
        let revision = source.revision.max(dest.revision()) + 1;
        let dest_host = batch.path.to_fs(&self.root);
        if dest_host.is_dir() {
            self.clear_directory(&batch.path)?;
        }

        let manifest = if batch.ops.len() == 1 {
            // Pure move: no bytes to rewrite.
            ensure_parent(&dest_host)?;
            std::fs::rename(&source_host, &dest_host).map_err(|e| apply_io_err(&dest_host, e))?;
            set_mtime(&dest_host, batch)?;
            Manifest {
                path: batch.path.clone(),
                revision,
                mtime: batch.mtime,
                ..source.clone()
            }
        } else {
            let manifest = self.stage_and_commit(batch, Some(&source), &source_host, revision)?;
            remove_file(&source_host)?;
            manifest
        };

        self.store.commit(manifest.clone())?;
        self.store.tombstone(from.clone(), source.revision + 1)?;
        Ok(ApplyResponse::Applied {
            state: RemoteState::Present { manifest },
        })
    }

    fn apply_content(&self, batch: &OpBatch, current: RemoteState) -> Result<ApplyResponse, ReconcileError> {
        let host = batch.path.to_fs(&self.root);
        let revision = current.revision() + 1;
        let mut base = current.into_manifest();
        if base.as_ref().is_some_and(Manifest::is_dir) || host.is_dir() {
            // A file replaces the directory.
            self.clear_directory(&batch.path)?;
            base = None;
        }
        if let Some(base) = &base {
            if !host.exists() {
                return self.lost_file(base.clone());
            }
        }
        let manifest = self.stage_and_commit(batch, base.as_ref(), &host, revision)?;
        self.store.commit(manifest.clone())?;
        Ok(ApplyResponse::Applied {
            state: RemoteState::Present { manifest },
        })
    }

    /// The manifest says the file exists but the tree lost it; record that so
    /// the sender re-diffs against an absent file.
    fn lost_file(&self, manifest: Manifest) -> Result<ApplyResponse, ReconcileError> {
        let current = manifest.revision + 1;
        tracing::warn!(path = %manifest.path, "file missing from storage; tombstoning");
        self.store.tombstone(manifest.path, current)?;
        Ok(ApplyResponse::Conflict { current })
    }

    /// Steps 3 to 5 of the commit protocol. `base` is the manifest of the
    /// file at `base_host` (`None` when starting from an empty file).
    fn stage_and_commit(
        &self,
        batch: &OpBatch,
        base: Option<&Manifest>,
        base_host: &Path,
        revision: u64,
    ) -> Result<Manifest, ReconcileError> {
        let dest_host = batch.path.to_fs(&self.root);
        ensure_parent(&dest_host)?;
        let stage = stage_path(&dest_host);

        let staged = write_stage(&stage, batch, base, base_host).and_then(|(size, chunks)| {
            std::fs::rename(&stage, &dest_host).map_err(|e| apply_io_err(&dest_host, e))?;
            Ok((size, chunks))
        });
        let (size, chunks) = match staged {
            Ok(staged) => staged,
            Err(err) => {
                let _ = std::fs::remove_file(&stage);
                return Err(err);
            }
        };

        Ok(Manifest {
            path: batch.path.clone(),
            kind: EntryKind::File,
            size,
            revision,
            chunk_size: batch.chunk_size,
            chunks,
            mtime: batch.mtime,
        })
    }

    /// Remove the directory at `path` with everything in it, tombstoning
    /// the manifests beneath it. The caller records `path` itself.
    fn clear_directory(&self, path: &RelPath) -> Result<(), ReconcileError> {
        let host = path.to_fs(&self.root);
        match std::fs::remove_dir_all(&host) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(apply_io_err(host, err)),
        }
        let gone = self.store.tombstone_beneath(path)?;
        if !gone.is_empty() {
            tracing::info!(path = %path, entries = gone.len(), "removed directory contents");
        }
        Ok(())
    }
}

fn validate(batch: &OpBatch) -> Result<(), ReconcileError> {
    let invalid = |reason: String| {
        Err(ReconcileError::InvalidBatch {
            path: batch.path.clone(),
            reason,
        })
    };

    if batch.path.is_reserved() {
        return invalid("path is reserved".into());
    }
    if batch.chunk_size == 0 {
        return invalid("chunk size is zero".into());
    }
    if batch.ops.is_empty() {
        return invalid("batch has no ops".into());
    }
    if batch.is_delete() && batch.ops.len() != 1 {
        return invalid("delete must be the only op".into());
    }
    if batch.is_make_dir() && batch.ops.len() != 1 {
        return invalid("make_dir must be the only op".into());
    }

    let mut short_chunk = None;
    let mut last_put = None;
    for (position, op) in batch.ops.iter().enumerate() {
        match op {
            ChunkOp::Rename { from } => {
                if position != 0 {
                    return invalid("rename must be the first op".into());
                }
                if from == &batch.path {
                    return invalid("rename onto itself".into());
                }
                if from.is_reserved() {
                    return invalid(format!("rename source {from} is reserved"));
                }
            }
            ChunkOp::PutChunk { index, bytes } => {
                let len = bytes.len() as u64;
                if len == 0 || len > batch.chunk_size {
                    return invalid(format!("chunk {index} has length {len}"));
                }
                if len < batch.chunk_size {
                    short_chunk = Some(*index);
                }
                last_put = last_put.max(Some(*index));
            }
            ChunkOp::Truncate { .. } | ChunkOp::Delete | ChunkOp::MakeDir => {}
        }
    }
    if let Some(index) = short_chunk {
        if Some(index) != last_put {
            return invalid(format!("short chunk {index} is not the final chunk"));
        }
    }
    Ok(())
}

/// `<dir>/.<name>.treesync-stage`
fn stage_path(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    dest.with_file_name(format!(".{name}{STAGE_SUFFIX}"))
}

fn ensure_parent(path: &Path) -> Result<(), ReconcileError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| apply_io_err(parent, e))?;
    }
    Ok(())
}

fn remove_file(path: &Path) -> Result<(), ReconcileError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(apply_io_err(path, err)),
    }
}

fn set_mtime(path: &Path, batch: &OpBatch) -> Result<(), ReconcileError> {
    let mtime = FileTime::from_system_time(SystemTime::from(batch.mtime));
    filetime::set_file_times(path, mtime, mtime).map_err(|e| apply_io_err(path, e))
}

/// Build the stage file and return its size and chunk fingerprints.
///
/// Only chunks the batch touched are re-hashed; the rest are carried over
/// from `base` when the chunk size is unchanged.
fn write_stage(
    stage: &Path,
    batch: &OpBatch,
    base: Option<&Manifest>,
    base_host: &Path,
) -> Result<(u64, Vec<ChunkFingerprint>), ReconcileError> {
    match base {
        Some(_) => {
            std::fs::copy(base_host, stage).map_err(|e| apply_io_err(base_host, e))?;
        }
        None => {
            File::create(stage).map_err(|e| apply_io_err(stage, e))?;
        }
    }

    let cs = batch.chunk_size;
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(stage)
        .map_err(|e| apply_io_err(stage, e))?;
    let mut len = file.metadata().map_err(|e| apply_io_err(stage, e))?.len();
    let mut touched = BTreeSet::new();
    let mut dirty_from = u64::MAX;
    let mut short_end = None;

    for op in &batch.ops {
        match op {
            ChunkOp::Rename { .. } => {}
            ChunkOp::Truncate { new_size } => {
                file.set_len(*new_size).map_err(|e| apply_io_err(stage, e))?;
                dirty_from = dirty_from.min(len.min(*new_size) / cs);
                len = *new_size;
            }
            ChunkOp::PutChunk { index, bytes } => {
                let offset = index.saturating_mul(cs);
                if offset > len {
                    return Err(ReconcileError::InvalidBatch {
                        path: batch.path.clone(),
                        reason: format!("chunk {index} starts past the end of the file ({len} bytes)"),
                    });
                }
                file.seek(SeekFrom::Start(offset))
                    .map_err(|e| apply_io_err(stage, e))?;
                file.write_all(bytes).map_err(|e| apply_io_err(stage, e))?;
                let end = offset + bytes.len() as u64;
                if (bytes.len() as u64) < cs {
                    short_end = Some((*index, end));
                }
                len = len.max(end);
                touched.insert(*index);
            }
            ChunkOp::Delete | ChunkOp::MakeDir => {
                return Err(ReconcileError::InvalidBatch {
                    path: batch.path.clone(),
                    reason: "structural op mixed with content ops".into(),
                })
            }
        }
    }

    if let Some((index, end)) = short_end {
        if end != len {
            return Err(ReconcileError::InvalidBatch {
                path: batch.path.clone(),
                reason: format!("short chunk {index} does not end the file"),
            });
        }
    }

    file.sync_all().map_err(|e| apply_io_err(stage, e))?;
    drop(file);
    set_mtime(stage, batch)?;

    let store = ChunkStore::new(cs);
    let chunks = match base.filter(|base| base.chunk_size == cs) {
        None => store.scan_file(stage).map_err(SyncError::from)?.chunks,
        Some(base) => {
            let count = chunk_count(len, cs);
            let mut chunks = Vec::with_capacity(count as usize);
            for index in 0..count {
                let carried = base
                    .chunks
                    .get(index as usize)
                    .filter(|_| index < dirty_from && !touched.contains(&index));
                match carried {
                    Some(fingerprint) => chunks.push(*fingerprint),
                    None => {
                        let bytes = store.read_chunk(stage, index).map_err(SyncError::from)?;
                        chunks.push(ChunkFingerprint::of(&bytes));
                    }
                }
            }
            chunks
        }
    };
    Ok((len, chunks))
}
