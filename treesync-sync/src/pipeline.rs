//! Per-path sync pipeline shared by the client runtime and tests.
//!
//! One [`SyncWorker::sync_path`] call takes a drained [`QueueEntry`] to a
//! terminal [`SyncOutcome`]: scan the local file, diff it against the
//! last-known remote manifest, send the batch, and record the acknowledged
//! state. Revision conflicts refetch the remote manifest and re-diff, a
//! bounded number of times. Every other failure requeues the entry; it never
//! affects other paths.
//!
//! A path that is a directory locally is synced as a `MakeDir` batch with no
//! content. Deleting a directory removes everything beneath it remotely.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use treesync_core::{
    ChunkOp, ChunkStore, CoreError, Manifest, OpBatch, RelPath, RemoteState, SyncConfig,
};

use crate::diff::{DiffEngine, FileChunks};
use crate::error::{SyncError, TransferError};
use crate::manifest_store::ManifestStore;
use crate::queue::{Completion, PendingKind, QueueEntry};
use crate::transfer::TransferClient;

/// Terminal outcome of one sync attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// A batch was committed remotely.
    Synced {
        path: RelPath,
        ops: usize,
        bytes: u64,
        revision: u64,
    },
    /// The remote already matched the local file.
    Unchanged { path: RelPath },
    /// Failed this time; `kind` goes back on the queue.
    Requeue {
        path: RelPath,
        kind: PendingKind,
        reason: String,
    },
}

impl SyncOutcome {
    pub fn path(&self) -> &RelPath {
        match self {
            SyncOutcome::Synced { path, .. }
            | SyncOutcome::Unchanged { path }
            | SyncOutcome::Requeue { path, .. } => path,
        }
    }

    pub fn completion(&self) -> Completion {
        match self {
            SyncOutcome::Requeue { kind, .. } => Completion::Requeue(kind.clone()),
            _ => Completion::Done,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncWorker {
    root: PathBuf,
    chunks: ChunkStore,
    engine: DiffEngine,
    store: Arc<ManifestStore>,
    client: TransferClient,
    conflict_retries: u32,
}

impl SyncWorker {
    pub fn new(
        root: &Path,
        config: &SyncConfig,
        store: Arc<ManifestStore>,
        client: TransferClient,
    ) -> Self {
        Self {
            root: root.to_path_buf(),
            chunks: ChunkStore::new(config.chunk_size),
            engine: DiffEngine::new(),
            store,
            client,
            conflict_retries: config.conflict_retries,
        }
    }

    pub fn store(&self) -> &Arc<ManifestStore> {
        &self.store
    }

    /// Bring the remote copy of `entry.path` in line with the local tree.
    pub fn sync_path(&self, entry: &QueueEntry) -> SyncOutcome {
        let path = &entry.path;
        let result = match &entry.latest_kind {
            PendingKind::Created | PendingKind::Modified => self.sync_content(path),
            PendingKind::Deleted => self.sync_delete(path),
            PendingKind::Renamed { from } => self.sync_rename(from, path),
        };
        match result {
            Ok(outcome) => {
                if let SyncOutcome::Synced {
                    ops, bytes, revision, ..
                } = &outcome
                {
                    tracing::info!(path = %path, ops, bytes, revision, "synced");
                } else {
                    tracing::debug!(path = %path, "already in sync");
                }
                outcome
            }
            Err(err) => {
                tracing::warn!(path = %path, error = %err, "sync failed; requeueing");
                SyncOutcome::Requeue {
                    path: path.clone(),
                    kind: entry.latest_kind.clone(),
                    reason: err.to_string(),
                }
            }
        }
    }

    fn sync_content(&self, path: &RelPath) -> Result<SyncOutcome, SyncError> {
        let host = path.to_fs(&self.root);
        if host.is_dir() {
            return self.sync_dir(path);
        }
        for attempt in 0..=self.conflict_retries {
            let local = match self.chunks.scan_file(&host) {
                Ok(local) => local,
                Err(err) if is_missing(&err) => return self.sync_delete(path),
                Err(source) => {
                    return Err(SyncError::ChunkRead {
                        path: path.clone(),
                        source,
                    })
                }
            };

            let remote = self.store.state(path);
            let replaces_dir = remote.manifest().is_some_and(Manifest::is_dir);
            let old = remote.manifest().filter(|m| !m.is_dir());
            if old.is_some_and(|m| m.content_matches(&local)) {
                return Ok(SyncOutcome::Unchanged { path: path.clone() });
            }

            let source = self.file_chunks(&host);
            let ops = self.engine.diff(path, old, &local, &source)?;
            let batch = OpBatch {
                path: path.clone(),
                revision: remote.revision(),
                chunk_size: local.chunk_size,
                mtime: local.mtime,
                ops,
            };
            match self.client.apply(&batch) {
                Ok(state) => {
                    if replaces_dir {
                        self.store.tombstone_beneath(path)?;
                    }
                    return self.acknowledged(&batch, state);
                }
                Err(TransferError::Conflict { current, .. }) => {
                    tracing::warn!(path = %path, attempt, current, "revision conflict; re-diffing");
                    self.refresh(path)?;
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(SyncError::ConflictsExhausted {
            path: path.clone(),
            attempts: self.conflict_retries + 1,
        })
    }

    fn sync_delete(&self, path: &RelPath) -> Result<SyncOutcome, SyncError> {
        if path.to_fs(&self.root).exists() {
            // Re-created since the delete was queued.
            return self.sync_content(path);
        }
        for attempt in 0..=self.conflict_retries {
            let remote = self.store.state(path);
            let Some(manifest) = remote.manifest() else {
                return Ok(SyncOutcome::Unchanged { path: path.clone() });
            };
            let was_dir = manifest.is_dir();
            let batch = OpBatch {
                path: path.clone(),
                revision: remote.revision(),
                chunk_size: self.chunks.chunk_size(),
                mtime: Utc::now(),
                ops: vec![ChunkOp::Delete],
            };
            match self.client.apply(&batch) {
                Ok(state) => {
                    if was_dir {
                        self.store.tombstone_beneath(path)?;
                    }
                    return self.acknowledged(&batch, state);
                }
                Err(TransferError::Conflict { current, .. }) => {
                    tracing::warn!(path = %path, attempt, current, "revision conflict on delete");
                    self.refresh(path)?;
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(SyncError::ConflictsExhausted {
            path: path.clone(),
            attempts: self.conflict_retries + 1,
        })
    }

    fn sync_dir(&self, path: &RelPath) -> Result<SyncOutcome, SyncError> {
        let host = path.to_fs(&self.root);
        for attempt in 0..=self.conflict_retries {
            let remote = self.store.state(path);
            if remote.manifest().is_some_and(Manifest::is_dir) {
                return Ok(SyncOutcome::Unchanged { path: path.clone() });
            }
            let mtime = std::fs::metadata(&host)
                .and_then(|meta| meta.modified())
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            let batch = OpBatch {
                path: path.clone(),
                revision: remote.revision(),
                chunk_size: self.chunks.chunk_size(),
                mtime,
                ops: vec![ChunkOp::MakeDir],
            };
            match self.client.apply(&batch) {
                Ok(state) => return self.acknowledged(&batch, state),
                Err(TransferError::Conflict { current, .. }) => {
                    tracing::warn!(path = %path, attempt, current, "revision conflict on directory");
                    self.refresh(path)?;
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(SyncError::ConflictsExhausted {
            path: path.clone(),
            attempts: self.conflict_retries + 1,
        })
    }

    fn sync_rename(&self, from: &RelPath, path: &RelPath) -> Result<SyncOutcome, SyncError> {
        let host = path.to_fs(&self.root);
        if host.is_dir() {
            let outcome = self.sync_dir(path)?;
            if !from.to_fs(&self.root).exists() {
                self.sync_delete(from)?;
            }
            return Ok(outcome);
        }
        let Some(old) = self.store.get(from).filter(|m| !m.is_dir()) else {
            // The remote never had the source as a file: plain upload.
            return self.sync_content(path);
        };
        let local = match self.chunks.scan_file(&host) {
            Ok(local) => local,
            Err(err) if is_missing(&err) => return self.sync_delete(from),
            Err(source) => {
                return Err(SyncError::ChunkRead {
                    path: path.clone(),
                    source,
                })
            }
        };

        let plan = self.engine.plan_rename(from, Some(&old), &local);
        let ops = self
            .engine
            .materialize(path, &plan, &self.file_chunks(&host))?;
        let batch = OpBatch {
            path: path.clone(),
            revision: old.revision,
            chunk_size: local.chunk_size,
            mtime: local.mtime,
            ops,
        };
        match self.client.apply(&batch) {
            Ok(state) => {
                self.store.tombstone(from.clone(), old.revision + 1)?;
                self.acknowledged(&batch, state)
            }
            Err(TransferError::Conflict { current, .. }) => {
                tracing::warn!(from = %from, to = %path, current, "rename conflict; falling back to upload");
                self.refresh(from)?;
                self.refresh(path)?;
                let outcome = self.sync_content(path)?;
                if !from.to_fs(&self.root).exists() {
                    self.sync_delete(from)?;
                }
                Ok(outcome)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn acknowledged(&self, batch: &OpBatch, state: RemoteState) -> Result<SyncOutcome, SyncError> {
        let revision = state.revision();
        self.store.record(state)?;
        Ok(SyncOutcome::Synced {
            path: batch.path.clone(),
            ops: batch.ops.len(),
            bytes: batch.payload_bytes(),
            revision,
        })
    }

    fn refresh(&self, path: &RelPath) -> Result<(), SyncError> {
        let state = self.client.fetch_manifest(path)?;
        self.store.record(state)
    }

    fn file_chunks(&self, host: &Path) -> FileChunks {
        FileChunks {
            store: self.chunks,
            path: host.to_path_buf(),
        }
    }
}

fn is_missing(err: &CoreError) -> bool {
    matches!(err, CoreError::Io { source, .. } if source.kind() == ErrorKind::NotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalTransport;
    use crate::reconciler::Reconciler;
    use crate::transfer::RetryPolicy;
    use std::fs;
    use tempfile::TempDir;
    use tokio::time::Instant;

    struct Pair {
        local: TempDir,
        remote: TempDir,
        reconciler: Arc<Reconciler>,
        worker: SyncWorker,
    }

    fn pair() -> Pair {
        let local = TempDir::new().expect("local");
        let remote = TempDir::new().expect("remote");
        let reconciler = Arc::new(Reconciler::open(remote.path()).expect("open"));
        let client = TransferClient::new(
            Arc::new(LocalTransport::new(reconciler.clone())),
            RetryPolicy::none(),
        );
        let config = SyncConfig {
            chunk_size: 4,
            ..SyncConfig::default()
        };
        let worker = SyncWorker::new(
            local.path(),
            &config,
            Arc::new(ManifestStore::in_memory()),
            client,
        );
        Pair {
            local,
            remote,
            reconciler,
            worker,
        }
    }

    fn entry(path: &str, kind: PendingKind) -> QueueEntry {
        QueueEntry {
            path: RelPath::new(path).expect("path"),
            latest_kind: kind,
            last_enqueued_at: Instant::now(),
            last_synced_at: None,
        }
    }

    #[test]
    fn create_then_unchanged() {
        let pair = pair();
        fs::write(pair.local.path().join("f.txt"), b"hello world").expect("write");

        let outcome = pair.worker.sync_path(&entry("f.txt", PendingKind::Created));
        assert!(matches!(outcome, SyncOutcome::Synced { ops: 3, revision: 1, .. }), "{outcome:?}");
        assert_eq!(fs::read(pair.remote.path().join("f.txt")).expect("read"), b"hello world");

        let outcome = pair.worker.sync_path(&entry("f.txt", PendingKind::Modified));
        assert!(matches!(outcome, SyncOutcome::Unchanged { .. }), "{outcome:?}");
    }

    #[test]
    fn missing_file_turns_into_delete() {
        let pair = pair();
        let path = pair.local.path().join("gone");
        fs::write(&path, b"x").expect("write");
        pair.worker.sync_path(&entry("gone", PendingKind::Created));
        fs::remove_file(&path).expect("rm");

        let outcome = pair.worker.sync_path(&entry("gone", PendingKind::Modified));
        assert!(matches!(outcome, SyncOutcome::Synced { ops: 1, revision: 2, .. }), "{outcome:?}");
        assert!(!pair.remote.path().join("gone").exists());
    }

    #[test]
    fn stale_client_manifest_recovers_through_conflict() {
        let pair = pair();
        fs::write(pair.local.path().join("f"), b"abcdefgh").expect("write");
        pair.worker.sync_path(&entry("f", PendingKind::Created));

        // Someone else moved the remote revision on.
        let batch = OpBatch {
            path: RelPath::new("f").expect("path"),
            revision: 1,
            chunk_size: 4,
            mtime: Utc::now(),
            ops: vec![ChunkOp::PutChunk {
                index: 0,
                bytes: b"zzzz".to_vec(),
            }],
        };
        pair.reconciler.apply(&batch).expect("foreign write");

        fs::write(pair.local.path().join("f"), b"abcdefgX").expect("write");
        let outcome = pair.worker.sync_path(&entry("f", PendingKind::Modified));
        assert!(matches!(outcome, SyncOutcome::Synced { revision: 3, .. }), "{outcome:?}");
        assert_eq!(fs::read(pair.remote.path().join("f")).expect("read"), b"abcdefgX");
    }

    #[test]
    fn rename_sends_no_chunks() {
        let pair = pair();
        fs::write(pair.local.path().join("a"), b"abcdefgh").expect("write");
        pair.worker.sync_path(&entry("a", PendingKind::Created));
        fs::rename(pair.local.path().join("a"), pair.local.path().join("b")).expect("mv");

        let outcome = pair.worker.sync_path(&entry(
            "b",
            PendingKind::Renamed {
                from: RelPath::new("a").expect("path"),
            },
        ));
        assert!(
            matches!(outcome, SyncOutcome::Synced { ops: 1, bytes: 0, revision: 2, .. }),
            "{outcome:?}"
        );
        assert!(!pair.remote.path().join("a").exists());
        assert_eq!(fs::read(pair.remote.path().join("b")).expect("read"), b"abcdefgh");
        assert!(pair.worker.store().get(&RelPath::new("a").expect("path")).is_none());
    }

    #[test]
    fn outcome_maps_to_completion() {
        let requeue = SyncOutcome::Requeue {
            path: RelPath::new("x").expect("path"),
            kind: PendingKind::Modified,
            reason: "boom".into(),
        };
        assert_eq!(requeue.completion(), Completion::Requeue(PendingKind::Modified));
        let done = SyncOutcome::Unchanged {
            path: RelPath::new("x").expect("path"),
        };
        assert_eq!(done.completion(), Completion::Done);
    }

    #[test]
    fn empty_directory_is_created_and_removed() {
        let pair = pair();
        fs::create_dir_all(pair.local.path().join("a/empty")).expect("mkdir");

        let outcome = pair.worker.sync_path(&entry("a/empty", PendingKind::Created));
        assert!(matches!(outcome, SyncOutcome::Synced { ops: 1, bytes: 0, revision: 1, .. }), "{outcome:?}");
        assert!(pair.remote.path().join("a/empty").is_dir());
        let outcome = pair.worker.sync_path(&entry("a/empty", PendingKind::Modified));
        assert!(matches!(outcome, SyncOutcome::Unchanged { .. }), "{outcome:?}");

        fs::remove_dir(pair.local.path().join("a/empty")).expect("rmdir");
        let outcome = pair.worker.sync_path(&entry("a/empty", PendingKind::Deleted));
        assert!(matches!(outcome, SyncOutcome::Synced { revision: 2, .. }), "{outcome:?}");
        assert!(!pair.remote.path().join("a/empty").exists());
        assert!(pair.remote.path().join("a").is_dir());
    }

    #[test]
    fn deleted_directory_takes_its_files_on_both_sides() {
        let pair = pair();
        fs::create_dir_all(pair.local.path().join("d")).expect("mkdir");
        fs::write(pair.local.path().join("d/f"), b"abcdef").expect("write");
        pair.worker.sync_path(&entry("d", PendingKind::Created));
        pair.worker.sync_path(&entry("d/f", PendingKind::Created));

        fs::remove_dir_all(pair.local.path().join("d")).expect("rm");
        let outcome = pair.worker.sync_path(&entry("d", PendingKind::Deleted));
        assert!(matches!(outcome, SyncOutcome::Synced { .. }), "{outcome:?}");
        assert!(!pair.remote.path().join("d").exists());

        // The file's own delete finds nothing left to do.
        let outcome = pair.worker.sync_path(&entry("d/f", PendingKind::Deleted));
        assert!(matches!(outcome, SyncOutcome::Unchanged { .. }), "{outcome:?}");
        let f = RelPath::new("d/f").expect("path");
        assert_eq!(pair.worker.store().revision(&f), pair.reconciler.get_manifest(&f).revision());
    }
}
