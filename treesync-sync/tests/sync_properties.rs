//! End-to-end properties of the client pipeline against an in-process
//! reconciler: minimal transfer, idempotent batches, rate bound, rename
//! fidelity, failure isolation and eventual equality.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;
use tokio::time::Instant;

use treesync_core::{
    ChangeEvent, ChangeKind, ChunkOp, ChunkStore, Manifest, OpBatch, RelPath, RemoteState,
    SyncConfig,
};
use treesync_sync::{
    ApplyResponse, LocalTransport, ManifestStore, PendingKind, Reconciler, RetryPolicy,
    SyncOutcome, SyncQueue, SyncWorker, TransferClient, Transport, TransportError,
};

/// Records every batch it forwards, and can drop the connection for chosen
/// paths.
struct Recording {
    inner: LocalTransport,
    batches: Mutex<Vec<OpBatch>>,
    failing: Mutex<HashMap<String, u32>>,
}

impl Recording {
    /// The next `times` batches for `path` fail with a reset connection.
    fn fail_next(&self, path: &str, times: u32) {
        self.failing.lock().expect("lock").insert(path.to_string(), times);
    }

    fn batches(&self) -> Vec<OpBatch> {
        self.batches.lock().expect("lock").clone()
    }

    fn take(&self) -> Vec<OpBatch> {
        std::mem::take(&mut *self.batches.lock().expect("lock"))
    }
}

impl Transport for Recording {
    fn get_manifest(&self, path: &RelPath) -> Result<RemoteState, TransportError> {
        self.inner.get_manifest(path)
    }

    fn apply_ops(&self, batch: &OpBatch) -> Result<ApplyResponse, TransportError> {
        if let Some(left) = self.failing.lock().expect("lock").get_mut(batch.path.as_str()) {
            if *left > 0 {
                *left -= 1;
                return Err(TransportError::Io {
                    endpoint: "test".into(),
                    source: std::io::Error::from(std::io::ErrorKind::ConnectionReset),
                });
            }
        }
        self.batches.lock().expect("lock").push(batch.clone());
        self.inner.apply_ops(batch)
    }

    fn list_tree(&self) -> Result<Vec<Manifest>, TransportError> {
        self.inner.list_tree()
    }
}

struct Harness {
    local: TempDir,
    remote: TempDir,
    reconciler: Arc<Reconciler>,
    transport: Arc<Recording>,
    queue: SyncQueue,
    worker: SyncWorker,
}

impl Harness {
    fn new(chunk_size: u64, interval: Duration) -> Self {
        let local = TempDir::new().expect("local");
        let remote = TempDir::new().expect("remote");
        let reconciler = Arc::new(Reconciler::open(remote.path()).expect("open"));
        let transport = Arc::new(Recording {
            inner: LocalTransport::new(reconciler.clone()),
            batches: Mutex::new(Vec::new()),
            failing: Mutex::new(HashMap::new()),
        });
        let config = SyncConfig {
            chunk_size,
            ..SyncConfig::default()
        };
        let client = TransferClient::new(transport.clone(), RetryPolicy::none());
        let worker = SyncWorker::new(
            local.path(),
            &config,
            Arc::new(ManifestStore::in_memory()),
            client,
        );
        Self {
            local,
            remote,
            reconciler,
            transport,
            queue: SyncQueue::new(interval),
            worker,
        }
    }

    fn write(&self, path: &str, data: &[u8]) {
        let host = self.local.path().join(path);
        fs::create_dir_all(host.parent().expect("parent")).expect("mkdir");
        fs::write(host, data).expect("write");
    }

    fn event(&mut self, path: &str, kind: ChangeKind) {
        let event = ChangeEvent::new(RelPath::new(path).expect("path"), kind);
        self.queue.enqueue(&event, Instant::now());
    }

    /// One poll tick: drain and sync everything that is ready.
    fn tick(&mut self) -> usize {
        self.tick_outcomes().len()
    }

    fn tick_outcomes(&mut self) -> Vec<SyncOutcome> {
        let now = Instant::now();
        let ready = self.queue.drain_ready(now);
        let mut outcomes = Vec::with_capacity(ready.len());
        for entry in ready {
            let outcome = self.worker.sync_path(&entry);
            self.queue.finish(&entry.path, outcome.completion(), now);
            outcomes.push(outcome);
        }
        outcomes
    }

    fn settle(&mut self) {
        for _ in 0..10 {
            if self.tick() == 0 && self.queue.pending_len() == 0 {
                return;
            }
        }
        panic!("queue did not settle");
    }
}

/// Every entry beneath `root`: file contents, or `None` for a directory.
fn snapshot(root: &Path) -> BTreeMap<String, Option<Vec<u8>>> {
    let mut files = BTreeMap::new();
    collect(root, root, &mut files);
    files
}

fn collect(root: &Path, dir: &Path, files: &mut BTreeMap<String, Option<Vec<u8>>>) {
    for entry in fs::read_dir(dir).expect("read_dir") {
        let path = entry.expect("entry").path();
        let rel = RelPath::from_fs(root, &path).expect("relpath");
        if rel.is_reserved() {
            continue;
        }
        if path.is_dir() {
            files.insert(rel.to_string(), None);
            collect(root, &path, files);
        } else {
            files.insert(rel.to_string(), Some(fs::read(&path).expect("read")));
        }
    }
}

fn put_indices(batch: &OpBatch) -> Vec<u64> {
    batch
        .ops
        .iter()
        .filter_map(|op| match op {
            ChunkOp::PutChunk { index, .. } => Some(*index),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn readme_create_overwrite_delete_scenario() {
    let mut h = Harness::new(4096, Duration::from_secs(60));
    let data: Vec<u8> = (0..10 * 1024u32).map(|i| (i % 253) as u8).collect();
    h.write("docs/readme.txt", &data);
    h.event("docs/readme.txt", ChangeKind::Created);
    h.tick();

    let path = RelPath::new("docs/readme.txt").expect("path");
    let manifest = h.reconciler.get_manifest(&path).into_manifest().expect("present");
    assert_eq!(manifest.chunks, ChunkStore::new(4096).fingerprints(&data));
    assert_eq!(manifest.size, 10 * 1024);
    h.transport.take();

    let mut edited = data.clone();
    edited[4096..8192].fill(0xAB);
    h.write("docs/readme.txt", &edited);
    h.event("docs/readme.txt", ChangeKind::Modified);
    tokio::time::advance(Duration::from_secs(60)).await;
    h.tick();
    let batches = h.transport.take();
    assert_eq!(batches.len(), 1);
    assert_eq!(put_indices(&batches[0]), vec![1]);
    assert_eq!(batches[0].ops.len(), 1);

    fs::remove_file(h.local.path().join("docs/readme.txt")).expect("rm");
    h.event("docs/readme.txt", ChangeKind::Deleted);
    tokio::time::advance(Duration::from_secs(60)).await;
    h.tick();
    let batches = h.transport.take();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].ops, vec![ChunkOp::Delete]);
    assert!(!h.remote.path().join("docs/readme.txt").exists());
    assert!(h.reconciler.get_manifest(&path).manifest().is_none());
}

#[tokio::test(start_paused = true)]
async fn replayed_batch_conflicts_and_leaves_file_intact() {
    let mut h = Harness::new(4, Duration::ZERO);
    h.write("f", b"abcdefghij");
    h.event("f", ChangeKind::Created);
    h.tick();

    let batch = h.transport.batches().pop().expect("batch");
    let before = h.reconciler.get_manifest(&batch.path);
    let replay = h.reconciler.apply(&batch).expect("replay");
    assert_eq!(replay, ApplyResponse::Conflict { current: 1 });
    assert_eq!(h.reconciler.get_manifest(&batch.path), before);
    assert_eq!(fs::read(h.remote.path().join("f")).expect("read"), b"abcdefghij");
}

#[tokio::test(start_paused = true)]
async fn burst_of_modifications_is_one_apply_per_interval() {
    let mut h = Harness::new(4, Duration::from_secs(60));
    h.write("hot.log", b"0");
    h.event("hot.log", ChangeKind::Created);
    h.tick();
    h.transport.take();

    for i in 0..20u8 {
        tokio::time::advance(Duration::from_secs(2)).await;
        h.write("hot.log", &[b'a' + i; 9]);
        h.event("hot.log", ChangeKind::Modified);
        h.tick();
    }
    assert!(h.transport.take().is_empty(), "still inside the first interval");

    tokio::time::advance(Duration::from_secs(20)).await;
    h.tick();
    h.tick();
    assert_eq!(h.transport.take().len(), 1);
    assert_eq!(
        fs::read(h.remote.path().join("hot.log")).expect("read"),
        vec![b'a' + 19; 9]
    );
}

#[tokio::test(start_paused = true)]
async fn unchanged_rename_is_a_single_rename_op() {
    let mut h = Harness::new(4, Duration::ZERO);
    h.write("a/old.txt", b"some content here");
    h.event("a/old.txt", ChangeKind::Created);
    h.tick();
    h.transport.take();

    fs::create_dir_all(h.local.path().join("b")).expect("mkdir");
    fs::rename(h.local.path().join("a/old.txt"), h.local.path().join("b/new.txt")).expect("mv");
    h.event("a/old.txt", ChangeKind::RenamedFrom { correlation: 1 });
    h.event("b/new.txt", ChangeKind::RenamedTo { correlation: 1 });
    h.settle();

    let batches = h.transport.take();
    assert_eq!(batches.len(), 1);
    assert_eq!(
        batches[0].ops,
        vec![ChunkOp::Rename {
            from: RelPath::new("a/old.txt").expect("path")
        }]
    );
    let moved = h
        .reconciler
        .get_manifest(&RelPath::new("b/new.txt").expect("path"))
        .into_manifest()
        .expect("present");
    assert_eq!(moved.revision, 2);
    assert_eq!(snapshot(h.local.path()), snapshot(h.remote.path()));
}

#[tokio::test(start_paused = true)]
async fn trees_converge_after_mixed_operations() {
    let mut h = Harness::new(8, Duration::ZERO);
    let root = h.local.path().to_path_buf();

    h.write("keep.txt", b"unchanged");
    h.write("edit.bin", &[7u8; 40]);
    h.write("dir/moved.txt", b"going places");
    h.write("dir/sub/gone.txt", b"bye");
    h.write("empty", b"");
    for path in ["keep.txt", "edit.bin", "dir/moved.txt", "dir/sub/gone.txt", "empty"] {
        h.event(path, ChangeKind::Created);
    }
    h.settle();
    assert_eq!(snapshot(&root), snapshot(h.remote.path()));

    h.write("edit.bin", &[9u8; 20]);
    h.event("edit.bin", ChangeKind::Modified);
    fs::remove_file(root.join("dir/sub/gone.txt")).expect("rm");
    h.event("dir/sub/gone.txt", ChangeKind::Deleted);
    fs::rename(root.join("dir/moved.txt"), root.join("arrived.txt")).expect("mv");
    h.event("dir/moved.txt", ChangeKind::RenamedFrom { correlation: 5 });
    h.event("arrived.txt", ChangeKind::RenamedTo { correlation: 5 });
    h.write("arrived.txt", b"going places, edited");
    h.event("arrived.txt", ChangeKind::Modified);
    h.write("new/deep/file.txt", b"fresh");
    h.event("new/deep/file.txt", ChangeKind::Created);
    h.settle();

    assert_eq!(snapshot(&root), snapshot(h.remote.path()));
    // Emptied locally, so still present remotely.
    assert!(h.remote.path().join("dir/sub").is_dir());
}

#[tokio::test(start_paused = true)]
async fn empty_directories_are_replicated_and_removed() {
    let mut h = Harness::new(4, Duration::ZERO);
    let root = h.local.path().to_path_buf();
    fs::create_dir_all(root.join("outer/inner")).expect("mkdir");
    h.write("outer/file", b"data");
    for path in ["outer", "outer/inner", "outer/file"] {
        h.event(path, ChangeKind::Created);
    }
    h.settle();
    assert!(h.remote.path().join("outer/inner").is_dir());
    assert_eq!(snapshot(&root), snapshot(h.remote.path()));

    fs::remove_dir_all(root.join("outer")).expect("rm");
    for path in ["outer/inner", "outer/file", "outer"] {
        h.event(path, ChangeKind::Deleted);
    }
    h.settle();
    assert!(!h.remote.path().join("outer").exists());
    assert!(h.reconciler.list_tree().is_empty());
}

#[tokio::test(start_paused = true)]
async fn transport_failure_requeues_only_that_path() {
    let mut h = Harness::new(4, Duration::from_secs(60));
    let flaky = RelPath::new("flaky.txt").expect("path");
    h.write("flaky.txt", b"first try");
    h.write("steady.txt", b"fine");
    h.transport.fail_next("flaky.txt", 1);
    h.event("flaky.txt", ChangeKind::Created);
    h.event("steady.txt", ChangeKind::Created);

    let outcomes = h.tick_outcomes();
    assert_eq!(outcomes.len(), 2);
    for outcome in &outcomes {
        match outcome.path().as_str() {
            "flaky.txt" => assert!(
                matches!(outcome, SyncOutcome::Requeue { kind: PendingKind::Created, .. }),
                "{outcome:?}"
            ),
            _ => assert!(matches!(outcome, SyncOutcome::Synced { .. }), "{outcome:?}"),
        }
    }
    assert_eq!(fs::read(h.remote.path().join("steady.txt")).expect("read"), b"fine");
    assert!(!h.remote.path().join("flaky.txt").exists());
    assert_eq!(h.queue.pending_kind(&flaky), Some(&PendingKind::Created));

    // The retry still honours the rate limit.
    assert_eq!(h.tick(), 0);
    tokio::time::advance(Duration::from_secs(60)).await;
    let outcomes = h.tick_outcomes();
    assert_eq!(outcomes.len(), 1);
    assert!(matches!(outcomes[0], SyncOutcome::Synced { revision: 1, .. }), "{:?}", outcomes[0]);
    assert_eq!(fs::read(h.remote.path().join("flaky.txt")).expect("read"), b"first try");
    assert_eq!(h.queue.pending_len(), 0);
}
