//! Change detection for a synchronized root.
//!
//! [`ChangeDetector::start`] watches the root with `notify` and runs a full
//! reconciliation scan immediately and then every `scan_interval_secs`. Both
//! sources feed one [`DetectorState`], which emits canonical [`ChangeEvent`]s
//! on the returned [`ChangeStream`]. Scans and settling (hashing new files,
//! pairing unlinked rename halves) run on the blocking pool.
//!
//! Losing the root is terminal: the stream yields one
//! [`DetectorError::RootInaccessible`] and then ends.

mod state;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use treesync_core::{ChangeEvent, Manifest, SyncConfig};

pub use state::{DetectorState, KnownEntry};

const STREAM_CAPACITY: usize = 1024;
const MIN_EXPIRY_TICK: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("synchronized root {path} is not accessible: {source}")]
    RootInaccessible {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("notify error: {0}")]
    Notify(#[from] notify::Error),

    #[error("detector task failed: {0}")]
    Task(String),
}

/// Entry point; see the module docs.
#[derive(Debug)]
pub struct ChangeDetector;

impl ChangeDetector {
    /// Start watching `root`. `seed` is the last known synchronized state, so
    /// files that did not change while nothing was watching are not
    /// re-reported by the initial scan.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(root: &Path, config: &SyncConfig, seed: &[Manifest]) -> Result<ChangeStream, DetectorError> {
        let root = fs::canonicalize(root).map_err(|source| DetectorError::RootInaccessible {
            path: root.to_path_buf(),
            source,
        })?;

        let (event_tx, event_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
        let mut watcher: RecommendedWatcher = recommended_watcher(move |event| {
            let _ = event_tx.send(event);
        })?;
        watcher.watch(&root, RecursiveMode::Recursive)?;
        tracing::info!(root = %root.display(), "watching for changes");

        let state = DetectorState::new(&root, config, seed);
        let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
        let task = tokio::spawn(detector_task(
            state,
            watcher,
            event_rx,
            tx,
            config.scan_interval(),
            config.rename_window(),
        ));
        Ok(ChangeStream { rx, task })
    }
}

/// Receiving end of a running detector. Dropping it stops the detector.
#[derive(Debug)]
pub struct ChangeStream {
    rx: mpsc::Receiver<Result<ChangeEvent, DetectorError>>,
    task: JoinHandle<()>,
}

impl ChangeStream {
    /// Next change, or `None` once the detector has stopped.
    pub async fn next(&mut self) -> Option<Result<ChangeEvent, DetectorError>> {
        self.rx.recv().await
    }
}

impl Drop for ChangeStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

type Out = mpsc::Sender<Result<ChangeEvent, DetectorError>>;

async fn detector_task(
    state: DetectorState,
    _watcher: RecommendedWatcher,
    mut event_rx: mpsc::UnboundedReceiver<notify::Result<Event>>,
    out: Out,
    scan_interval: Duration,
    rename_window: Duration,
) {
    let mut state = Some(state);
    let mut scan_tick = tokio::time::interval(scan_interval);
    scan_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut expiry_tick = tokio::time::interval((rename_window / 2).max(MIN_EXPIRY_TICK));
    expiry_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let result = tokio::select! {
            _ = out.closed() => return,
            _ = scan_tick.tick() => {
                let Some(owned) = state.take() else { return };
                match run_blocking(owned, DetectorState::scan).await {
                    Ok((owned, result)) => {
                        state = Some(owned);
                        result
                    }
                    Err(err) => {
                        let _ = out.send(Err(err)).await;
                        return;
                    }
                }
            }
            event = event_rx.recv() => {
                let Some(event) = event else { return };
                let Some(current) = state.as_mut() else { return };
                match event {
                    Ok(event) => observe(current, &event),
                    Err(err) => {
                        tracing::warn!(error = %err, "watcher event error");
                        continue;
                    }
                }
            }
            _ = expiry_tick.tick() => {
                if state.as_ref().map_or(true, DetectorState::is_settled) {
                    continue;
                }
                let Some(owned) = state.take() else { return };
                match run_blocking(owned, |s| Ok(s.settle(Instant::now()))).await {
                    Ok((owned, result)) => {
                        state = Some(owned);
                        result
                    }
                    Err(err) => {
                        let _ = out.send(Err(err)).await;
                        return;
                    }
                }
            }
        };

        match result {
            Ok(events) => {
                for event in events {
                    tracing::debug!(path = %event.path, kind = ?event.kind, "change detected");
                    if out.send(Ok(event)).await.is_err() {
                        return;
                    }
                }
            }
            Err(err) => {
                tracing::error!(error = %err, "change detection stopped");
                let _ = out.send(Err(err)).await;
                return;
            }
        }
    }
}

type Detected = Result<Vec<ChangeEvent>, DetectorError>;

/// Run `work` on the blocking pool, handing the state over and back.
async fn run_blocking<F>(mut state: DetectorState, work: F) -> Result<(DetectorState, Detected), DetectorError>
where
    F: FnOnce(&mut DetectorState) -> Detected + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let result = work(&mut state);
        (state, result)
    })
    .await
    .map_err(|err| DetectorError::Task(format!("blocking detector work failed: {err}")))
}

fn observe(state: &mut DetectorState, event: &Event) -> Result<Vec<ChangeEvent>, DetectorError> {
    if matches!(event.kind, EventKind::Remove(_)) {
        if let Err(source) = fs::metadata(state.root()) {
            return Err(DetectorError::RootInaccessible {
                path: state.root().to_path_buf(),
                source,
            });
        }
    }
    Ok(state.observe(event, Instant::now()))
}
