use std::path::PathBuf;

use thiserror::Error;

/// Error surface for the client and server processes.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to bind {interface}: {source}")]
    Bind {
        interface: String,
        #[source]
        source: std::io::Error,
    },

    #[error("config error: {0}")]
    Core(#[from] treesync_core::CoreError),

    #[error("sync error: {0}")]
    Sync(#[from] treesync_sync::SyncError),

    #[error("reconciler error: {0}")]
    Reconcile(#[from] treesync_sync::ReconcileError),

    #[error("transfer error: {0}")]
    Transfer(#[from] treesync_sync::TransferError),

    #[error("change detection failed: {0}")]
    Detector(#[from] treesync_detector::DetectorError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Protocol(String),
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> DaemonError {
    DaemonError::Io {
        path: path.into(),
        source,
    }
}
