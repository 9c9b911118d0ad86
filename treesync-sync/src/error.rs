//! Error types for treesync-sync.
//!
//! Failures are path-scoped: none of these abort synchronization of any other
//! path.

use std::path::PathBuf;

use thiserror::Error;

use treesync_core::{CoreError, RelPath};

/// A failure talking to the remote side. Network and framing failures
/// (`Io`, `Protocol`) are retried; a rejected request (`Remote`) is not,
/// since sending it again would get the same answer.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error talking to {endpoint}: {source}")]
    Io {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error("protocol error: {0}")]
    Protocol(String),

    /// The remote rejected the batch without mutating anything.
    #[error("remote apply failed: {0}")]
    Remote(String),
}

/// Outcome of a transfer that did not succeed.
#[derive(Debug, Error)]
pub enum TransferError {
    /// The remote revision does not match the precondition; re-diff against
    /// the remote manifest before retrying.
    #[error("revision conflict on {path}: expected {expected}, remote has {current}")]
    Conflict {
        path: RelPath,
        expected: u64,
        current: u64,
    },

    /// Every retry failed; the path is skipped for this cycle.
    #[error("{operation} failed after {attempts} attempt(s): {source}")]
    Transport {
        operation: String,
        attempts: u32,
        #[source]
        source: TransportError,
    },
}

/// Server-side rejection of a batch; nothing was mutated.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("invalid batch for {path}: {reason}")]
    InvalidBatch { path: RelPath, reason: String },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Store(#[from] SyncError),
}

/// All errors that can arise from client-side sync and manifest storage.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Core(#[from] CoreError),

    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON serialization/deserialization error (manifest store).
    #[error("manifest store JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The local file vanished or changed while its chunks were being read.
    #[error("could not read chunks of {path}: {source}")]
    ChunkRead {
        path: RelPath,
        #[source]
        source: CoreError,
    },

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error("{path} still conflicts after {attempts} re-diff(s)")]
    ConflictsExhausted { path: RelPath, attempts: u32 },
}

/// Convenience constructor for [`SyncError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> SyncError {
    SyncError::Io {
        path: path.into(),
        source,
    }
}

/// Convenience constructor for [`ReconcileError::Io`].
pub(crate) fn apply_io_err(path: impl Into<PathBuf>, source: std::io::Error) -> ReconcileError {
    ReconcileError::Io {
        path: path.into(),
        source,
    }
}
