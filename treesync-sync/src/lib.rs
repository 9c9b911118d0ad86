//! # treesync-sync
//!
//! The synchronization engine: per-path rate-limited queueing, chunk-level
//! diffing, transfer with retry and conflict handling, and the receiving
//! side's reconciler.
//!
//! Client side: [`SyncQueue`] → [`pipeline::SyncWorker`] ([`DiffEngine`] +
//! [`TransferClient`]) → [`Transport`]. Server side: [`Reconciler`].

pub mod diff;
pub mod error;
pub mod local;
pub mod manifest_store;
pub mod pipeline;
pub mod queue;
pub mod reconciler;
pub mod transfer;

pub use diff::{ChunkSource, DiffEngine, FileChunks, PlannedOp};
pub use error::{ReconcileError, SyncError, TransferError, TransportError};
pub use local::LocalTransport;
pub use manifest_store::ManifestStore;
pub use pipeline::{SyncOutcome, SyncWorker};
pub use queue::{Completion, PendingKind, QueueEntry, SyncQueue};
pub use reconciler::Reconciler;
pub use transfer::{ApplyResponse, RetryPolicy, TransferClient, Transport};
