//! treesync core library: domain types, chunking, configuration, errors.
//!
//! Public API surface:
//! - [`types`]: paths, fingerprints, manifests, change events, chunk ops
//! - [`chunk`]: [`ChunkStore`], fixed-size chunking of local files
//! - [`config`]: [`SyncConfig`] load / save
//! - [`error`]: [`CoreError`]

pub mod chunk;
pub mod config;
pub mod error;
pub mod types;

pub use chunk::{ChunkStore, DEFAULT_CHUNK_SIZE};
pub use config::{RetryConfig, SyncConfig};
pub use error::CoreError;
pub use types::{
    ChangeEvent, ChangeKind, ChunkFingerprint, ChunkOp, EntryKind, LocalState, Manifest, OpBatch, RelPath,
    RemoteState,
};
