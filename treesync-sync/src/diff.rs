//! Chunk-level diffing: the minimal op sequence that turns a receiver's copy
//! into the sender's.
//!
//! Planning is pure and works on fingerprints alone ([`DiffEngine::plan`]).
//! Materializing reads the bytes of every planned `PutChunk` from a
//! [`ChunkSource`] and checks them against the fingerprint the plan was made
//! from, so a file rewritten between scan and read is caught instead of
//! shipped half-old.
//!
//! Op order within a plan: an optional `Rename` first, then an optional
//! `Truncate` (shrink or chunk-size change), then `PutChunk`s by ascending
//! index.

use std::path::PathBuf;

use treesync_core::{
    chunk::chunk_count, ChunkFingerprint, ChunkOp, ChunkStore, CoreError, LocalState, Manifest,
    RelPath,
};

use crate::error::SyncError;

/// An op before its chunk bytes have been read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannedOp {
    Put {
        index: u64,
        fingerprint: ChunkFingerprint,
    },
    Truncate {
        new_size: u64,
    },
    Delete,
    Rename {
        from: RelPath,
    },
}

/// Where the bytes of a planned chunk come from.
pub trait ChunkSource {
    fn read_chunk(&self, index: u64) -> Result<Vec<u8>, CoreError>;
}

/// Chunks of a file on disk.
#[derive(Debug, Clone)]
pub struct FileChunks {
    pub store: ChunkStore,
    pub path: PathBuf,
}

impl ChunkSource for FileChunks {
    fn read_chunk(&self, index: u64) -> Result<Vec<u8>, CoreError> {
        self.store.read_chunk(&self.path, index)
    }
}

/// Chunks of an in-memory buffer.
#[derive(Debug, Clone)]
pub struct MemoryChunks<'a> {
    pub chunk_size: u64,
    pub data: &'a [u8],
}

impl ChunkSource for MemoryChunks<'_> {
    fn read_chunk(&self, index: u64) -> Result<Vec<u8>, CoreError> {
        let len = self.data.len() as u64;
        let start = index.saturating_mul(self.chunk_size).min(len) as usize;
        let end = (start as u64).saturating_add(self.chunk_size).min(len) as usize;
        Ok(self.data[start..end].to_vec())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DiffEngine;

impl DiffEngine {
    pub fn new() -> Self {
        Self
    }

    /// Ops that turn `old` (the receiver's manifest, `None` if absent) into
    /// `new`. Empty when the two already match.
    pub fn plan(&self, old: Option<&Manifest>, new: &LocalState) -> Vec<PlannedOp> {
        let new_count = chunk_count(new.size, new.chunk_size);
        let puts_from = |start: u64| {
            (start..new_count).map(|index| PlannedOp::Put {
                index,
                fingerprint: new.chunks[index as usize],
            })
        };

        let Some(old) = old else {
            if new.size == 0 {
                return vec![PlannedOp::Truncate { new_size: 0 }];
            }
            return puts_from(0).collect();
        };

        if old.chunk_size != new.chunk_size {
            let mut ops = vec![PlannedOp::Truncate { new_size: 0 }];
            ops.extend(puts_from(0));
            return ops;
        }

        let mut ops = Vec::new();
        if new.size < old.size {
            ops.push(PlannedOp::Truncate { new_size: new.size });
        }
        let common = new_count.min(old.chunks.len() as u64);
        for index in 0..common {
            let i = index as usize;
            if old.chunks[i] != new.chunks[i] {
                ops.push(PlannedOp::Put {
                    index,
                    fingerprint: new.chunks[i],
                });
            }
        }
        ops.extend(puts_from(common));
        ops
    }

    /// A rename of `from` followed by whatever content changes separate the
    /// moved manifest from `new`.
    pub fn plan_rename(
        &self,
        from: &RelPath,
        old_from: Option<&Manifest>,
        new: &LocalState,
    ) -> Vec<PlannedOp> {
        let mut ops = vec![PlannedOp::Rename { from: from.clone() }];
        ops.extend(self.plan(old_from, new));
        ops
    }

    /// Read the bytes for every `Put` in `plan`.
    ///
    /// A chunk whose bytes no longer hash to the planned fingerprint fails
    /// with [`SyncError::ChunkRead`]; the caller should rescan and retry.
    pub fn materialize(
        &self,
        path: &RelPath,
        plan: &[PlannedOp],
        source: &dyn ChunkSource,
    ) -> Result<Vec<ChunkOp>, SyncError> {
        plan.iter()
            .map(|op| match op {
                PlannedOp::Put { index, fingerprint } => {
                    let bytes = source.read_chunk(*index).map_err(|source| SyncError::ChunkRead {
                        path: path.clone(),
                        source,
                    })?;
                    if ChunkFingerprint::of(&bytes) != *fingerprint {
                        return Err(SyncError::ChunkRead {
                            path: path.clone(),
                            source: CoreError::ChangedDuringRead {
                                path: PathBuf::from(path.as_str()),
                            },
                        });
                    }
                    Ok(ChunkOp::PutChunk {
                        index: *index,
                        bytes,
                    })
                }
                PlannedOp::Truncate { new_size } => Ok(ChunkOp::Truncate {
                    new_size: *new_size,
                }),
                PlannedOp::Delete => Ok(ChunkOp::Delete),
                PlannedOp::Rename { from } => Ok(ChunkOp::Rename { from: from.clone() }),
            })
            .collect()
    }

    /// [`Self::plan`] followed by [`Self::materialize`].
    pub fn diff(
        &self,
        path: &RelPath,
        old: Option<&Manifest>,
        new: &LocalState,
        source: &dyn ChunkSource,
    ) -> Result<Vec<ChunkOp>, SyncError> {
        let plan = self.plan(old, new);
        self.materialize(path, &plan, source)
    }
}
