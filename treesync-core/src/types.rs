//! Domain types for treesync.
//!
//! Paths that cross the wire or key a store are always [`RelPath`]; host
//! `PathBuf`s only appear at the filesystem boundary via [`RelPath::from_fs`]
//! and [`RelPath::to_fs`]. All types are serializable via serde + serde_json.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::error::CoreError;

/// Directory (relative to a synchronized root) holding treesync metadata.
pub const METADATA_DIR: &str = ".treesync";

/// Suffix of the staging file a receiver writes before committing.
pub const STAGE_SUFFIX: &str = ".treesync-stage";

// ---------------------------------------------------------------------------
// RelPath
// ---------------------------------------------------------------------------

/// A relative, slash-normalized path; the unique key of a file within a tree.
///
/// Comparison is case-sensitive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RelPath(String);

impl RelPath {
    /// Normalize `raw` into a relative path.
    ///
    /// Backslashes become `/`. Leading `/`, `./` and empty segments are
    /// dropped. `..` segments and paths with no segments left are rejected.
    pub fn new(raw: impl AsRef<str>) -> Result<Self, CoreError> {
        let raw = raw.as_ref();
        let mut segments = Vec::new();
        for segment in raw.split(['/', '\\']) {
            match segment {
                "" | "." => continue,
                ".." => {
                    return Err(CoreError::InvalidPath {
                        path: raw.to_string(),
                        reason: "parent directory segments are not allowed",
                    })
                }
                other => segments.push(other),
            }
        }
        if segments.is_empty() {
            return Err(CoreError::InvalidPath {
                path: raw.to_string(),
                reason: "path is empty",
            });
        }
        Ok(Self(segments.join("/")))
    }

    /// Express the host path `path` relative to `root`.
    pub fn from_fs(root: &Path, path: &Path) -> Result<Self, CoreError> {
        let invalid = |reason| CoreError::InvalidPath {
            path: path.display().to_string(),
            reason,
        };
        let relative = path
            .strip_prefix(root)
            .map_err(|_| invalid("path is outside the synchronized root"))?;
        let mut segments = Vec::new();
        for component in relative.components() {
            match component {
                Component::Normal(name) => {
                    let name = name.to_str().ok_or_else(|| invalid("path is not valid UTF-8"))?;
                    segments.push(name);
                }
                Component::CurDir => continue,
                _ => return Err(invalid("path is not a plain relative path")),
            }
        }
        Self::new(segments.join("/"))
    }

    /// Host path of this entry beneath `root`.
    pub fn to_fs(&self, root: &Path) -> PathBuf {
        let mut path = root.to_path_buf();
        for segment in self.segments() {
            path.push(segment);
        }
        path
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }

    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// Parent directory, or `None` for a top-level entry.
    pub fn parent(&self) -> Option<RelPath> {
        self.0
            .rsplit_once('/')
            .map(|(parent, _)| RelPath(parent.to_string()))
    }

    /// True if `self` is `prefix` or lies beneath it (segment-wise).
    pub fn starts_with(&self, prefix: &RelPath) -> bool {
        self.0 == prefix.0
            || (self.0.starts_with(&prefix.0) && self.0.as_bytes().get(prefix.0.len()) == Some(&b'/'))
    }

    /// Move `self` from beneath `from` to beneath `to`.
    ///
    /// Returns `None` if `self` does not lie beneath `from`.
    pub fn rebase(&self, from: &RelPath, to: &RelPath) -> Option<RelPath> {
        if self == from {
            return Some(to.clone());
        }
        if !self.starts_with(from) {
            return None;
        }
        let rest = &self.0[from.0.len() + 1..];
        Some(RelPath(format!("{}/{}", to.0, rest)))
    }

    /// Metadata and staging entries are never synchronized.
    pub fn is_reserved(&self) -> bool {
        self.segments().next() == Some(METADATA_DIR) || self.file_name().ends_with(STAGE_SUFFIX)
    }
}

impl fmt::Display for RelPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl TryFrom<String> for RelPath {
    type Error = CoreError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl TryFrom<&str> for RelPath {
    type Error = CoreError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<RelPath> for String {
    fn from(p: RelPath) -> Self {
        p.0
    }
}

// ---------------------------------------------------------------------------
// ChunkFingerprint
// ---------------------------------------------------------------------------

/// SHA-256 digest of one chunk's bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkFingerprint([u8; 32]);

impl ChunkFingerprint {
    pub fn of(data: &[u8]) -> Self {
        let mut h = Sha256::new();
        h.update(data);
        Self(h.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, CoreError> {
        let bytes = hex::decode(s).map_err(|e| CoreError::InvalidFingerprint(e.to_string()))?;
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CoreError::InvalidFingerprint(format!("expected 32 bytes: {s}")))?;
        Ok(Self(array))
    }
}

impl fmt::Debug for ChunkFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "ChunkFingerprint({})", &hex[..16])
    }
}

impl fmt::Display for ChunkFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        f.write_str(&hex[..16])
    }
}

impl Serialize for ChunkFingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ChunkFingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Local state and manifests
// ---------------------------------------------------------------------------

/// What a file on disk looks like right now, chunked with `chunk_size`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalState {
    pub size: u64,
    pub mtime: DateTime<Utc>,
    pub chunk_size: u64,
    pub chunks: Vec<ChunkFingerprint>,
}

/// What a path holds on the receiver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    #[default]
    File,
    Directory,
}

/// Per-path metadata snapshot used to compute diffs.
///
/// A directory manifest has no content: `size` is 0 and `chunks` is empty.
///
/// Invariants: `chunks.len() == ceil(size / chunk_size)`, and since every
/// chunk but the last is exactly `chunk_size` bytes, the chunk sizes sum to
/// `size`. `revision` strictly increases on every committed mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub path: RelPath,
    #[serde(default)]
    pub kind: EntryKind,
    pub size: u64,
    pub revision: u64,
    pub chunk_size: u64,
    pub chunks: Vec<ChunkFingerprint>,
    pub mtime: DateTime<Utc>,
}

impl Manifest {
    pub fn from_local(path: RelPath, state: &LocalState, revision: u64) -> Self {
        Self {
            path,
            kind: EntryKind::File,
            size: state.size,
            revision,
            chunk_size: state.chunk_size,
            chunks: state.chunks.clone(),
            mtime: state.mtime,
        }
    }

    pub fn directory(path: RelPath, revision: u64, chunk_size: u64, mtime: DateTime<Utc>) -> Self {
        Self {
            path,
            kind: EntryKind::Directory,
            size: 0,
            revision,
            chunk_size,
            chunks: Vec::new(),
            mtime,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    pub fn is_consistent(&self) -> bool {
        self.chunk_size > 0
            && self.chunks.len() as u64 == crate::chunk::chunk_count(self.size, self.chunk_size)
    }

    /// Same size, chunking and fingerprints as `other`; revision and mtime
    /// are ignored.
    pub fn same_content(&self, other: &Manifest) -> bool {
        self.kind == other.kind
            && self.size == other.size && self.chunk_size == other.chunk_size && self.chunks == other.chunks
    }

    /// Same bytes as `state`, with overwhelming probability.
    pub fn content_matches(&self, state: &LocalState) -> bool {
        !self.is_dir()
            && self.size == state.size && self.chunk_size == state.chunk_size && self.chunks == state.chunks
    }

    pub fn local_state(&self) -> LocalState {
        LocalState {
            size: self.size,
            mtime: self.mtime,
            chunk_size: self.chunk_size,
            chunks: self.chunks.clone(),
        }
    }
}

/// A receiver's view of one path: present with a manifest, or absent with
/// the last revision it ever had (0 if it never existed).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RemoteState {
    Present { manifest: Manifest },
    Absent { path: RelPath, revision: u64 },
}

impl RemoteState {
    pub fn revision(&self) -> u64 {
        match self {
            RemoteState::Present { manifest } => manifest.revision,
            RemoteState::Absent { revision, .. } => *revision,
        }
    }

    pub fn manifest(&self) -> Option<&Manifest> {
        match self {
            RemoteState::Present { manifest } => Some(manifest),
            RemoteState::Absent { .. } => None,
        }
    }

    pub fn into_manifest(self) -> Option<Manifest> {
        match self {
            RemoteState::Present { manifest } => Some(manifest),
            RemoteState::Absent { .. } => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Change events
// ---------------------------------------------------------------------------

/// Kind of a detected change. The two rename halves share a correlation id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
    RenamedFrom { correlation: u64 },
    RenamedTo { correlation: u64 },
}

/// One canonical change intent for one path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub path: RelPath,
    #[serde(flatten)]
    pub kind: ChangeKind,
    pub observed_at: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(path: RelPath, kind: ChangeKind) -> Self {
        Self {
            path,
            kind,
            observed_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Chunk operations
// ---------------------------------------------------------------------------

/// One structural or content mutation of a path on the receiver.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ChunkOp {
    PutChunk {
        index: u64,
        #[serde(with = "hex_bytes")]
        bytes: Vec<u8>,
    },
    Truncate {
        new_size: u64,
    },
    Delete,
    Rename {
        from: RelPath,
    },
    /// Create `path` as a directory. Only valid as the sole op of a batch.
    MakeDir,
}

impl fmt::Debug for ChunkOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkOp::PutChunk { index, bytes } => f
                .debug_struct("PutChunk")
                .field("index", index)
                .field("len", &bytes.len())
                .finish(),
            ChunkOp::Truncate { new_size } => {
                f.debug_struct("Truncate").field("new_size", new_size).finish()
            }
            ChunkOp::Delete => f.write_str("Delete"),
            ChunkOp::MakeDir => f.write_str("MakeDir"),
            ChunkOp::Rename { from } => f.debug_struct("Rename").field("from", from).finish(),
        }
    }
}

/// All ops for one path, sent and applied as a single logical unit.
///
/// `revision` is the precondition: the receiver's current revision of the
/// rename source (when the first op is `Rename`) or of `path` otherwise.
/// `mtime` is the sender's modification time for the resulting file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpBatch {
    pub path: RelPath,
    pub revision: u64,
    pub chunk_size: u64,
    pub mtime: DateTime<Utc>,
    pub ops: Vec<ChunkOp>,
}

impl OpBatch {
    pub fn rename_source(&self) -> Option<&RelPath> {
        match self.ops.first() {
            Some(ChunkOp::Rename { from }) => Some(from),
            _ => None,
        }
    }

    /// Path whose revision the precondition is checked against.
    pub fn precondition_path(&self) -> &RelPath {
        self.rename_source().unwrap_or(&self.path)
    }

    pub fn is_delete(&self) -> bool {
        self.ops.iter().any(|op| matches!(op, ChunkOp::Delete))
    }

    pub fn is_make_dir(&self) -> bool {
        self.ops.iter().any(|op| matches!(op, ChunkOp::MakeDir))
    }

    pub fn put_count(&self) -> usize {
        self.ops
            .iter()
            .filter(|op| matches!(op, ChunkOp::PutChunk { .. }))
            .count()
    }

    pub fn payload_bytes(&self) -> u64 {
        self.ops
            .iter()
            .map(|op| match op {
                ChunkOp::PutChunk { bytes, .. } => bytes.len() as u64,
                _ => 0,
            })
            .sum()
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
