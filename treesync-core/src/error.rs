//! Error types for treesync-core.

use std::path::PathBuf;

use thiserror::Error;

/// All errors that can arise from core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML serialization error (config save path).
    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// YAML parse error on load: includes file path and line context from serde_yaml.
    #[error("failed to parse config at {path}: {source}")]
    ParseConfig {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// A path that cannot be used as a synchronized relative path.
    #[error("invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: &'static str },

    #[error("invalid chunk fingerprint: {0}")]
    InvalidFingerprint(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// `dirs::home_dir()` returned `None`: cannot locate `~/.treesync/`.
    #[error("cannot determine home directory; set $HOME or equivalent")]
    HomeNotFound,

    /// The file grew, shrank or vanished while its chunks were being read.
    #[error("{path} changed while it was being read")]
    ChangedDuringRead { path: PathBuf },
}

/// Convenience constructor for [`CoreError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> CoreError {
    CoreError::Io {
        path: path.into(),
        source,
    }
}

impl CoreError {
    /// True when the error means the file is gone or mid-rewrite rather than
    /// unreadable for good.
    pub fn is_vanished(&self) -> bool {
        match self {
            CoreError::ChangedDuringRead { .. } => true,
            CoreError::Io { source, .. } => source.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}
