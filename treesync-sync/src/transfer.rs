//! Transfer of op batches to the receiving side.
//!
//! [`Transport`] is the seam between the sync engine and the wire: the
//! daemon crate provides a TCP implementation, [`crate::LocalTransport`]
//! calls a [`crate::Reconciler`] in process. [`TransferClient`] wraps a
//! transport with bounded exponential-backoff retry and turns a conflict
//! response into [`TransferError::Conflict`].
//!
//! All calls are blocking; async callers run them under `spawn_blocking`.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use treesync_core::{Manifest, OpBatch, RelPath, RemoteState, RetryConfig};

use crate::error::{TransferError, TransportError};

/// Receiver's answer to an `apply_ops` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ApplyResponse {
    /// The batch was committed; `state` is the path's new state (a tombstone
    /// for a delete).
    Applied { state: RemoteState },
    /// The precondition did not hold; nothing was mutated.
    Conflict { current: u64 },
}

pub trait Transport: Send + Sync {
    fn get_manifest(&self, path: &RelPath) -> Result<RemoteState, TransportError>;

    fn apply_ops(&self, batch: &OpBatch) -> Result<ApplyResponse, TransportError>;

    fn list_tree(&self) -> Result<Vec<Manifest>, TransportError>;
}

impl TransportError {
    /// Network and framing failures may succeed on retry; a rejected batch
    /// will not.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TransportError::Remote(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// No retries, no waiting.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (0-based): doubles each time,
    /// capped at `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

#[derive(Clone)]
pub struct TransferClient {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
}

impl std::fmt::Debug for TransferClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferClient")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl TransferClient {
    pub fn new(transport: Arc<dyn Transport>, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Send `batch`; `Ok` carries the committed state.
    pub fn apply(&self, batch: &OpBatch) -> Result<RemoteState, TransferError> {
        let operation = format!("apply_ops {}", batch.path);
        match self.with_retry(&operation, || self.transport.apply_ops(batch))? {
            ApplyResponse::Applied { state } => Ok(state),
            ApplyResponse::Conflict { current } => Err(TransferError::Conflict {
                path: batch.precondition_path().clone(),
                expected: batch.revision,
                current,
            }),
        }
    }

    pub fn fetch_manifest(&self, path: &RelPath) -> Result<RemoteState, TransferError> {
        let operation = format!("get_manifest {path}");
        self.with_retry(&operation, || self.transport.get_manifest(path))
    }

    pub fn list_tree(&self) -> Result<Vec<Manifest>, TransferError> {
        self.with_retry("list_tree", || self.transport.list_tree())
    }

    fn with_retry<T>(
        &self,
        operation: &str,
        mut call: impl FnMut() -> Result<T, TransportError>,
    ) -> Result<T, TransferError> {
        let mut attempt = 0u32;
        loop {
            match call() {
                Ok(value) => {
                    if attempt > 0 {
                        tracing::info!(operation, attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if err.is_retryable() && attempt < self.policy.max_retries => {
                    let delay = self.policy.backoff(attempt);
                    tracing::warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transport error, retrying"
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(err) => {
                    return Err(TransferError::Transport {
                        operation: operation.to_string(),
                        attempts: attempt + 1,
                        source: err,
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    impl Transport for Flaky {
        fn get_manifest(&self, path: &RelPath) -> Result<RemoteState, TransportError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(TransportError::Protocol("connection reset".into()));
            }
            Ok(RemoteState::Absent {
                path: path.clone(),
                revision: 0,
            })
        }

        fn apply_ops(&self, _batch: &OpBatch) -> Result<ApplyResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(TransportError::Remote("hole in chunk indices".into()))
        }

        fn list_tree(&self) -> Result<Vec<Manifest>, TransportError> {
            Ok(Vec::new())
        }
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 10,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(1),
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(200));
        assert_eq!(policy.backoff(1), Duration::from_millis(400));
        assert_eq!(policy.backoff(2), Duration::from_millis(800));
        assert_eq!(policy.backoff(3), Duration::from_secs(1));
        assert_eq!(policy.backoff(40), Duration::from_secs(1));
    }

    #[test]
    fn transient_failures_are_retried() {
        let transport = Arc::new(Flaky {
            failures: 2,
            calls: AtomicU32::new(0),
        });
        let client = TransferClient::new(transport.clone(), fast_policy(3));
        let state = client
            .fetch_manifest(&RelPath::new("a").expect("path"))
            .expect("fetch");
        assert_eq!(state.revision(), 0);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn retries_are_bounded() {
        let transport = Arc::new(Flaky {
            failures: 10,
            calls: AtomicU32::new(0),
        });
        let client = TransferClient::new(transport.clone(), fast_policy(2));
        let err = client
            .fetch_manifest(&RelPath::new("a").expect("path"))
            .unwrap_err();
        assert!(
            matches!(err, TransferError::Transport { attempts: 3, .. }),
            "got: {err}"
        );
    }

    #[test]
    fn rejected_batch_is_not_retried() {
        let transport = Arc::new(Flaky {
            failures: 0,
            calls: AtomicU32::new(0),
        });
        let client = TransferClient::new(transport.clone(), fast_policy(5));
        let batch = OpBatch {
            path: RelPath::new("a").expect("path"),
            revision: 0,
            chunk_size: 4,
            mtime: chrono::Utc::now(),
            ops: Vec::new(),
        };
        assert!(client.apply(&batch).is_err());
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn only_rejections_are_final() {
        let io = TransportError::Io {
            endpoint: "localhost:5000".into(),
            source: std::io::Error::from(std::io::ErrorKind::ConnectionReset),
        };
        assert!(io.is_retryable());
        assert!(TransportError::Protocol("truncated line".into()).is_retryable());
        assert!(!TransportError::Remote("chunk 3 has length 0".into()).is_retryable());
    }
}
