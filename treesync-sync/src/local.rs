//! In-process transport: calls a [`Reconciler`] directly, no network.
//!
//! Used by tests and by anything that syncs two trees on the same host.

use std::sync::Arc;

use treesync_core::{Manifest, OpBatch, RelPath, RemoteState};

use crate::error::{ReconcileError, TransportError};
use crate::reconciler::Reconciler;
use crate::transfer::{ApplyResponse, Transport};

#[derive(Debug, Clone)]
pub struct LocalTransport {
    reconciler: Arc<Reconciler>,
}

impl LocalTransport {
    pub fn new(reconciler: Arc<Reconciler>) -> Self {
        Self { reconciler }
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }
}

impl Transport for LocalTransport {
    fn get_manifest(&self, path: &RelPath) -> Result<RemoteState, TransportError> {
        Ok(self.reconciler.get_manifest(path))
    }

    fn apply_ops(&self, batch: &OpBatch) -> Result<ApplyResponse, TransportError> {
        self.reconciler.apply(batch).map_err(|err| match err {
            ReconcileError::InvalidBatch { .. } => TransportError::Remote(err.to_string()),
            other => TransportError::Protocol(other.to_string()),
        })
    }

    fn list_tree(&self) -> Result<Vec<Manifest>, TransportError> {
        Ok(self.reconciler.list_tree())
    }
}
