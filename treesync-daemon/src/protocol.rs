//! Newline-delimited JSON between client and server: one request per line,
//! one response per line.
//!
//! ```text
//! {"cmd":"get_manifest","path":"docs/a.txt"}
//! {"cmd":"apply_ops","batch":{...}}
//! {"cmd":"list_tree"}
//! {"cmd":"ping"}
//! ```
//!
//! Responses are `{"ok":true,"data":...}` or
//! `{"ok":false,"error":"...","failure":"rejected"|"internal"}`; a revision
//! conflict is `{"ok":false,"error":"...","conflict":<current revision>}`.

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use treesync_core::{Manifest, OpBatch, RelPath, RemoteState};
use treesync_sync::{ApplyResponse, ReconcileError, Reconciler, Transport, TransportError};

use crate::paths::{CONNECT_TIMEOUT, IO_TIMEOUT};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Request {
    GetManifest { path: RelPath },
    ApplyOps { batch: OpBatch },
    ListTree,
    Ping,
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::GetManifest { .. } => "get_manifest",
            Request::ApplyOps { .. } => "apply_ops",
            Request::ListTree => "list_tree",
            Request::Ping => "ping",
        }
    }
}

/// Why a request failed, so the client knows whether retrying can help.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Failure {
    /// Malformed request or invalid batch; sending it again will not help.
    Rejected,
    /// Server-side I/O failure.
    Internal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<Failure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict: Option<u64>,
}

impl Response {
    pub fn ok(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
            failure: None,
            conflict: None,
        }
    }

    pub fn failed(failure: Failure, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
            failure: Some(failure),
            conflict: None,
        }
    }

    pub fn conflict(current: u64) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(format!("revision conflict (current {current})")),
            failure: None,
            conflict: Some(current),
        }
    }

    fn data<T: DeserializeOwned>(self) -> Result<T, TransportError> {
        if !self.ok {
            return Err(self.into_error());
        }
        let data = self.data.unwrap_or(Value::Null);
        serde_json::from_value(data).map_err(|e| TransportError::Protocol(format!("bad response payload: {e}")))
    }

    fn into_error(self) -> TransportError {
        let message = self.error.unwrap_or_else(|| "unknown server error".to_string());
        match self.failure {
            Some(Failure::Rejected) => TransportError::Remote(message),
            _ => TransportError::Protocol(message),
        }
    }
}

/// Answer one request against `reconciler`. Blocking.
pub fn handle_request(reconciler: &Reconciler, request: Request) -> Response {
    match request {
        Request::Ping => Response::ok(Value::String("pong".to_string())),
        Request::GetManifest { path } => encode(&reconciler.get_manifest(&path)),
        Request::ListTree => encode(&reconciler.list_tree()),
        Request::ApplyOps { batch } => match reconciler.apply(&batch) {
            Ok(ApplyResponse::Applied { state }) => encode(&state),
            Ok(ApplyResponse::Conflict { current }) => Response::conflict(current),
            Err(err @ ReconcileError::InvalidBatch { .. }) => Response::failed(Failure::Rejected, err.to_string()),
            Err(err) => {
                tracing::error!(path = %batch.path, error = %err, "apply failed");
                Response::failed(Failure::Internal, err.to_string())
            }
        },
    }
}

/// Response to a line that did not parse as a request.
pub fn malformed(err: &serde_json::Error) -> Response {
    Response::failed(Failure::Rejected, format!("malformed request: {err}"))
}

fn encode<T: Serialize>(value: &T) -> Response {
    match serde_json::to_value(value) {
        Ok(data) => Response::ok(data),
        Err(err) => Response::failed(Failure::Internal, err.to_string()),
    }
}

/// Blocking [`Transport`] over TCP. Each request opens its own connection.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    server: String,
}

impl TcpTransport {
    pub fn new(server: impl Into<String>) -> Self {
        Self { server: server.into() }
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn ping(&self) -> Result<(), TransportError> {
        self.send(&Request::Ping)?.data::<Value>().map(|_| ())
    }

    /// Send one request and read one response line.
    pub fn send(&self, request: &Request) -> Result<Response, TransportError> {
        let io = |source| TransportError::Io {
            endpoint: self.server.clone(),
            source,
        };
        let stream = self.connect()?;
        stream.set_read_timeout(Some(IO_TIMEOUT)).map_err(io)?;
        stream.set_write_timeout(Some(IO_TIMEOUT)).map_err(io)?;

        let mut payload = serde_json::to_vec(request)
            .map_err(|e| TransportError::Protocol(format!("cannot encode {}: {e}", request.name())))?;
        payload.push(b'\n');
        let mut writer = &stream;
        writer.write_all(&payload).map_err(io)?;
        writer.flush().map_err(io)?;

        let mut reader = BufReader::new(&stream);
        let mut line = String::new();
        let read = reader.read_line(&mut line).map_err(io)?;
        if read == 0 {
            return Err(TransportError::Protocol(format!(
                "server closed connection before answering {}",
                request.name()
            )));
        }
        serde_json::from_str(line.trim_end())
            .map_err(|e| TransportError::Protocol(format!("malformed response to {}: {e}", request.name())))
    }

    fn connect(&self) -> Result<TcpStream, TransportError> {
        let io = |source| TransportError::Io {
            endpoint: self.server.clone(),
            source,
        };
        let mut last = None;
        for addr in self.server.to_socket_addrs().map_err(io)? {
            match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
                Ok(stream) => return Ok(stream),
                Err(err) => last = Some(err),
            }
        }
        Err(io(last.unwrap_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "address resolved to nothing")
        })))
    }
}

impl Transport for TcpTransport {
    fn get_manifest(&self, path: &RelPath) -> Result<RemoteState, TransportError> {
        self.send(&Request::GetManifest { path: path.clone() })?.data()
    }

    fn apply_ops(&self, batch: &OpBatch) -> Result<ApplyResponse, TransportError> {
        let response = self.send(&Request::ApplyOps { batch: batch.clone() })?;
        if let Some(current) = response.conflict {
            return Ok(ApplyResponse::Conflict { current });
        }
        response.data().map(|state| ApplyResponse::Applied { state })
    }

    fn list_tree(&self) -> Result<Vec<Manifest>, TransportError> {
        self.send(&Request::ListTree)?.data()
    }
}
