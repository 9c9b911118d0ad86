//! Client and server processes, and the TCP wire protocol between them.

mod error;
pub mod paths;
pub mod protocol;
mod runtime;

pub use error::DaemonError;
pub use protocol::{handle_request, Failure, Request, Response, TcpTransport};
pub use runtime::{
    init_tracing, run_client, start_client_blocking, start_server_blocking, ClientOptions, Server,
};
