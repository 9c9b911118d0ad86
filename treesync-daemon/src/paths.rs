use std::time::Duration;

pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_INTERFACE: &str = "localhost:5000";
pub const DEFAULT_SERVER: &str = "localhost:5000";
pub const DEFAULT_STORAGE_DIR: &str = "Storage";

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const IO_TIMEOUT: Duration = Duration::from_secs(30);
/// Pause between `ping`s while the client waits for the server.
pub const SERVER_WAIT_INTERVAL: Duration = Duration::from_secs(1);

/// `host` → `host:5000`; `host:port` and `[v6]:port` pass through.
pub fn with_default_port(address: &str) -> String {
    let has_port = match address.rsplit_once(':') {
        Some((host, port)) => {
            port.parse::<u16>().is_ok() && (!host.contains(':') || host.ends_with(']'))
        }
        None => false,
    };
    if has_port {
        address.to_string()
    } else {
        format!("{address}:{DEFAULT_PORT}")
    }
}
