//! `treesync client`: watch a directory and push changes.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use treesync_daemon::paths::DEFAULT_SERVER;
use treesync_daemon::{start_client_blocking, ClientOptions};

use crate::load_config;

#[derive(Args, Debug)]
pub struct ClientArgs {
    /// Directory to synchronise.
    pub directory: PathBuf,

    /// Server host:port.
    #[arg(short, long, default_value = DEFAULT_SERVER)]
    pub server: String,

    /// Only update a file once per this many seconds.
    #[arg(short = 'u', long)]
    pub updatemax: Option<u64>,

    /// Chunk size in bytes.
    #[arg(long)]
    pub chunk_size: Option<u64>,

    /// Seconds between full rescans of the directory.
    #[arg(long)]
    pub scan_interval: Option<u64>,

    /// YAML config file (defaults to ~/.treesync/config.yaml).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl ClientArgs {
    pub fn run(self) -> Result<()> {
        if !self.directory.is_dir() {
            eprintln!("Client: Directory does not exist: {}", self.directory.display());
            std::process::exit(1);
        }

        let mut config = load_config(self.config.as_deref())?;
        if let Some(secs) = self.updatemax {
            config.rate_limit_secs = secs;
        }
        if let Some(bytes) = self.chunk_size {
            config.chunk_size = bytes;
        }
        if let Some(secs) = self.scan_interval {
            config.scan_interval_secs = secs;
        }
        config.validate().context("invalid client settings")?;

        println!(
            "Client: Synchronising {} to {} (update max every {}s)",
            self.directory.display(),
            self.server,
            config.rate_limit_secs
        );
        println!("Client: Waiting for server to start...");
        start_client_blocking(ClientOptions {
            root: self.directory,
            server: self.server,
            config,
        })
        .context("client exited with error")?;
        println!("Client: Terminated by the user");
        Ok(())
    }
}
