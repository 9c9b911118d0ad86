//! `treesync server`: receive changes into a storage directory.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use treesync_daemon::paths::{DEFAULT_INTERFACE, DEFAULT_STORAGE_DIR};
use treesync_daemon::start_server_blocking;

use crate::load_config;

#[derive(Args, Debug)]
pub struct ServerArgs {
    /// Storage directory.
    #[arg(default_value = DEFAULT_STORAGE_DIR)]
    pub directory: PathBuf,

    /// Interface to bind to, host[:port].
    #[arg(short, long, default_value = DEFAULT_INTERFACE)]
    pub interface: String,

    /// YAML config file (defaults to ~/.treesync/config.yaml).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl ServerArgs {
    pub fn run(self) -> Result<()> {
        // The server has no tunables of its own; reject a broken shared file early.
        load_config(self.config.as_deref())?;

        if !self.directory.exists() {
            println!("Server: Creating directory: {}", self.directory.display());
            fs::create_dir_all(&self.directory)
                .with_context(|| format!("Server: Creating directory failed: {}", self.directory.display()))?;
        }
        println!(
            "Server: Serving {} on {}",
            self.directory.display(),
            self.interface
        );
        start_server_blocking(&self.directory, &self.interface).context("server exited with error")?;
        println!("Server: Terminated by the user");
        Ok(())
    }
}
