//! treesync: mirror a directory tree to a remote server.
//!
//! # Usage
//!
//! ```text
//! treesync client [-s host:port] [-u secs] [--chunk-size bytes] [--scan-interval secs] [--config path] <directory>
//! treesync server [-i host[:port]] [--config path] [directory]
//! ```

mod commands;

use std::path::Path;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use commands::{client::ClientArgs, server::ServerArgs};
use treesync_core::{config, CoreError, SyncConfig};

#[derive(Parser, Debug)]
#[command(
    name = "treesync",
    version,
    about = "Keep a remote copy of a directory tree in sync",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch a directory and push its changes to a server.
    Client(ClientArgs),

    /// Receive changes into a storage directory.
    Server(ServerArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Client(args) => args.run(),
        Commands::Server(args) => args.run(),
    }
}

/// `--config` if given, else `~/.treesync/config.yaml` when a home exists.
pub(crate) fn load_config(explicit: Option<&Path>) -> Result<SyncConfig> {
    match explicit {
        Some(path) => config::load_from(path)
            .with_context(|| format!("failed to load config {}", path.display())),
        None => match config::load() {
            Err(CoreError::HomeNotFound) => Ok(SyncConfig::default()),
            other => other.context("failed to load ~/.treesync/config.yaml"),
        },
    }
}
