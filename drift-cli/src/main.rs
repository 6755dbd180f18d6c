//! # driftsync
//!
//! Peer-to-peer directory synchronizer.
//!
//! ## Commands
//!
//! - `serve`: run a node from a configuration file
//! - `init-config`: write a commented default configuration
//!
//! ## Example
//!
//! ```bash
//! driftsync init-config
//! # edit driftsync.toml: share_dir, port, peers
//! driftsync serve --config driftsync.toml
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use drift_peer::{Config, SyncNode};

/// Peer-to-peer directory synchronizer.
#[derive(Parser, Debug)]
#[command(name = "driftsync")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a sync node until interrupted
    Serve {
        /// Path to the TOML configuration file
        #[arg(long, short, default_value = "driftsync.toml")]
        config: PathBuf,
    },

    /// Write a commented default configuration file
    InitConfig {
        /// Where to write the configuration
        #[arg(default_value = "driftsync.toml")]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { config } => {
            let config = Config::from_file(&config)
                .with_context(|| format!("failed to load {}", config.display()))?;
            let node = SyncNode::start(config)
                .await
                .context("failed to start node")?;
            tokio::signal::ctrl_c()
                .await
                .context("failed to wait for ctrl-c")?;
            node.stop();
        }
        Commands::InitConfig { path } => {
            anyhow::ensure!(
                !path.exists(),
                "{} already exists, refusing to overwrite",
                path.display()
            );
            std::fs::write(&path, DEFAULT_CONFIG)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("wrote {}", path.display());
        }
    }
    Ok(())
}

const DEFAULT_CONFIG: &str = r#"# driftsync node configuration

[node]
# Transport: "tcp" (persistent connections) or "udp" (datagrams with retry).
mode = "tcp"
# Port to listen on. 0 picks an ephemeral port.
port = 8111
# Hostname other peers should use to reach this node.
advertised_host = "localhost"
# Optional friendly name shown in peer logs.
# advertised_name = "office-nas"
# Directory to synchronize.
share_dir = "share"
# Peers to connect to at startup.
peers = []

[sync]
# Maximum bytes per chunk request/response.
block_size = 8192
# Seconds between filesystem scans.
scan_interval_secs = 1
# Seconds between outbound connection retry sweeps.
connect_interval_secs = 10

[limits]
# Maximum concurrent inbound peers; excess connections are refused.
max_inbound_peers = 10

[udp]
# Milliseconds between resends of an unacknowledged request.
retry_interval_millis = 1000
# Resend attempts before a silent peer's session is closed.
max_retries = 5
# Maximum datagram payload in bytes.
max_payload = 16384
"#;
