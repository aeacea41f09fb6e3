//! Command-line argument parsing.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use holdem_network::{NetworkConfig, NodeIdentity};

/// Peer-to-peer hold'em table node.
#[derive(Parser, Debug, Clone)]
#[command(name = "holdem")]
#[command(about = "Host or join a peer-to-peer hold'em table")]
#[command(version)]
pub struct Cli {
    /// Port to listen on for other players.
    #[arg(short = 'l', long = "listen", default_value_t = 3000)]
    pub port: u16,

    /// Join the table of this player (`host:port` or `<peer-id>@host:port`).
    /// Without it, this node hosts a new table.
    #[arg(short = 'd', long = "dial")]
    pub dial: Option<String>,

    /// Seed for a reproducible peer id. 0 picks a random one.
    #[arg(long, default_value_t = 0)]
    pub seed: u64,

    /// Keep a stable identity in this JSON file, created on first run.
    /// Takes precedence over `--seed`.
    #[arg(long)]
    pub identity: Option<PathBuf>,

    /// Display name of this player.
    #[arg(long, default_value = "player")]
    pub name: String,

    /// JSON network config; flags override its listen port and dial target.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Seconds between ticks broadcast by the host. 0 disables them.
    #[arg(long, default_value_t = 0)]
    pub tick_secs: u64,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Also write daily-rotated log files into this directory.
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
}

impl Cli {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// This node's identity: loaded from (or saved to) `--identity`, else
    /// derived from `--seed`.
    pub fn node_identity(&self) -> NodeIdentity {
        match &self.identity {
            Some(path) => NodeIdentity::load_or_generate(path, self.name.clone()),
            None => NodeIdentity::from_seed(self.name.clone(), self.seed),
        }
    }

    /// Network config from the optional file, with the flags applied on top.
    pub fn network_config(&self) -> NetworkConfig {
        let mut config = match &self.config {
            Some(path) => NetworkConfig::load_or_default(path),
            None => NetworkConfig::default(),
        };
        config.listen_addr = SocketAddr::new(config.listen_addr.ip(), self.port);
        if self.dial.is_some() {
            config.dial_target = self.dial.clone();
        }
        config
    }

    /// Tick interval, if ticks are enabled.
    pub fn tick_interval(&self) -> Option<Duration> {
        (self.tick_secs > 0).then(|| Duration::from_secs(self.tick_secs))
    }
}
