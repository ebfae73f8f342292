//! Daemon configuration.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::ParseError;

use crate::registry::DEFAULT_MAX_PORTS;

/// Default control socket path.
pub const DEFAULT_SOCKET: &str = "/run/vport/vport.sock";

/// Default number of forwarding worker threads.
pub const DEFAULT_WORKERS: usize = 2;

/// Log filter used when neither `--log-level` nor `RUST_LOG` is set.
///
/// Topology audit events go to their own target and must be listed here too.
pub const DEFAULT_LOG_FILTER: &str = "vport_net=info,vport::audit=info";

/// Hosting environment to create ports in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// Kernel TAP interfaces (needs CAP_NET_ADMIN)
    Tap,
    /// In-process devices
    Loopback,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "vportd")]
#[command(about = "Virtual patch-panel daemon for network interfaces")]
pub struct Config {
    /// Control socket path
    #[arg(short, long, env = "VPORT_SOCKET", default_value = DEFAULT_SOCKET)]
    pub socket: PathBuf,

    /// Maximum number of ports
    #[arg(long, env = "VPORT_MAX_PORTS", default_value_t = DEFAULT_MAX_PORTS)]
    pub max_ports: usize,

    /// Forwarding worker threads
    #[arg(short, long, env = "VPORT_WORKERS", default_value_t = DEFAULT_WORKERS)]
    pub workers: usize,

    /// Hosting environment for ports
    #[arg(short, long, env = "VPORT_BACKEND", value_enum, default_value_t = Backend::Tap)]
    pub backend: Backend,

    /// Log filter directive, overrides RUST_LOG
    #[arg(long, env = "VPORT_LOG")]
    pub log_level: Option<String>,
}

impl Config {
    /// Log filter for the daemon: `--log-level`, else `RUST_LOG`, else
    /// [`DEFAULT_LOG_FILTER`].
    pub fn log_filter(&self) -> Result<EnvFilter, ParseError> {
        match &self.log_level {
            Some(directives) => EnvFilter::try_new(directives),
            None => match EnvFilter::try_from_default_env() {
                Ok(filter) => Ok(filter),
                Err(_) => EnvFilter::try_new(DEFAULT_LOG_FILTER),
            },
        }
    }
}
