//! Daemon configuration: CLI flags (for one-off overrides) layered over a
//! TOML file on disk, the way a long-running daemon is normally configured.

use crate::error::{invalid_config, CoreError};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

fn default_watch_root() -> PathBuf {
    PathBuf::from("./sync")
}
fn default_control_socket() -> PathBuf {
    PathBuf::from("/tmp/sentinel_daemon.sock")
}
fn default_listen_port() -> u16 {
    9443
}
fn default_discovery_port() -> u16 {
    9444
}
fn default_discovery_broadcast() -> SocketAddr {
    "255.255.255.255:9444".parse().unwrap()
}
fn default_max_active_peers() -> usize {
    8
}
fn default_chunk_size() -> usize {
    crate::types::DEFAULT_CHUNK_SIZE
}
fn default_log_dir() -> PathBuf {
    PathBuf::from("./logs")
}
fn default_log_rotation_bytes() -> u64 {
    100 * 1024 * 1024
}
fn default_upload_limit() -> Option<u64> {
    None
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub peer_id: String,
    #[serde(default)]
    pub session_code: String,
    #[serde(default = "default_watch_root")]
    pub watch_root: PathBuf,
    #[serde(default = "default_control_socket")]
    pub control_socket: PathBuf,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    #[serde(default = "default_discovery_broadcast")]
    pub discovery_broadcast: SocketAddr,
    #[serde(default = "default_max_active_peers")]
    pub max_active_peers: usize,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_upload_limit")]
    pub global_upload_limit_bps: Option<u64>,
    #[serde(default = "default_upload_limit")]
    pub global_download_limit_bps: Option<u64>,
    #[serde(default)]
    pub ignore_globs: Vec<String>,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default = "default_log_rotation_bytes")]
    pub log_rotation_bytes: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            peer_id: String::new(),
            session_code: String::new(),
            watch_root: default_watch_root(),
            control_socket: default_control_socket(),
            listen_port: default_listen_port(),
            discovery_port: default_discovery_port(),
            discovery_broadcast: default_discovery_broadcast(),
            max_active_peers: default_max_active_peers(),
            chunk_size: default_chunk_size(),
            global_upload_limit_bps: default_upload_limit(),
            global_download_limit_bps: default_upload_limit(),
            ignore_globs: Vec::new(),
            log_dir: default_log_dir(),
            log_rotation_bytes: default_log_rotation_bytes(),
        }
    }
}

impl DaemonConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, CoreError> {
        toml::from_str(s).map_err(|e| invalid_config(format!("malformed config: {e}")))
    }

    pub fn load_from_file(path: &std::path::Path) -> Result<Self, CoreError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.peer_id.trim().is_empty() {
            return Err(invalid_config("peer_id must not be empty"));
        }
        if !self.watch_root.exists() {
            return Err(invalid_config(format!("watch_root does not exist: {}", self.watch_root.display())));
        }
        if self.max_active_peers == 0 {
            return Err(invalid_config("max_active_peers must be at least 1"));
        }
        Ok(())
    }

    pub fn apply_overrides(&mut self, cli: &CliArgs) {
        if let Some(peer_id) = &cli.peer_id {
            self.peer_id = peer_id.clone();
        }
        if let Some(session_code) = &cli.session_code {
            self.session_code = session_code.clone();
        }
        if let Some(watch_root) = &cli.watch_root {
            self.watch_root = watch_root.clone();
        }
        if let Some(port) = cli.listen_port {
            self.listen_port = port;
        }
        if let Some(socket) = &cli.control_socket {
            self.control_socket = socket.clone();
        }
    }
}

/// Command-line overrides layered on top of the TOML config file.
#[derive(Debug, Parser)]
#[command(name = "sentinelfsd", version, about = "SentinelFS peer-to-peer sync daemon")]
pub struct CliArgs {
    /// Path to a TOML configuration file
    #[arg(short, long, default_value = "./sentinelfs.toml")]
    pub config: PathBuf,

    /// Override this peer's identifier
    #[arg(long)]
    pub peer_id: Option<String>,

    /// Override the shared session code
    #[arg(long)]
    pub session_code: Option<String>,

    /// Override the directory being watched and synchronized
    #[arg(long)]
    pub watch_root: Option<PathBuf>,

    /// Override the TCP port peers connect to
    #[arg(long)]
    pub listen_port: Option<u16>,

    /// Override the control socket path
    #[arg(long)]
    pub control_socket: Option<PathBuf>,

    /// Run in the foreground with verbose logging instead of as a daemon
    #[arg(long)]
    pub foreground: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_populate_every_field() {
        let config = DaemonConfig::default();
        assert_eq!(config.listen_port, 9443);
        assert_eq!(config.chunk_size, crate::types::DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn parses_partial_toml_with_defaults() {
        let toml = r#"
            peer_id = "peer-a"
            session_code = "s3cr3t"
            listen_port = 6000
        "#;
        let config = DaemonConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.peer_id, "peer-a");
        assert_eq!(config.listen_port, 6000);
        assert_eq!(config.max_active_peers, default_max_active_peers());
    }

    #[test]
    fn validate_rejects_empty_peer_id() {
        let mut config = DaemonConfig::default();
        config.watch_root = std::env::temp_dir();
        assert!(config.validate().is_err());
        config.peer_id = "peer-a".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_malformed_toml() {
        assert!(DaemonConfig::from_toml_str("not = [valid").is_err());
    }
}
