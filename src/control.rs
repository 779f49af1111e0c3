//! Control socket: a UNIX domain stream listener the CLI front-end talks to
//! over newline-delimited text commands.

use crate::error::{daemon_not_running, invalid_config, CoreError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Status,
    Peers,
    Logs(usize),
    Config,
    Pause,
    Resume,
    Stats,
}

pub fn parse_command(line: &str) -> Result<ControlCommand, CoreError> {
    let line = line.trim();
    let mut parts = line.splitn(2, '|');
    let head = parts.next().unwrap_or("").to_ascii_uppercase();
    match head.as_str() {
        "STATUS" => Ok(ControlCommand::Status),
        "PEERS" => Ok(ControlCommand::Peers),
        "CONFIG" => Ok(ControlCommand::Config),
        "PAUSE" => Ok(ControlCommand::Pause),
        "RESUME" => Ok(ControlCommand::Resume),
        "STATS" => Ok(ControlCommand::Stats),
        "LOGS" => {
            let n: usize = parts
                .next()
                .ok_or_else(|| invalid_config("LOGS requires a line count, e.g. LOGS|100"))?
                .trim()
                .parse()
                .map_err(|_| invalid_config("LOGS line count must be a non-negative integer"))?;
            Ok(ControlCommand::Logs(n))
        }
        "" => Err(invalid_config("empty command")),
        other => Err(invalid_config(format!("unrecognized command: {other}"))),
    }
}

/// Daemon-side state the control socket reports on and mutates. Implemented
/// by the orchestrator once all collaborators are wired up.
#[async_trait]
pub trait DaemonStatus: Send + Sync {
    async fn uptime_secs(&self) -> u64;
    async fn sync_enabled(&self) -> bool;
    async fn set_sync_enabled(&self, enabled: bool);
    async fn active_peer_count(&self) -> usize;
    async fn peer_lines(&self) -> Vec<String>;
    async fn recent_logs(&self, n: usize) -> Vec<String>;
    async fn config_dump(&self) -> String;
    async fn stats_dump(&self) -> String;
}

pub struct ControlServer<D: DaemonStatus + 'static> {
    socket_path: PathBuf,
    daemon: std::sync::Arc<D>,
}

impl<D: DaemonStatus + 'static> ControlServer<D> {
    pub fn new(socket_path: impl Into<PathBuf>, daemon: std::sync::Arc<D>) -> Self {
        Self { socket_path: socket_path.into(), daemon }
    }

    pub async fn serve(&self) -> Result<(), CoreError> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).map_err(CoreError::from)?;
        }
        let listener = UnixListener::bind(&self.socket_path)
            .map_err(|e| daemon_not_running(format!("cannot bind control socket: {e}")))?;
        info!(path = %self.socket_path.display(), "control socket listening");

        loop {
            let (stream, _addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "control socket accept failed");
                    continue;
                }
            };
            let daemon = std::sync::Arc::clone(&self.daemon);
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, daemon.as_ref()).await {
                    debug!(error = %e, "control connection ended with error");
                }
            });
        }
    }
}

async fn handle_connection(stream: UnixStream, daemon: &dyn DaemonStatus) -> Result<(), CoreError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    if let Some(line) = lines.next_line().await.map_err(CoreError::from)? {
        let response = match parse_command(&line) {
            Ok(cmd) => dispatch(cmd, daemon).await,
            Err(e) => format!("ERROR {e}\n"),
        };
        writer.write_all(response.as_bytes()).await.map_err(CoreError::from)?;
    }
    Ok(())
}

async fn dispatch(cmd: ControlCommand, daemon: &dyn DaemonStatus) -> String {
    match cmd {
        ControlCommand::Status => format!(
            "uptime={} sync_enabled={} active_peers={}\n",
            daemon.uptime_secs().await,
            daemon.sync_enabled().await,
            daemon.active_peer_count().await
        ),
        ControlCommand::Peers => {
            let lines = daemon.peer_lines().await;
            if lines.is_empty() {
                "\n".to_string()
            } else {
                format!("{}\n", lines.join("\n"))
            }
        }
        ControlCommand::Logs(n) => {
            let lines = daemon.recent_logs(n).await;
            format!("{}\n", lines.join("\n"))
        }
        ControlCommand::Config => format!("{}\n", daemon.config_dump().await),
        ControlCommand::Pause => {
            daemon.set_sync_enabled(false).await;
            "OK paused\n".to_string()
        }
        ControlCommand::Resume => {
            daemon.set_sync_enabled(true).await;
            "OK resumed\n".to_string()
        }
        ControlCommand::Stats => format!("{}\n", daemon.stats_dump().await),
    }
}

/// CLI-side helper: send a single command and return the daemon's response,
/// or an error if the socket is unreachable. Mirrors the exit-code contract
/// (`Ok` → 0, `Err` → 1) the CLI front-end applies.
pub async fn send_command(socket_path: &Path, command: &str) -> Result<String, CoreError> {
    let mut stream = UnixStream::connect(socket_path)
        .await
        .map_err(|e| daemon_not_running(format!("cannot reach control socket: {e}")))?;
    stream.write_all(command.as_bytes()).await.map_err(CoreError::from)?;
    stream.write_all(b"\n").await.map_err(CoreError::from)?;
    stream.shutdown().await.map_err(CoreError::from)?;

    let mut reader = BufReader::new(stream);
    let mut response = String::new();
    reader.read_line(&mut response).await.map_err(CoreError::from)?;
    Ok(response.trim_end().to_string())
}
