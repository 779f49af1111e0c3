//! SentinelFS daemon entry point: loads configuration, starts the control
//! socket, the discovery beacon, and the background maintenance tasks for
//! the session, health, bandwidth and offline-queue subsystems.
//!
//! The network transport, on-disk store, and OS file watcher are pluggable
//! collaborators (`sentinelfs::orchestrator`) supplied by the deployment;
//! this binary wires the parts that are this crate's concern.

use clap::Parser;
use parking_lot::Mutex;
use sentinelfs::bandwidth::BandwidthManager;
use sentinelfs::config::{CliArgs, DaemonConfig};
use sentinelfs::control::{ControlServer, DaemonStatus};
use sentinelfs::discovery::DiscoveryService;
use sentinelfs::event_hub::EventHub;
use sentinelfs::health::HealthMonitor;
use sentinelfs::offline_queue::OfflineQueue;
use sentinelfs::session::SessionManager;
use sentinelfs::types::PeerRecord;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

const LOG_BUFFER_CAPACITY: usize = 2000;

struct LogBuffer {
    lines: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl LogBuffer {
    fn new(capacity: usize) -> Self {
        Self { lines: Mutex::new(VecDeque::with_capacity(capacity)), capacity }
    }

    fn push_line(&self, line: &str) {
        let mut lines = self.lines.lock();
        if lines.len() >= self.capacity {
            lines.pop_front();
        }
        lines.push_back(line.to_string());
    }

    fn recent(&self, n: usize) -> Vec<String> {
        let lines = self.lines.lock();
        let skip = lines.len().saturating_sub(n);
        lines.iter().skip(skip).cloned().collect()
    }
}

/// Mirrors every write both to stdout (for foreground/journal consumption)
/// and into the in-memory ring buffer the `LOGS|N` control command reads.
#[derive(Clone)]
struct TeeWriter {
    buffer: Arc<LogBuffer>,
}

impl io::Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::Write::write_all(&mut io::stdout(), buf)?;
        for line in String::from_utf8_lossy(buf).lines() {
            if !line.is_empty() {
                self.buffer.push_line(line);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::Write::flush(&mut io::stdout())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for TeeWriter {
    type Writer = TeeWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

struct Daemon {
    start: Instant,
    sync_enabled: AtomicBool,
    config: DaemonConfig,
    health: Arc<HealthMonitor>,
    bandwidth: Arc<BandwidthManager>,
    offline_queue: Arc<OfflineQueue>,
    logs: Arc<LogBuffer>,
    peers: Mutex<HashMap<String, PeerRecord>>,
}

#[async_trait::async_trait]
impl DaemonStatus for Daemon {
    async fn uptime_secs(&self) -> u64 {
        self.start.elapsed().as_secs()
    }

    async fn sync_enabled(&self) -> bool {
        self.sync_enabled.load(Ordering::SeqCst)
    }

    async fn set_sync_enabled(&self, enabled: bool) {
        self.sync_enabled.store(enabled, Ordering::SeqCst);
    }

    async fn active_peer_count(&self) -> usize {
        self.peers.lock().values().filter(|p| p.authenticated).count()
    }

    async fn peer_lines(&self) -> Vec<String> {
        self.peers
            .lock()
            .values()
            .map(|p| format!("{} {} {} {} {}", p.peer_id, p.address, p.port, p.last_seen, p.authenticated))
            .collect()
    }

    async fn recent_logs(&self, n: usize) -> Vec<String> {
        self.logs.recent(n)
    }

    async fn config_dump(&self) -> String {
        toml::to_string_pretty(&self.config).unwrap_or_else(|e| format!("<unserializable config: {e}>"))
    }

    async fn stats_dump(&self) -> String {
        let (upload, download) = self.bandwidth.global_stats();
        format!(
            "upload_bytes={} upload_wait_ms={} download_bytes={} download_wait_ms={} offline_queue_depth={}",
            upload.total_bytes_transferred,
            upload.total_wait_time_ms,
            download.total_bytes_transferred,
            download.total_wait_time_ms,
            self.offline_queue.pending_count()
        )
    }
}

fn load_config(cli: &CliArgs) -> DaemonConfig {
    let mut config = match DaemonConfig::load_from_file(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            warn!(path = %cli.config.display(), error = %e, "using default configuration");
            DaemonConfig::default()
        }
    };
    config.apply_overrides(cli);
    if config.peer_id.is_empty() {
        config.peer_id = format!("peer-{:08x}", rand::random::<u32>());
    }
    config
}

#[tokio::main]
async fn main() {
    let cli = CliArgs::parse();
    let config = load_config(&cli);

    let logs = Arc::new(LogBuffer::new(LOG_BUFFER_CAPACITY));
    let writer = TeeWriter { buffer: Arc::clone(&logs) };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(writer)
        .init();

    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "invalid configuration, exiting");
        std::process::exit(1);
    }

    info!(peer_id = %config.peer_id, watch_root = %config.watch_root.display(), "starting sentinelfs daemon");

    let session = Arc::new(SessionManager::new(config.peer_id.clone(), config.session_code.clone()));
    let health = Arc::new(HealthMonitor::new());
    let bandwidth = Arc::new(BandwidthManager::new(
        config.global_upload_limit_bps.map(|v| v as f64).unwrap_or(0.0),
        config.global_download_limit_bps.map(|v| v as f64).unwrap_or(0.0),
    ));
    let offline_queue = Arc::new(OfflineQueue::new());
    let event_hub = Arc::new(EventHub::new());
    let _ = &session;
    let _ = &event_hub;

    let daemon = Arc::new(Daemon {
        start: Instant::now(),
        sync_enabled: AtomicBool::new(true),
        config: config.clone(),
        health: Arc::clone(&health),
        bandwidth: Arc::clone(&bandwidth),
        offline_queue: Arc::clone(&offline_queue),
        logs,
        peers: Mutex::new(HashMap::new()),
    });

    let control_server = ControlServer::new(config.control_socket.clone(), Arc::clone(&daemon));
    tokio::spawn(async move {
        if let Err(e) = control_server.serve().await {
            tracing::error!(error = %e, "control socket server exited");
        }
    });

    if let Ok(discovery) = DiscoveryService::bind(
        config.discovery_port,
        config.discovery_broadcast,
        config.peer_id.clone(),
        config.listen_port,
    )
    .await
    {
        let discovery = Arc::new(discovery);
        let announcer = Arc::clone(&discovery);
        tokio::spawn(async move {
            loop {
                if let Err(e) = announcer.announce().await {
                    warn!(error = %e, "discovery announce failed");
                }
                tokio::time::sleep(std::time::Duration::from_secs(30)).await;
            }
        });

        let listener_daemon = Arc::clone(&daemon);
        tokio::spawn(async move {
            loop {
                match discovery.recv_one().await {
                    Ok(Some((announcement, from))) => {
                        let mut record = PeerRecord::new(announcement.peer_id.clone(), from.ip().to_string(), announcement.tcp_port);
                        record.touch();
                        listener_daemon.peers.lock().insert(announcement.peer_id, record);
                    }
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "discovery receive failed"),
                }
            }
        });
    } else {
        warn!("discovery service failed to bind, continuing without peer discovery");
    }

    tokio::signal::ctrl_c().await.ok();
    info!("shutdown signal received");
}
