//! Daemon Server Implementation
//!
//! Wires the background context to the real world and runs it until shutdown:
//! - WebSocket connector for the chat service
//! - Credentials from the environment, login probe over HTTP
//! - Unix-socket bridge for requester processes
//! - PID file guarding against a second daemon
//!
//! ```text
//!   relay-daemon chat ──┐
//!   relay-daemon chat ──┼── Unix socket ──> UnixBridgeServer ──> BackgroundContext
//!   editor plugin    ───┘    (0600)              │ broadcasts          │
//!                                                └──── BroadcastHub ◄──┘
//!                                                                      │
//!                                               one WebSocket per conversation
//! ```

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Notify;
use tracing::{info, warn};

use relay_core::transport::WebSocketConnector;
use relay_core::{BackgroundContext, EnvAuthGate, HttpSessionVerifier, RelayConfig, UnixBridgeServer};

/// Get the default PID file path
///
/// Uses XDG_RUNTIME_DIR if available, otherwise /tmp/chat-relay-$UID/
pub fn default_pid_path() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(runtime_dir)
            .join("chat-relay")
            .join("relay.pid")
    } else {
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/tmp/chat-relay-{uid}/relay.pid"))
    }
}

/// Write PID file
fn write_pid_file(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create PID directory: {parent:?}"))?;
    }

    let pid = std::process::id();
    let mut file =
        fs::File::create(path).with_context(|| format!("Failed to create PID file: {path:?}"))?;
    writeln!(file, "{pid}")?;

    info!(pid = pid, path = ?path, "PID file created");
    Ok(())
}

/// Remove PID file
fn remove_pid_file(path: &Path) {
    if path.exists() {
        if let Err(e) = fs::remove_file(path) {
            warn!(error = %e, path = ?path, "Failed to remove PID file");
        } else {
            info!(path = ?path, "PID file removed");
        }
    }
}

/// Check if another daemon is running by checking PID file
fn check_existing_daemon(pid_path: &Path) -> Result<()> {
    if !pid_path.exists() {
        return Ok(());
    }

    let pid_str = fs::read_to_string(pid_path)
        .with_context(|| format!("Failed to read PID file: {pid_path:?}"))?;

    let pid: i32 = pid_str
        .trim()
        .parse()
        .with_context(|| "Invalid PID in file")?;

    // Signal 0 only checks existence
    let result = unsafe { libc::kill(pid, 0) };
    if result == 0 {
        anyhow::bail!(
            "Another relay-daemon is already running (PID: {pid}). \
             Stop it first or remove {pid_path:?} if it's stale."
        );
    }

    warn!(pid = pid, "Removing stale PID file");
    fs::remove_file(pid_path)?;
    Ok(())
}

/// The background relay process
pub struct RelayServer {
    config: RelayConfig,
    pid_path: PathBuf,
}

impl RelayServer {
    /// Create a server from resolved configuration
    pub fn new(config: RelayConfig, pid_path: PathBuf) -> Self {
        Self { config, pid_path }
    }

    /// Run until `shutdown` is notified
    pub async fn run(self, shutdown: Arc<Notify>) -> Result<()> {
        check_existing_daemon(&self.pid_path)?;
        write_pid_file(&self.pid_path)?;

        let result = self.serve(&shutdown).await;

        info!("Shutting down...");
        remove_pid_file(&self.pid_path);
        result
    }

    async fn serve(&self, shutdown: &Notify) -> Result<()> {
        let config = &self.config;
        let verifier = HttpSessionVerifier::new(config.session_url.clone(), config.connect_timeout())
            .context("Failed to build session verifier")?;

        let background = BackgroundContext::init(
            config,
            Arc::new(WebSocketConnector::new(config.connect_timeout())),
            Arc::new(EnvAuthGate),
            Arc::new(verifier),
        );

        let socket_path = config.bridge_socket_path();
        info!(socket_path = ?socket_path, host = %config.host, "Starting bridge");

        let mut bridge = UnixBridgeServer::new(
            socket_path.clone(),
            Arc::new(background.clone()),
            background.hub(),
        );
        bridge
            .listen()
            .await
            .with_context(|| format!("Failed to bind bridge socket {socket_path:?}"))?;

        let result = bridge.run(shutdown.notified()).await;

        let summary = background.registry().summary();
        info!(
            open_connections = summary.open_connections,
            pending_requests = summary.pending_requests,
            "Closing conversation sockets"
        );
        background.reset();
        bridge.shutdown();

        result.context("Bridge server failed")
    }
}
