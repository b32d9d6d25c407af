//! The session host: owns the session registry and serves the IPC socket.
//!
//! [`Host::serve`] runs until a client sends `Stop`, the process receives
//! `SIGINT`/`SIGTERM`, or the token from [`Host::shutdown_token`] is
//! cancelled. Every session is then shut down gracefully and the socket
//! file is removed.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind as UnixSignal};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::ipc::{IpcClient, IpcServer, RequestHandler};
use crate::session::{shutdown_all, SessionManager, ShutdownReport};

/// Long-running process hosting all sessions.
pub struct Host {
    config: Config,
    manager: Arc<SessionManager>,
    shutdown: CancellationToken,
}

impl Host {
    /// Creates a host spawning real processes.
    pub fn new(config: Config) -> Self {
        let manager = Arc::new(SessionManager::new(config.session_settings()));
        Self::with_manager(config, manager)
    }

    pub fn with_manager(config: Config, manager: Arc<SessionManager>) -> Self {
        Self {
            config,
            manager,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    /// Returns the shutdown token for external tasks to observe or trigger shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Serves on the configured socket path.
    pub async fn serve(&self) -> Result<Vec<ShutdownReport>> {
        let path = self.config.socket_path();
        self.serve_at(&path).await
    }

    /// Serves on `path` until shutdown, returning one report per session
    /// that was still registered.
    pub async fn serve_at(&self, path: &Path) -> Result<Vec<ShutdownReport>> {
        if host_responds(path).await {
            anyhow::bail!("another host is already serving on {}", path.display());
        }

        let server = IpcServer::bind(path)
            .await
            .with_context(|| format!("Failed to bind IPC socket: {}", path.display()))?;
        let mut sigterm = signal(UnixSignal::terminate()).context("Failed to register SIGTERM handler")?;
        let mut sigint = signal(UnixSignal::interrupt()).context("Failed to register SIGINT handler")?;

        let policy = self.config.shutdown_policy();
        let handler = Arc::new(RequestHandler::new(
            Arc::clone(&self.manager),
            policy,
            self.shutdown.clone(),
        ));
        let mut connections = JoinSet::new();

        info!(socket = %path.display(), pid = std::process::id(), "Host listening");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Shutdown requested");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM");
                    break;
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT");
                    break;
                }
                accepted = server.accept() => match accepted {
                    Ok(conn) => {
                        debug!("Accepted IPC connection");
                        let handler = Arc::clone(&handler);
                        connections.spawn(async move {
                            if let Err(e) = handler.serve_connection(conn).await {
                                warn!(error = %e, "IPC connection ended with error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept IPC connection");
                    }
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!(error = %e, "IPC connection task panicked");
                        }
                    }
                }
            }
        }

        self.shutdown.cancel();
        let reports = shutdown_all(&self.manager, policy).await;
        for report in &reports {
            info!(
                session_key = %report.key,
                forced = report.forced,
                exit = ?report.exit,
                "Session shut down"
            );
        }

        // Streaming clients see their sessions exit before being cut off.
        let _ = tokio::time::timeout(Duration::from_millis(200), async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        connections.abort_all();

        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(error = %e, socket = %path.display(), "Failed to remove socket");
            }
        }

        info!(sessions = reports.len(), "Host stopped");
        Ok(reports)
    }
}

/// Whether a live host already answers on `path`.
async fn host_responds(path: &Path) -> bool {
    if !path.exists() {
        return false;
    }
    match IpcClient::connect_with_timeout(path, Duration::from_millis(500)).await {
        Ok(mut client) => client.ping().await.unwrap_or(false),
        Err(_) => false,
    }
}
