//! Graceful shutdown and restart.
//!
//! Shutdown escalates `SIGTERM` → wait → `SIGKILL` → wait, then removes the
//! session from the registry no matter how the waits ended. Signals and the
//! final removal are bound to the instance seen at the start, so a session
//! that replaced it in the meantime is never touched.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio::time::timeout;

use super::backend::ExitStatus;
use super::manager::{Attached, SessionManager};
use super::pty::{SessionError, SessionKey};
use super::signal::SignalKind;

/// Steps of the shutdown protocol, in the order they can occur.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownPhase {
    Running,
    TerminateRequested,
    ForceKillRequested,
    ConfirmedDead,
    Reaped,
}

impl fmt::Display for ShutdownPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ShutdownPhase::Running => "running",
            ShutdownPhase::TerminateRequested => "terminate_requested",
            ShutdownPhase::ForceKillRequested => "force_kill_requested",
            ShutdownPhase::ConfirmedDead => "confirmed_dead",
            ShutdownPhase::Reaped => "reaped",
        };
        f.write_str(name)
    }
}

/// Timeouts of the shutdown and restart sequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownPolicy {
    /// How long the process gets to exit after `SIGTERM`.
    pub grace_period: Duration,
    /// How long to wait after `SIGKILL` before reaping anyway.
    pub kill_timeout: Duration,
    /// Pause between shutdown and respawn on restart.
    pub restart_settle: Duration,
}

impl Default for ShutdownPolicy {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(1),
            kill_timeout: Duration::from_millis(500),
            restart_settle: Duration::from_millis(250),
        }
    }
}

/// Outcome of one shutdown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownReport {
    pub key: SessionKey,
    /// Whether a session was registered under the key.
    pub existed: bool,
    /// Phases visited, in order.
    pub phases: Vec<ShutdownPhase>,
    /// `None` if the process was still running when it was reaped.
    pub exit: Option<ExitStatus>,
    /// `SIGKILL` was needed.
    pub forced: bool,
}

/// Shutdown state machine for one session.
pub struct GracefulShutdown {
    manager: Arc<SessionManager>,
    key: SessionKey,
    policy: ShutdownPolicy,
    history: Vec<ShutdownPhase>,
    forced: bool,
}

impl GracefulShutdown {
    pub fn new(manager: Arc<SessionManager>, key: SessionKey, policy: ShutdownPolicy) -> Self {
        Self {
            manager,
            key,
            policy,
            history: Vec::new(),
            forced: false,
        }
    }

    /// The most recent phase, if any.
    pub fn phase(&self) -> Option<ShutdownPhase> {
        self.history.last().copied()
    }

    fn enter(&mut self, phase: ShutdownPhase) {
        tracing::debug!(session_key = %self.key, phase = %phase, "Shutdown phase");
        self.history.push(phase);
    }

    pub async fn run(mut self) -> ShutdownReport {
        let Some(session) = self.manager.get(self.key.as_str()) else {
            return ShutdownReport {
                key: self.key,
                existed: false,
                phases: self.history,
                exit: None,
                forced: false,
            };
        };

        if session.is_alive() {
            self.enter(ShutdownPhase::Running);
            self.enter(ShutdownPhase::TerminateRequested);
            if let Err(e) = session.signal(SignalKind::Terminate).await {
                tracing::warn!(session_key = %self.key, error = %e, "Failed to send SIGTERM");
            }

            if timeout(self.policy.grace_period, session.wait_exit()).await.is_err() {
                self.enter(ShutdownPhase::ForceKillRequested);
                self.forced = true;
                if let Err(e) = session.signal(SignalKind::Kill).await {
                    tracing::warn!(session_key = %self.key, error = %e, "Failed to send SIGKILL");
                }

                if timeout(self.policy.kill_timeout, session.wait_exit()).await.is_err() {
                    tracing::warn!(
                        session_key = %self.key,
                        pid = ?session.pid(),
                        "Process survived SIGKILL within the kill timeout; reaping anyway"
                    );
                }
            }
        }

        if !session.is_alive() {
            self.enter(ShutdownPhase::ConfirmedDead);
        }

        self.manager
            .kill_instance(self.key.as_str(), session.instance_id())
            .await;
        self.enter(ShutdownPhase::Reaped);

        tracing::info!(
            session_key = %self.key,
            forced = self.forced,
            exit = ?session.exit_status(),
            "Session shut down"
        );

        ShutdownReport {
            key: self.key,
            existed: true,
            phases: self.history,
            exit: session.exit_status(),
            forced: self.forced,
        }
    }
}

/// Result of [`restart`].
#[derive(Debug, Clone)]
pub struct Restarted {
    pub shutdown: ShutdownReport,
    pub attached: Attached,
}

/// Shuts a session down and starts it again from its original request.
///
/// The new session has a fresh scrollback and a new instance id.
pub async fn restart(
    manager: &Arc<SessionManager>,
    key: &str,
    policy: ShutdownPolicy,
) -> Result<Restarted, SessionError> {
    let request = manager
        .get(key)
        .map(|session| session.request().clone())
        .ok_or_else(|| SessionError::NotFound(key.to_string()))?;

    let shutdown = GracefulShutdown::new(Arc::clone(manager), request.key.clone(), policy)
        .run()
        .await;
    tokio::time::sleep(policy.restart_settle).await;

    let attached = manager.create_or_attach(request).await?;
    tracing::info!(
        session_key = %key,
        instance_id = %attached.session.instance_id(),
        "Session restarted"
    );

    Ok(Restarted { shutdown, attached })
}

/// Shuts every registered session down concurrently.
pub async fn shutdown_all(manager: &Arc<SessionManager>, policy: ShutdownPolicy) -> Vec<ShutdownReport> {
    let mut tasks = JoinSet::new();
    for key in manager.keys() {
        let shutdown = GracefulShutdown::new(Arc::clone(manager), key, policy);
        tasks.spawn(shutdown.run());
    }

    let mut reports = Vec::with_capacity(tasks.len());
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(report) => reports.push(report),
            Err(e) => tracing::error!(error = %e, "Shutdown task failed"),
        }
    }
    reports.sort_by(|a, b| a.key.cmp(&b.key));
    reports
}
