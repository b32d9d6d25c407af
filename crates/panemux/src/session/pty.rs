//! A single pty-backed session.
//!
//! A [`Session`] owns the control half of one spawned process and the
//! output broadcaster fed by it. Two threads run per session: a reader that
//! pumps the process output into the broadcaster, and an exit watcher that
//! waits for the process, lets the reader drain, and then marks the session
//! dead exactly once.

use std::borrow::Borrow;
use std::fmt;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use uuid::Uuid;

use super::backend::{Dimensions, ExitStatus, ProcessControl, ProcessWaiter, SpawnedProcess};
use super::manager::CreateRequest;
use super::multiplexer::{now_millis, SessionOutputBroadcaster, SubscribeOptions, Subscription};
use super::signal::SignalKind;

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Keys must be non-empty.
    #[error("invalid session key: {0:?}")]
    InvalidKey(String),

    #[error("invalid dimensions {cols}x{rows}: both must be non-zero")]
    InvalidDimensions { cols: u16, rows: u16 },

    #[error("session not found: {0}")]
    NotFound(String),

    /// The session exists but its process has exited.
    #[error("session not running: {0}")]
    NotRunning(String),

    /// The process could not be started. Nothing was registered.
    #[error("failed to spawn {program} in {}: {source}", working_dir.display())]
    Spawn {
        program: String,
        working_dir: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("session limit reached ({0} live sessions)")]
    LimitReached(usize),

    #[error("failed to write to session {key}: {source}")]
    Write {
        key: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to resize session {key}: {source}")]
    Resize {
        key: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to send {signal} to session {key}: {source}")]
    Signal {
        key: String,
        signal: SignalKind,
        #[source]
        source: io::Error,
    },

    #[error("unknown signal: {0}")]
    UnknownSignal(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Logical identifier of a session, e.g. `"shell:42"`.
///
/// Stable across reconnects and restarts; never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionKey(String);

impl SessionKey {
    pub fn new(key: impl Into<String>) -> Result<Self, SessionError> {
        let key = key.into();
        if key.trim().is_empty() {
            return Err(SessionError::InvalidKey(key));
        }
        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The part before the first `:`, by convention the kind of pane.
    pub fn kind(&self) -> Option<&str> {
        self.0.split_once(':').map(|(kind, _)| kind)
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for SessionKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for SessionKey {
    type Error = SessionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for SessionKey {
    type Error = SessionError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<SessionKey> for String {
    fn from(key: SessionKey) -> Self {
        key.0
    }
}

/// Point-in-time description of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub key: SessionKey,
    pub instance_id: Uuid,
    pub pid: Option<u32>,
    pub program: String,
    pub working_dir: PathBuf,
    pub size: Dimensions,
    pub alive: bool,
    pub exit: Option<ExitStatus>,
    pub created_at: u64,
    pub last_activity: u64,
    pub subscribers: usize,
    pub scrollback_chunks: usize,
}

/// Buffer size for reading from the pty.
const READ_BUFFER_SIZE: usize = 4096;

struct ProcessSlot {
    /// `None` once the process has exited.
    process: Option<Box<dyn ProcessControl>>,
    size: Dimensions,
}

/// A pty session with a running (or exited) process.
pub struct Session {
    key: SessionKey,
    instance_id: Uuid,
    request: CreateRequest,
    program: String,
    pid: Option<u32>,
    created_at: u64,
    control: Mutex<ProcessSlot>,
    output: Arc<SessionOutputBroadcaster>,
    exit_tx: watch::Sender<Option<ExitStatus>>,
}

impl Session {
    /// Wraps a freshly spawned process and starts its reader and exit
    /// watcher threads.
    ///
    /// If a thread cannot be started the process is killed and the error is
    /// returned.
    pub(crate) fn start(
        request: CreateRequest,
        program: String,
        process: SpawnedProcess,
        output: Arc<SessionOutputBroadcaster>,
        exit_drain: Duration,
    ) -> io::Result<Arc<Self>> {
        let SpawnedProcess {
            pid,
            mut control,
            output: reader,
            waiter,
        } = process;

        let (exit_tx, _) = watch::channel(None);
        let key = request.key.clone();
        let (done_tx, done_rx) = mpsc::channel::<()>();

        let reader_output = Arc::clone(&output);
        let reader_key = key.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("panemux-read-{}", key))
            .spawn(move || {
                read_loop(&reader_key, reader, &reader_output);
                drop(done_tx);
            });
        if let Err(e) = spawned {
            let _ = control.signal(SignalKind::Kill);
            return Err(e);
        }

        let session = Arc::new(Self {
            key,
            instance_id: Uuid::new_v4(),
            program,
            pid,
            created_at: now_millis(),
            control: Mutex::new(ProcessSlot {
                process: Some(control),
                size: request.size,
            }),
            request,
            output,
            exit_tx,
        });

        let watched = Arc::clone(&session);
        let spawned = std::thread::Builder::new()
            .name(format!("panemux-wait-{}", session.key))
            .spawn(move || watch_exit(watched, waiter, done_rx, exit_drain));
        if let Err(e) = spawned {
            session.force_kill();
            return Err(e);
        }

        tracing::info!(
            session_key = %session.key,
            instance_id = %session.instance_id,
            pid = ?session.pid,
            program = %session.program,
            "Session started"
        );

        Ok(session)
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    /// Unique per spawned process.
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// Returns the process ID, if the backend reported one.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn working_dir(&self) -> &Path {
        &self.request.working_dir
    }

    /// The request this session was created from; used to restart it.
    pub fn request(&self) -> &CreateRequest {
        &self.request
    }

    /// Creation time in Unix milliseconds.
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn is_alive(&self) -> bool {
        self.exit_tx.borrow().is_none()
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_tx.borrow().clone()
    }

    /// Resolves once the process has exited.
    pub async fn wait_exit(&self) -> ExitStatus {
        let mut rx = self.exit_tx.subscribe();
        let status = match rx.wait_for(Option::is_some).await {
            Ok(status) => status.clone().unwrap_or_else(ExitStatus::unknown),
            Err(_) => ExitStatus::unknown(),
        };
        status
    }

    pub async fn size(&self) -> Dimensions {
        self.control.lock().await.size
    }

    pub fn output(&self) -> &Arc<SessionOutputBroadcaster> {
        &self.output
    }

    pub fn subscribe(&self, options: SubscribeOptions) -> Subscription {
        self.output.subscribe(options)
    }

    /// Current scrollback as one buffer.
    pub fn scrollback(&self) -> Vec<u8> {
        self.output.scrollback_contents()
    }

    /// Writes input to the process.
    pub async fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        if !self.is_alive() {
            return Err(SessionError::NotRunning(self.key.to_string()));
        }

        let mut slot = self.control.lock().await;
        let process = slot
            .process
            .as_mut()
            .ok_or_else(|| SessionError::NotRunning(self.key.to_string()))?;

        process.write(data).map_err(|source| SessionError::Write {
            key: self.key.to_string(),
            source,
        })
    }

    /// Resizes the terminal. Returns `false` when nothing changed: the size
    /// is the current one or the process is gone.
    pub async fn resize(&self, size: Dimensions) -> Result<bool, SessionError> {
        if !size.is_valid() {
            return Err(SessionError::InvalidDimensions {
                cols: size.cols,
                rows: size.rows,
            });
        }

        if !self.is_alive() {
            return Ok(false);
        }

        let mut slot = self.control.lock().await;
        if slot.size == size {
            return Ok(false);
        }
        let Some(process) = slot.process.as_mut() else {
            return Ok(false);
        };

        process.resize(size).map_err(|source| SessionError::Resize {
            key: self.key.to_string(),
            source,
        })?;
        slot.size = size;

        tracing::debug!(session_key = %self.key, size = %size, "Resized PTY");
        Ok(true)
    }

    /// Signals the process group. Returns `false` if the process is gone.
    pub async fn signal(&self, signal: SignalKind) -> Result<bool, SessionError> {
        if !self.is_alive() {
            return Ok(false);
        }

        let mut slot = self.control.lock().await;
        let Some(process) = slot.process.as_mut() else {
            return Ok(false);
        };

        process.signal(signal).map_err(|source| SessionError::Signal {
            key: self.key.to_string(),
            signal,
            source,
        })?;

        tracing::debug!(session_key = %self.key, signal = %signal, "Sent signal");
        Ok(true)
    }

    /// Stops publishing output. The exit event still follows.
    pub(crate) fn close_output(&self) {
        self.output.close();
    }

    /// Sends SIGKILL without waiting on the control lock.
    ///
    /// Used where awaiting is impossible. Returns `false` if the lock was
    /// busy or the process is already gone.
    pub(crate) fn force_kill(&self) -> bool {
        let Ok(mut slot) = self.control.try_lock() else {
            return false;
        };
        match slot.process.as_mut() {
            Some(process) => process.signal(SignalKind::Kill).is_ok(),
            None => false,
        }
    }

    /// Records the exit. Only the first call has any effect.
    ///
    /// The session reads as dead before subscribers see the exit event.
    fn mark_exited(&self, status: ExitStatus) {
        let first = self.exit_tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(status.clone());
            true
        });
        if !first {
            return;
        }
        // Runs on the watcher thread, outside any runtime.
        self.control.blocking_lock().process = None;
        self.output.finish(status.clone());

        if status.is_abnormal() {
            tracing::warn!(session_key = %self.key, pid = ?self.pid, status = %status, "Session exited abnormally");
        } else {
            tracing::info!(session_key = %self.key, pid = ?self.pid, "Session exited");
        }
    }

    pub async fn info(&self) -> SessionInfo {
        SessionInfo {
            key: self.key.clone(),
            instance_id: self.instance_id,
            pid: self.pid,
            program: self.program.clone(),
            working_dir: self.request.working_dir.clone(),
            size: self.size().await,
            alive: self.is_alive(),
            exit: self.exit_status(),
            created_at: self.created_at,
            last_activity: self.output.last_activity(),
            subscribers: self.output.subscriber_count(),
            scrollback_chunks: self.output.scrollback_len(),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("key", &self.key)
            .field("instance_id", &self.instance_id)
            .field("pid", &self.pid)
            .field("alive", &self.is_alive())
            .finish_non_exhaustive()
    }
}

fn read_loop(key: &SessionKey, mut reader: Box<dyn Read + Send>, output: &SessionOutputBroadcaster) {
    let mut buffer = [0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => {
                tracing::debug!(session_key = %key, "PTY EOF");
                break;
            }
            Ok(n) => {
                output.publish(Bytes::copy_from_slice(&buffer[..n]));
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                // Linux reports EIO once the last slave fd is closed.
                tracing::debug!(session_key = %key, error = %e, "PTY read ended");
                break;
            }
        }
    }
}

fn watch_exit(
    session: Arc<Session>,
    waiter: Box<dyn ProcessWaiter>,
    reader_done: mpsc::Receiver<()>,
    drain: Duration,
) {
    let status = match waiter.wait() {
        Ok(status) => status,
        Err(e) => {
            tracing::warn!(session_key = %session.key, error = %e, "Failed to wait for process");
            ExitStatus::unknown()
        }
    };

    // Let the reader publish what the process wrote before exiting.
    if let Err(RecvTimeoutError::Timeout) = reader_done.recv_timeout(drain) {
        tracing::debug!(
            session_key = %session.key,
            drain_ms = drain.as_millis() as u64,
            "Output still open after exit; finishing anyway"
        );
    }

    session.mark_exited(status);
}
