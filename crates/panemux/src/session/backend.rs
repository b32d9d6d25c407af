//! Process backend contract.
//!
//! The session layer never touches the OS directly. It asks a [`PtyBackend`]
//! to spawn a process and gets back three independently owned pieces: a
//! control handle (write/resize/signal), a blocking output stream and a
//! blocking exit waiter. Splitting them lets the reader thread, the exit
//! watcher and the control plane run without sharing a lock.

use std::fmt;
use std::io::{self, Read};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::signal::SignalKind;

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dimensions {
    pub cols: u16,
    pub rows: u16,
}

impl Dimensions {
    pub const fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }

    /// Both axes must be non-zero for the kernel to accept the size.
    pub fn is_valid(&self) -> bool {
        self.cols > 0 && self.rows > 0
    }
}

impl Default for Dimensions {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

impl fmt::Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.cols, self.rows)
    }
}

/// How a process ended.
///
/// `code` is `None` when the process was terminated by a signal, in which
/// case `signal` carries the platform's description of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStatus {
    pub code: Option<i32>,
    pub signal: Option<String>,
}

impl ExitStatus {
    pub fn with_code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn with_signal(signal: impl Into<String>) -> Self {
        Self {
            code: None,
            signal: Some(signal.into()),
        }
    }

    /// Status used when the waiter itself failed and the real status is lost.
    pub fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0) && self.signal.is_none()
    }

    /// A non-zero code or a terminating signal. Callers use this to tell a
    /// crash apart from a clean stop.
    pub fn is_abnormal(&self) -> bool {
        !self.success()
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.code, &self.signal) {
            (_, Some(signal)) => write!(f, "terminated by {}", signal),
            (Some(code), None) => write!(f, "exited with code {}", code),
            (None, None) => write!(f, "exited with unknown status"),
        }
    }
}

/// Everything a backend needs to start a process inside a pty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: Vec<(String, String)>,
    pub size: Dimensions,
}

/// Input and control side of a running process.
pub trait ProcessControl: Send {
    fn write(&mut self, data: &[u8]) -> io::Result<()>;

    fn resize(&mut self, size: Dimensions) -> io::Result<()>;

    /// Deliver `signal` to the process group of the child. Implementations
    /// treat "no such process" as success since it races with exit.
    fn signal(&mut self, signal: SignalKind) -> io::Result<()>;
}

/// Blocks until the process exits.
pub trait ProcessWaiter: Send {
    fn wait(self: Box<Self>) -> io::Result<ExitStatus>;
}

/// A freshly spawned process, split into its independently owned parts.
pub struct SpawnedProcess {
    pub pid: Option<u32>,
    pub control: Box<dyn ProcessControl>,
    pub output: Box<dyn Read + Send>,
    pub waiter: Box<dyn ProcessWaiter>,
}

impl fmt::Debug for SpawnedProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpawnedProcess")
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

/// Spawns processes attached to a pseudo-terminal.
///
/// `spawn` is blocking; the session manager calls it from the blocking pool.
pub trait PtyBackend: Send + Sync + 'static {
    fn spawn(&self, request: &SpawnRequest) -> io::Result<SpawnedProcess>;
}
