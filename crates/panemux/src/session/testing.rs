//! In-memory pty backend for unit tests.
//!
//! Each spawned fake process is driven by the test through a [`FakeProcess`]
//! handle: emit output, make it exit, and inspect what the session layer
//! wrote to it or sent to it.

use std::io::{self, Read};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::backend::{
    Dimensions, ExitStatus, ProcessControl, ProcessWaiter, PtyBackend, SpawnRequest,
    SpawnedProcess,
};
use super::signal::SignalKind;

#[derive(Debug, Clone, Copy, Default)]
struct Behavior {
    ignore_terminate: bool,
    echo: bool,
}

#[derive(Default)]
struct BackendState {
    behavior: Behavior,
    spawn_delay: Option<Duration>,
    fail_next: Option<io::ErrorKind>,
    processes: Vec<FakeProcess>,
    next_pid: u32,
}

#[derive(Clone, Default)]
pub(crate) struct FakeBackend {
    state: Arc<Mutex<BackendState>>,
}

impl FakeBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Spawned processes survive SIGTERM and only die on SIGKILL.
    pub(crate) fn ignoring_terminate(self) -> Self {
        self.lock().behavior.ignore_terminate = true;
        self
    }

    /// Spawned processes write their input back to their output.
    pub(crate) fn with_echo(self) -> Self {
        self.lock().behavior.echo = true;
        self
    }

    /// Every spawn blocks for `delay` first.
    pub(crate) fn with_spawn_delay(self, delay: Duration) -> Self {
        self.lock().spawn_delay = Some(delay);
        self
    }

    pub(crate) fn fail_next_spawn(&self, kind: io::ErrorKind) {
        self.lock().fail_next = Some(kind);
    }

    pub(crate) fn processes(&self) -> Vec<FakeProcess> {
        self.lock().processes.clone()
    }

    pub(crate) fn spawn_count(&self) -> usize {
        self.lock().processes.len()
    }

    pub(crate) fn last(&self) -> FakeProcess {
        self.lock()
            .processes
            .last()
            .cloned()
            .expect("no process spawned")
    }

    /// Processes that have not exited yet.
    pub(crate) fn live_count(&self) -> usize {
        self.lock()
            .processes
            .iter()
            .filter(|p| !p.has_exited())
            .count()
    }

    fn lock(&self) -> MutexGuard<'_, BackendState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PtyBackend for FakeBackend {
    fn spawn(&self, request: &SpawnRequest) -> io::Result<SpawnedProcess> {
        let (delay, fail) = {
            let mut state = self.lock();
            (state.spawn_delay, state.fail_next.take())
        };
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        if let Some(kind) = fail {
            return Err(io::Error::new(kind, "fake spawn failure"));
        }
        if !request.working_dir.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} does not exist", request.working_dir.display()),
            ));
        }

        let (output_tx, output_rx) = mpsc::channel();
        let (exit_tx, exit_rx) = mpsc::channel();

        let mut state = self.lock();
        state.next_pid += 1;
        let process = FakeProcess {
            inner: Arc::new(ProcessInner {
                pid: 10_000 + state.next_pid,
                request: request.clone(),
                behavior: state.behavior,
                output: Mutex::new(Some(output_tx)),
                exit: Mutex::new(Some(exit_tx)),
                writes: Mutex::new(Vec::new()),
                resizes: Mutex::new(Vec::new()),
                signals: Mutex::new(Vec::new()),
            }),
        };
        state.processes.push(process.clone());
        drop(state);

        Ok(SpawnedProcess {
            pid: Some(process.pid()),
            control: Box::new(FakeControl {
                process: process.clone(),
            }),
            output: Box::new(ChannelReader {
                rx: output_rx,
                pending: Vec::new(),
                pos: 0,
            }),
            waiter: Box::new(FakeWaiter { rx: exit_rx }),
        })
    }
}

struct ProcessInner {
    pid: u32,
    request: SpawnRequest,
    behavior: Behavior,
    output: Mutex<Option<Sender<Vec<u8>>>>,
    exit: Mutex<Option<Sender<ExitStatus>>>,
    writes: Mutex<Vec<u8>>,
    resizes: Mutex<Vec<Dimensions>>,
    signals: Mutex<Vec<SignalKind>>,
}

/// Test-side handle to one fake process.
#[derive(Clone)]
pub(crate) struct FakeProcess {
    inner: Arc<ProcessInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl FakeProcess {
    pub(crate) fn pid(&self) -> u32 {
        self.inner.pid
    }

    pub(crate) fn request(&self) -> &SpawnRequest {
        &self.inner.request
    }

    /// Makes the process print `data`.
    pub(crate) fn emit(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        if let Some(tx) = lock(&self.inner.output).as_ref() {
            let _ = tx.send(data.to_vec());
        }
    }

    /// Closes the output stream and reports `status` to the waiter.
    pub(crate) fn exit(&self, status: ExitStatus) {
        lock(&self.inner.output).take();
        if let Some(tx) = lock(&self.inner.exit).take() {
            let _ = tx.send(status);
        }
    }

    pub(crate) fn has_exited(&self) -> bool {
        lock(&self.inner.exit).is_none()
    }

    pub(crate) fn written(&self) -> String {
        String::from_utf8_lossy(&lock(&self.inner.writes)).into_owned()
    }

    pub(crate) fn resizes(&self) -> Vec<Dimensions> {
        lock(&self.inner.resizes).clone()
    }

    pub(crate) fn signals(&self) -> Vec<SignalKind> {
        lock(&self.inner.signals).clone()
    }
}

struct FakeControl {
    process: FakeProcess,
}

impl ProcessControl for FakeControl {
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        if self.process.has_exited() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "process exited"));
        }
        lock(&self.process.inner.writes).extend_from_slice(data);
        if self.process.inner.behavior.echo {
            self.process.emit(data);
        }
        Ok(())
    }

    fn resize(&mut self, size: Dimensions) -> io::Result<()> {
        lock(&self.process.inner.resizes).push(size);
        Ok(())
    }

    fn signal(&mut self, signal: SignalKind) -> io::Result<()> {
        if self.process.has_exited() {
            return Ok(());
        }
        lock(&self.process.inner.signals).push(signal);
        match signal {
            SignalKind::Kill => self.process.exit(ExitStatus::with_signal("Killed")),
            SignalKind::Terminate if !self.process.inner.behavior.ignore_terminate => {
                self.process.exit(ExitStatus::with_signal("Terminated"))
            }
            _ => {}
        }
        Ok(())
    }
}

struct FakeWaiter {
    rx: Receiver<ExitStatus>,
}

impl ProcessWaiter for FakeWaiter {
    fn wait(self: Box<Self>) -> io::Result<ExitStatus> {
        self.rx
            .recv()
            .map_err(|_| io::Error::other("fake process handle dropped"))
    }
}

struct ChannelReader {
    rx: Receiver<Vec<u8>>,
    pending: Vec<u8>,
    pos: usize,
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.pending.len() {
            match self.rx.recv() {
                Ok(chunk) => {
                    self.pending = chunk;
                    self.pos = 0;
                }
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len() - self.pos);
        buf[..n].copy_from_slice(&self.pending[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}
