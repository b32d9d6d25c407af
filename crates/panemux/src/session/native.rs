//! Native pty backend built on `portable-pty`.

use std::io::{self, Write};
use std::path::Path;

use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};

use super::backend::{
    Dimensions, ExitStatus, ProcessControl, ProcessWaiter, PtyBackend, SpawnRequest,
    SpawnedProcess,
};
use super::signal::SignalKind;

/// Spawns real processes in OS pseudo-terminals.
#[derive(Debug, Clone)]
pub struct NativePtyBackend {
    term: String,
}

impl NativePtyBackend {
    pub fn new() -> Self {
        Self::with_term("xterm-256color")
    }

    /// Use `term` as the `TERM` value of spawned processes.
    pub fn with_term(term: impl Into<String>) -> Self {
        Self { term: term.into() }
    }
}

impl Default for NativePtyBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl PtyBackend for NativePtyBackend {
    fn spawn(&self, request: &SpawnRequest) -> io::Result<SpawnedProcess> {
        check_working_dir(&request.working_dir)?;
        check_program(&request.program)?;

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(to_pty_size(request.size))
            .map_err(to_io_error)?;

        let mut cmd = CommandBuilder::new(&request.program);
        cmd.args(&request.args);
        cmd.cwd(&request.working_dir);
        cmd.env("TERM", &self.term);
        cmd.env("COLORTERM", "truecolor");
        for (key, value) in &request.env {
            cmd.env(key, value);
        }

        let child = pair.slave.spawn_command(cmd).map_err(to_io_error)?;
        // Holding the slave open would keep the reader from ever seeing EOF.
        drop(pair.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();

        let output = match pair.master.try_clone_reader() {
            Ok(reader) => reader,
            Err(e) => {
                reap(child);
                return Err(to_io_error(e));
            }
        };
        let writer = match pair.master.take_writer() {
            Ok(writer) => writer,
            Err(e) => {
                reap(child);
                return Err(to_io_error(e));
            }
        };

        tracing::debug!(
            program = %request.program,
            pid = ?pid,
            size = %request.size,
            "Spawned pty process"
        );

        Ok(SpawnedProcess {
            pid,
            control: Box::new(NativeControl {
                master: pair.master,
                writer,
                killer,
                pid,
            }),
            output,
            waiter: Box::new(NativeWaiter { child }),
        })
    }
}

struct NativeControl {
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    #[cfg_attr(unix, allow(dead_code))]
    killer: Box<dyn ChildKiller + Send + Sync>,
    #[cfg_attr(not(unix), allow(dead_code))]
    pid: Option<u32>,
}

impl ProcessControl for NativeControl {
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.writer.write_all(data)?;
        self.writer.flush()
    }

    fn resize(&mut self, size: Dimensions) -> io::Result<()> {
        self.master.resize(to_pty_size(size)).map_err(to_io_error)
    }

    #[cfg(unix)]
    fn signal(&mut self, signal: SignalKind) -> io::Result<()> {
        use nix::errno::Errno;
        use nix::sys::signal::{kill, killpg};
        use nix::unistd::Pid;

        let Some(pid) = self.pid else {
            return Ok(());
        };
        let pid = Pid::from_raw(pid as i32);

        // The child is a session leader, so its pid doubles as the group id.
        match killpg(pid, signal.to_nix()) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => match kill(pid, signal.to_nix()) {
                Ok(()) | Err(Errno::ESRCH) => Ok(()),
                Err(e) => Err(io::Error::from(e)),
            },
            Err(e) => Err(io::Error::from(e)),
        }
    }

    #[cfg(not(unix))]
    fn signal(&mut self, signal: SignalKind) -> io::Result<()> {
        match signal {
            SignalKind::Interrupt => self.write(b"\x03"),
            _ => self.killer.kill(),
        }
    }
}

struct NativeWaiter {
    child: Box<dyn Child + Send + Sync>,
}

impl ProcessWaiter for NativeWaiter {
    fn wait(mut self: Box<Self>) -> io::Result<ExitStatus> {
        let status = self.child.wait()?;
        Ok(convert_status(&status))
    }
}

/// portable-pty 0.8 only exposes the terminating signal through `Display`.
fn convert_status(status: &portable_pty::ExitStatus) -> ExitStatus {
    if status.success() {
        return ExitStatus::with_code(0);
    }

    let rendered = status.to_string();
    match rendered.strip_prefix("Terminated by ") {
        Some(signal) => ExitStatus::with_signal(signal),
        None => ExitStatus::with_code(status.exit_code() as i32),
    }
}

fn check_working_dir(dir: &Path) -> io::Result<()> {
    let metadata = std::fs::metadata(dir)?;
    if metadata.is_dir() {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} is not a directory", dir.display()),
        ))
    }
}

fn check_program(program: &str) -> io::Result<()> {
    if program.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty program"));
    }
    if Path::new(program).components().count() > 1 {
        std::fs::metadata(program).map(|_| ())
    } else {
        which::which(program).map(|_| ()).map_err(|_| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("command not found: {}", program),
            )
        })
    }
}

fn reap(mut child: Box<dyn Child + Send + Sync>) {
    let _ = child.kill();
    let _ = child.wait();
}

fn to_pty_size(size: Dimensions) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

fn to_io_error(err: anyhow::Error) -> io::Error {
    match err.downcast::<io::Error>() {
        Ok(io_err) => io_err,
        Err(other) => io::Error::other(other.to_string()),
    }
}
