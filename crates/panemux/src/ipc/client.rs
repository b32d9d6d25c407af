//! IPC Client for talking to the host via Unix Domain Sockets.
//!
//! Request/response calls are bounded by a timeout. After
//! [`IpcClient::subscribe`] the connection streams `Output` responses until
//! `Exited`; read them with [`IpcClient::next_event`].

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use super::messages::{encode_data, IpcRequest, IpcResponse, IpcSessionInfo};
use super::server::IpcError;
use crate::session::ShutdownReport;

/// Default timeout for client operations in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 5;

/// A client for communicating with the host via IPC.
pub struct IpcClient {
    reader: BufReader<tokio::io::ReadHalf<UnixStream>>,
    writer: tokio::io::WriteHalf<UnixStream>,
    timeout: Duration,
    /// Partial line carried across cancelled reads.
    pending: Vec<u8>,
}

fn timed_out(what: &str) -> IpcError {
    IpcError::Io(io::Error::new(io::ErrorKind::TimedOut, format!("{} timed out", what)))
}

impl IpcClient {
    /// Connect to the host at the specified socket path.
    ///
    /// Fails when nothing listens on the socket, which usually means the
    /// host is not running.
    pub async fn connect(path: &Path) -> Result<Self, IpcError> {
        Self::connect_with_timeout(path, Duration::from_secs(DEFAULT_TIMEOUT_SECS)).await
    }

    /// Connect with a custom timeout, also used for every later request.
    pub async fn connect_with_timeout(path: &Path, timeout: Duration) -> Result<Self, IpcError> {
        let stream = tokio::time::timeout(timeout, UnixStream::connect(path))
            .await
            .map_err(|_| timed_out("connection"))??;

        let (read_half, write_half) = tokio::io::split(stream);

        Ok(Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            timeout,
            pending: Vec::new(),
        })
    }

    /// Set the timeout for operations.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Send a request and wait for its response.
    pub async fn send(&mut self, request: IpcRequest) -> Result<IpcResponse, IpcError> {
        let timeout = self.timeout;
        tokio::time::timeout(timeout, async {
            self.write_request(&request).await?;
            self.read_response().await
        })
        .await
        .map_err(|_| timed_out("operation"))?
    }

    async fn write_request(&mut self, request: &IpcRequest) -> Result<(), IpcError> {
        let mut json = serde_json::to_string(request)?;
        json.push('\n');

        self.writer.write_all(json.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn read_response(&mut self) -> Result<IpcResponse, IpcError> {
        let bytes_read = self.reader.read_until(b'\n', &mut self.pending).await?;

        if bytes_read == 0 && self.pending.is_empty() {
            return Err(IpcError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "host closed connection",
            )));
        }

        let line = std::mem::take(&mut self.pending);
        Ok(serde_json::from_slice(line.trim_ascii())?)
    }

    /// Send a ping request to check if the host is responsive.
    pub async fn ping(&mut self) -> Result<bool, IpcError> {
        let response = self.send(IpcRequest::Ping).await?;
        Ok(matches!(response, IpcResponse::Pong))
    }

    /// Get the current status of the host.
    pub async fn status(&mut self) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::Status).await
    }

    /// Request the host to stop.
    pub async fn stop(&mut self) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::Stop).await
    }

    pub async fn list_sessions(&mut self) -> Result<Vec<IpcSessionInfo>, IpcError> {
        match self.send(IpcRequest::ListSessions).await? {
            IpcResponse::Sessions { sessions } => Ok(sessions),
            other => Err(unexpected(other)),
        }
    }

    pub async fn get_session(&mut self, key: &str) -> Result<Option<IpcSessionInfo>, IpcError> {
        match self.send(IpcRequest::GetSession { key: key.to_string() }).await? {
            IpcResponse::Session { session } => Ok(session),
            other => Err(unexpected(other)),
        }
    }

    /// Returns the session and whether it was newly spawned.
    pub async fn create_or_attach(
        &mut self,
        key: &str,
        working_dir: PathBuf,
        cols: u16,
        rows: u16,
        initial_commands: Vec<String>,
    ) -> Result<(IpcSessionInfo, bool), IpcError> {
        let request = IpcRequest::CreateOrAttach {
            key: key.to_string(),
            working_dir,
            cols,
            rows,
            initial_commands,
            program: None,
            args: Vec::new(),
            env: Vec::new(),
        };
        match self.send(request).await? {
            IpcResponse::Attached { session, spawned } => Ok((session, spawned)),
            other => Err(unexpected(other)),
        }
    }

    pub async fn write(&mut self, key: &str, data: &[u8]) -> Result<(), IpcError> {
        let request = IpcRequest::Write {
            key: key.to_string(),
            data: encode_data(data),
        };
        expect_ok(self.send(request).await?)
    }

    pub async fn resize(&mut self, key: &str, cols: u16, rows: u16) -> Result<(), IpcError> {
        let request = IpcRequest::Resize {
            key: key.to_string(),
            cols,
            rows,
        };
        expect_ok(self.send(request).await?)
    }

    pub async fn signal(&mut self, key: &str, signal: &str) -> Result<(), IpcError> {
        let request = IpcRequest::Signal {
            key: key.to_string(),
            signal: signal.to_string(),
        };
        expect_ok(self.send(request).await?)
    }

    /// Returns whether a session was registered under the key.
    pub async fn kill(&mut self, key: &str) -> Result<bool, IpcError> {
        match self.send(IpcRequest::Kill { key: key.to_string() }).await? {
            IpcResponse::Killed { existed, .. } => Ok(existed),
            other => Err(unexpected(other)),
        }
    }

    /// Graceful shutdown of one session. The request timeout is stretched
    /// to cover the shutdown timeouts.
    pub async fn stop_session(
        &mut self,
        key: &str,
        grace_period_ms: Option<u64>,
        kill_timeout_ms: Option<u64>,
    ) -> Result<ShutdownReport, IpcError> {
        let request = IpcRequest::StopSession {
            key: key.to_string(),
            grace_period_ms,
            kill_timeout_ms,
        };
        let saved = self.timeout;
        self.timeout += Duration::from_millis(
            grace_period_ms.unwrap_or(0) + kill_timeout_ms.unwrap_or(0),
        );
        let response = self.send(request).await;
        self.timeout = saved;

        match response? {
            IpcResponse::Stopped { report } => Ok(report),
            other => Err(unexpected(other)),
        }
    }

    pub async fn restart(&mut self, key: &str) -> Result<IpcSessionInfo, IpcError> {
        match self.send(IpcRequest::Restart { key: key.to_string() }).await? {
            IpcResponse::Attached { session, .. } => Ok(session),
            other => Err(unexpected(other)),
        }
    }

    /// Switches this connection to streaming mode.
    pub async fn subscribe(&mut self, key: &str, replay: bool) -> Result<(), IpcError> {
        let request = IpcRequest::Subscribe {
            key: key.to_string(),
            replay,
        };
        match self.send(request).await? {
            IpcResponse::Subscribed { .. } => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Sends a request while streaming without waiting for its answer; the
    /// answer arrives interleaved with the stream.
    pub async fn send_streaming(&mut self, request: IpcRequest) -> Result<(), IpcError> {
        self.write_request(&request).await
    }

    /// Next streamed response. Waits without a timeout and is safe to use
    /// as a `select!` branch.
    pub async fn next_event(&mut self) -> Result<IpcResponse, IpcError> {
        self.read_response().await
    }
}

fn unexpected(response: IpcResponse) -> IpcError {
    match response {
        IpcResponse::Error { message } => IpcError::Remote(message),
        other => IpcError::Unexpected(Box::new(other)),
    }
}

fn expect_ok(response: IpcResponse) -> Result<(), IpcError> {
    match response {
        IpcResponse::Ok => Ok(()),
        other => Err(unexpected(other)),
    }
}
