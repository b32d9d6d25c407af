//! IPC Server for handling CLI connections via Unix Domain Sockets.
//!
//! The server listens on a Unix socket and accepts connections from CLI clients,
//! allowing them to send commands and receive responses.

use std::io;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

use super::messages::{IpcRequest, IpcResponse};

/// A server that listens for IPC connections on a Unix Domain Socket.
pub struct IpcServer {
    listener: UnixListener,
    path: PathBuf,
}

impl IpcServer {
    /// Bind the server to the specified socket path.
    ///
    /// Creates missing parent directories and replaces a stale socket file.
    pub async fn bind(path: &Path) -> Result<Self, io::Error> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        if path.exists() {
            std::fs::remove_file(path)?;
        }

        let listener = UnixListener::bind(path)?;
        tracing::debug!(path = %path.display(), "IPC socket bound");

        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept a new incoming connection.
    pub async fn accept(&self) -> Result<IpcConnection, io::Error> {
        let (stream, _addr) = self.listener.accept().await?;
        Ok(IpcConnection::new(stream))
    }
}

/// A connection to an IPC client, speaking newline-delimited JSON.
pub struct IpcConnection {
    reader: BufReader<tokio::io::ReadHalf<UnixStream>>,
    writer: tokio::io::WriteHalf<UnixStream>,
    /// Partial line carried across cancelled reads.
    pending: Vec<u8>,
}

impl IpcConnection {
    fn new(stream: UnixStream) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            pending: Vec::new(),
        }
    }

    /// Read the next request from the client.
    ///
    /// Returns `None` if the client has disconnected. Safe to use as a
    /// `select!` branch: a partially read line is kept for the next call.
    pub async fn read_request(&mut self) -> Result<Option<IpcRequest>, IpcError> {
        loop {
            let read = self.reader.read_until(b'\n', &mut self.pending).await?;
            if read == 0 && self.pending.is_empty() {
                return Ok(None);
            }

            let line = std::mem::take(&mut self.pending);
            let text = std::str::from_utf8(&line)
                .map_err(|e| IpcError::Protocol(format!("request is not UTF-8: {}", e)))?
                .trim();

            if text.is_empty() {
                if read == 0 {
                    return Ok(None);
                }
                continue;
            }

            return Ok(Some(serde_json::from_str(text)?));
        }
    }

    /// Send a response to the client.
    pub async fn send_response(&mut self, response: &IpcResponse) -> Result<(), IpcError> {
        let mut json = serde_json::to_string(response)?;
        json.push('\n');

        self.writer.write_all(json.as_bytes()).await?;
        self.writer.flush().await?;

        Ok(())
    }
}

/// Errors that can occur during IPC communication.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A JSON serialization/deserialization error occurred.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The peer sent something that is not a message.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The host answered with an error response.
    #[error("host error: {0}")]
    Remote(String),

    /// The host answered with a response of the wrong kind.
    #[error("unexpected response: {0:?}")]
    Unexpected(Box<IpcResponse>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_server_bind_creates_parent_dirs() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("nested").join("dir").join("test.sock");

        let server = IpcServer::bind(&socket_path).await.unwrap();
        assert!(socket_path.exists());
        assert_eq!(server.path(), socket_path.as_path());
    }

    #[tokio::test]
    async fn test_server_bind_removes_existing_socket() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("test.sock");

        let server1 = IpcServer::bind(&socket_path).await.unwrap();
        drop(server1);

        let _server2 = IpcServer::bind(&socket_path).await.unwrap();
        assert!(socket_path.exists());
    }

    #[tokio::test]
    async fn test_server_accept_and_communicate() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("test.sock");

        let server = IpcServer::bind(&socket_path).await.unwrap();

        let socket_path_clone = socket_path.clone();
        let client_handle = tokio::spawn(async move {
            let stream = UnixStream::connect(&socket_path_clone).await.unwrap();
            let (read_half, mut write_half) = tokio::io::split(stream);
            let mut reader = BufReader::new(read_half);

            let request = serde_json::to_string(&IpcRequest::Ping).unwrap();
            write_half
                .write_all(format!("{}\n", request).as_bytes())
                .await
                .unwrap();
            write_half.flush().await.unwrap();

            let mut response_line = String::new();
            reader.read_line(&mut response_line).await.unwrap();
            serde_json::from_str::<IpcResponse>(response_line.trim()).unwrap()
        });

        let mut conn = server.accept().await.unwrap();
        let request = conn.read_request().await.unwrap().unwrap();
        assert_eq!(request, IpcRequest::Ping);

        conn.send_response(&IpcResponse::Pong).await.unwrap();

        let response = client_handle.await.unwrap();
        assert_eq!(response, IpcResponse::Pong);
    }

    #[tokio::test]
    async fn test_read_skips_blank_lines_and_rejects_garbage() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("test.sock");
        let server = IpcServer::bind(&socket_path).await.unwrap();

        let socket_path_clone = socket_path.clone();
        tokio::spawn(async move {
            let mut stream = UnixStream::connect(&socket_path_clone).await.unwrap();
            stream.write_all(b"\n\n\"Status\"\n{oops}\n").await.unwrap();
            stream.flush().await.unwrap();
            tokio::time::sleep(tokio::time::Duration::from_millis(200)).await;
        });

        let mut conn = server.accept().await.unwrap();
        assert_eq!(conn.read_request().await.unwrap(), Some(IpcRequest::Status));
        assert!(matches!(conn.read_request().await, Err(IpcError::Json(_))));
    }

    #[tokio::test]
    async fn test_read_survives_cancellation_mid_line() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("test.sock");
        let server = IpcServer::bind(&socket_path).await.unwrap();

        let socket_path_clone = socket_path.clone();
        let (go_tx, go_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            let mut stream = UnixStream::connect(&socket_path_clone).await.unwrap();
            stream.write_all(b"\"Li").await.unwrap();
            stream.flush().await.unwrap();
            let _ = go_rx.await;
            stream.write_all(b"stSessions\"\n").await.unwrap();
            stream.flush().await.unwrap();
            tokio::time::sleep(tokio::time::Duration::from_millis(200)).await;
        });

        let mut conn = server.accept().await.unwrap();
        let first = tokio::time::timeout(
            tokio::time::Duration::from_millis(100),
            conn.read_request(),
        )
        .await;
        assert!(first.is_err(), "read should still be waiting for a newline");

        go_tx.send(()).unwrap();
        assert_eq!(
            conn.read_request().await.unwrap(),
            Some(IpcRequest::ListSessions)
        );
    }

    #[tokio::test]
    async fn test_connection_read_returns_none_on_disconnect() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("test.sock");

        let server = IpcServer::bind(&socket_path).await.unwrap();

        let socket_path_clone = socket_path.clone();
        tokio::spawn(async move {
            let _stream = UnixStream::connect(&socket_path_clone).await.unwrap();
        });

        let mut conn = server.accept().await.unwrap();
        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;

        let request = conn.read_request().await.unwrap();
        assert!(request.is_none());
    }
}
