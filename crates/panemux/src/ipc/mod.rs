//! Unix Domain Socket IPC between the CLI and the session host.
//!
//! ## Overview
//!
//! Newline-delimited JSON: each message is one JSON value followed by a
//! newline. A connection carries request/response pairs until it sends
//! `Subscribe`, after which the host streams `Output` for that session
//! and finishes with `Exited`. Input, resize and signal requests are still
//! accepted while streaming.
//!
//! ## Socket Path
//!
//! - Primary: `$XDG_RUNTIME_DIR/panemux/host.sock`
//! - Fallback: `/tmp/panemux-$UID/host.sock`
//!
//! ## Example
//!
//! ```rust,no_run
//! use panemux::ipc::{IpcClient, get_socket_path};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = IpcClient::connect(&get_socket_path()).await?;
//!
//!     for session in client.list_sessions().await? {
//!         println!("{} alive={}", session.key, session.alive);
//!     }
//!
//!     Ok(())
//! }
//! ```

mod client;
mod handler;
mod messages;
mod server;

pub use client::IpcClient;
pub use handler::RequestHandler;
pub use messages::{decode_data, encode_data, IpcRequest, IpcResponse, IpcSessionInfo};
pub use server::{IpcConnection, IpcError, IpcServer};

use std::path::PathBuf;

/// Get the socket path for IPC communication.
///
/// 1. If `$XDG_RUNTIME_DIR` is set: `$XDG_RUNTIME_DIR/panemux/host.sock`
/// 2. Otherwise: `/tmp/panemux-$UID/host.sock`
#[cfg(unix)]
pub fn get_socket_path() -> PathBuf {
    use std::os::unix::fs::MetadataExt;

    match std::env::var("XDG_RUNTIME_DIR") {
        Ok(runtime_dir) if !runtime_dir.is_empty() => {
            PathBuf::from(runtime_dir).join("panemux").join("host.sock")
        }
        _ => {
            // Get UID by checking metadata of a file we own
            let uid = std::fs::metadata("/proc/self")
                .map(|m| m.uid())
                .unwrap_or(0);

            PathBuf::from(format!("/tmp/panemux-{}", uid)).join("host.sock")
        }
    }
}

/// Non-Unix platforms are not supported for Unix Domain Sockets.
#[cfg(not(unix))]
pub fn get_socket_path() -> PathBuf {
    PathBuf::from("/tmp/panemux-unsupported/host.sock")
}
