//! # panemux
//!
//! Hosts long-lived pty sessions that terminal panes attach to by a stable
//! logical key.
//!
//! ## Overview
//!
//! - **Session registry**: at most one live process per key; attaching to
//!   a live key never spawns a second process
//! - **Output fan-out**: every subscriber of a session sees the same output
//!   in order, optionally preceded by a bounded scrollback replay
//! - **Control**: input, resize and signals for one process group
//! - **Lifecycle**: graceful shutdown (`SIGTERM`, then `SIGKILL`) and restart
//! - **Host**: a long-running process exposing all of the above over a
//!   Unix socket, driven by the `panemux` CLI
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                          Host                            │
//! │  ┌──────────────┐   ┌─────────────────────────────────┐  │
//! │  │  IpcServer   │──▶│         RequestHandler          │  │
//! │  └──────────────┘   └───────────────┬─────────────────┘  │
//! │                                     ▼                    │
//! │  ┌────────────────────────────────────────────────────┐  │
//! │  │                  SessionManager                    │  │
//! │  │  Session ──▶ SessionOutputBroadcaster ──▶ Subscribers │
//! │  │     │                                              │  │
//! │  │     └──▶ PtyBackend (portable-pty)                 │  │
//! │  └────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use panemux::session::{CreateRequest, SessionKey, SessionManager, SessionSettings};
//! use panemux::session::{SessionEvent, SubscribeOptions};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let manager = SessionManager::new(SessionSettings::default());
//!
//!     let key = SessionKey::new("shell:1")?;
//!     let attached = manager
//!         .create_or_attach(CreateRequest::new(key, "/tmp").with_initial_commands(["ls"]))
//!         .await?;
//!
//!     let mut output = attached.session.subscribe(SubscribeOptions::default());
//!     while let Some(SessionEvent::Data(chunk)) = output.recv().await {
//!         print!("{}", String::from_utf8_lossy(&chunk));
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`session`]: Pty sessions, fan-out, control and lifecycle
//! - [`ipc`]: Unix socket protocol between CLI and host
//! - [`host`]: The long-running host process

pub mod config;
pub mod host;
pub mod ipc;
pub mod session;

pub use config::Config;
pub use host::Host;
pub use session::{
    Attached, CreateRequest, Session, SessionError, SessionEvent, SessionKey, SessionManager,
    SessionSettings, ShutdownPolicy, SignalKind,
};
