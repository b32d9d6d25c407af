//! Session management module.
//!
//! Pty-backed processes keyed by logical pane identifiers: spawning,
//! output fan-out with scrollback replay, input/control, and graceful
//! shutdown and restart.

pub mod backend;
pub mod lifecycle;
pub mod manager;
pub mod multiplexer;
pub mod native;
pub mod pty;
pub mod scrollback;
pub mod signal;

#[cfg(test)]
pub(crate) mod testing;

pub use backend::{
    Dimensions, ExitStatus, ProcessControl, ProcessWaiter, PtyBackend, SpawnRequest,
    SpawnedProcess,
};
pub use lifecycle::{
    restart, shutdown_all, GracefulShutdown, Restarted, ShutdownPhase, ShutdownPolicy,
    ShutdownReport,
};
pub use manager::{default_shell, Attached, CreateRequest, SessionManager, SessionSettings};
pub use multiplexer::{
    OverflowPolicy, SessionEvent, SessionOutputBroadcaster, SubscribeOptions, SubscriberId,
    SubscriberStats, Subscription,
};
pub use native::NativePtyBackend;
pub use pty::{Session, SessionError, SessionInfo, SessionKey};
pub use scrollback::Scrollback;
pub use signal::SignalKind;
