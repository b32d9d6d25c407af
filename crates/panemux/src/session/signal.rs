//! Signals that callers may deliver to a session's process group.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::pty::SessionError;

/// The closed set of signals the multiplexer forwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalKind {
    /// SIGTERM: ask the process to exit.
    #[serde(rename = "TERM")]
    Terminate,
    /// SIGKILL: cannot be caught.
    Kill,
    /// SIGINT, what Ctrl+C sends.
    #[serde(rename = "INT")]
    Interrupt,
    /// SIGHUP, what closing the terminal sends.
    #[serde(rename = "HUP")]
    Hangup,
    Quit,
}

impl SignalKind {
    pub const ALL: [SignalKind; 5] = [
        SignalKind::Terminate,
        SignalKind::Kill,
        SignalKind::Interrupt,
        SignalKind::Hangup,
        SignalKind::Quit,
    ];

    /// Conventional name without the `SIG` prefix.
    pub fn name(&self) -> &'static str {
        match self {
            SignalKind::Terminate => "TERM",
            SignalKind::Kill => "KILL",
            SignalKind::Interrupt => "INT",
            SignalKind::Hangup => "HUP",
            SignalKind::Quit => "QUIT",
        }
    }

    /// POSIX signal number.
    pub fn number(&self) -> i32 {
        match self {
            SignalKind::Hangup => 1,
            SignalKind::Interrupt => 2,
            SignalKind::Quit => 3,
            SignalKind::Kill => 9,
            SignalKind::Terminate => 15,
        }
    }

    #[cfg(unix)]
    pub(crate) fn to_nix(self) -> nix::sys::signal::Signal {
        use nix::sys::signal::Signal;

        match self {
            SignalKind::Terminate => Signal::SIGTERM,
            SignalKind::Kill => Signal::SIGKILL,
            SignalKind::Interrupt => Signal::SIGINT,
            SignalKind::Hangup => Signal::SIGHUP,
            SignalKind::Quit => Signal::SIGQUIT,
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIG{}", self.name())
    }
}

/// Accepts `"SIGTERM"`, `"TERM"`, `"term"` or the numeric form `"15"`.
impl FromStr for SignalKind {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();

        if let Ok(num) = trimmed.parse::<i32>() {
            return SignalKind::ALL
                .into_iter()
                .find(|kind| kind.number() == num)
                .ok_or_else(|| SessionError::UnknownSignal(s.to_string()));
        }

        let upper = trimmed.to_uppercase();
        let name = upper.strip_prefix("SIG").unwrap_or(&upper);

        SignalKind::ALL
            .into_iter()
            .find(|kind| kind.name() == name)
            .ok_or_else(|| SessionError::UnknownSignal(s.to_string()))
    }
}
