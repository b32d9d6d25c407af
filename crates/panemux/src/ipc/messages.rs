//! IPC message types for CLI-host communication.
//!
//! Terminal bytes travel base64-encoded so every message stays a single
//! line of JSON.

use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::session::{ExitStatus, SessionInfo, ShutdownReport};

/// Requests that can be sent from the CLI to the host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum IpcRequest {
    /// Check if the host is alive.
    Ping,
    /// Get the current status of the host.
    Status,
    /// Request the host to shut every session down and exit.
    Stop,
    /// List all registered sessions.
    ListSessions,
    /// Describe one session.
    GetSession { key: String },
    /// Return the live session for `key`, spawning one if needed.
    CreateOrAttach {
        key: String,
        working_dir: PathBuf,
        cols: u16,
        rows: u16,
        #[serde(default)]
        initial_commands: Vec<String>,
        #[serde(default)]
        program: Option<String>,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: Vec<(String, String)>,
    },
    /// Send input. `data` is base64.
    Write { key: String, data: String },
    Resize { key: String, cols: u16, rows: u16 },
    /// `signal` accepts `"SIGTERM"`, `"term"` or `"15"`.
    Signal { key: String, signal: String },
    /// Kill immediately and forget the session.
    Kill { key: String },
    /// Graceful shutdown. Missing timeouts use the host's policy.
    StopSession {
        key: String,
        #[serde(default)]
        grace_period_ms: Option<u64>,
        #[serde(default)]
        kill_timeout_ms: Option<u64>,
    },
    /// Graceful shutdown followed by a respawn from the original request.
    Restart { key: String },
    /// Switch the connection to streaming mode for `key`.
    Subscribe {
        key: String,
        #[serde(default = "default_replay")]
        replay: bool,
    },
}

fn default_replay() -> bool {
    true
}

/// Responses sent from the host to the CLI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum IpcResponse {
    /// Response to a Ping request.
    Pong,
    /// Current host status.
    Status {
        running: bool,
        uptime_secs: u64,
        /// Registered sessions, dead or alive.
        session_count: usize,
        live_sessions: usize,
        pid: u32,
    },
    /// Acknowledgment that the host is stopping.
    Stopping,
    Sessions { sessions: Vec<IpcSessionInfo> },
    Session { session: Option<IpcSessionInfo> },
    Attached {
        session: IpcSessionInfo,
        /// `false` when an existing live session was returned.
        spawned: bool,
    },
    /// The request succeeded and has nothing to report.
    Ok,
    Killed { key: String, existed: bool },
    Stopped { report: ShutdownReport },
    /// Streaming started; `Output` and finally `Exited` follow.
    Subscribed { key: String },
    /// A chunk of session output. `data` is base64.
    Output { key: String, data: String },
    Exited {
        key: String,
        code: Option<i32>,
        signal: Option<String>,
    },
    /// An error occurred processing the request.
    Error { message: String },
}

/// Session description for IPC communication.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IpcSessionInfo {
    pub key: String,
    pub instance_id: String,
    pub pid: Option<u32>,
    pub program: String,
    pub working_dir: PathBuf,
    pub cols: u16,
    pub rows: u16,
    pub alive: bool,
    pub exit_code: Option<i32>,
    pub exit_signal: Option<String>,
    /// Unix milliseconds.
    pub created_at: u64,
    /// Unix milliseconds of the last output.
    pub last_activity: u64,
    pub subscribers: usize,
    pub scrollback_chunks: usize,
}

impl From<SessionInfo> for IpcSessionInfo {
    fn from(info: SessionInfo) -> Self {
        let (exit_code, exit_signal) = match info.exit {
            Some(ExitStatus { code, signal }) => (code, signal),
            None => (None, None),
        };
        Self {
            key: info.key.to_string(),
            instance_id: info.instance_id.to_string(),
            pid: info.pid,
            program: info.program,
            working_dir: info.working_dir,
            cols: info.size.cols,
            rows: info.size.rows,
            alive: info.alive,
            exit_code,
            exit_signal,
            created_at: info.created_at,
            last_activity: info.last_activity,
            subscribers: info.subscribers,
            scrollback_chunks: info.scrollback_chunks,
        }
    }
}

/// Encodes terminal bytes for the wire.
pub fn encode_data(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// Decodes terminal bytes from the wire.
pub fn decode_data(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD.decode(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Dimensions, SessionKey, ShutdownPhase};

    #[test]
    fn test_unit_requests_are_bare_strings() {
        for (request, expected) in [
            (IpcRequest::Ping, r#""Ping""#),
            (IpcRequest::Status, r#""Status""#),
            (IpcRequest::Stop, r#""Stop""#),
            (IpcRequest::ListSessions, r#""ListSessions""#),
        ] {
            let json = serde_json::to_string(&request).unwrap();
            assert_eq!(json, expected);
            let deserialized: IpcRequest = serde_json::from_str(&json).unwrap();
            assert_eq!(deserialized, request);
        }
    }

    #[test]
    fn test_create_or_attach_defaults() {
        let json = r#"{"CreateOrAttach":{"key":"shell:1","working_dir":"/tmp","cols":80,"rows":24}}"#;
        let request: IpcRequest = serde_json::from_str(json).unwrap();
        assert_eq!(
            request,
            IpcRequest::CreateOrAttach {
                key: "shell:1".to_string(),
                working_dir: PathBuf::from("/tmp"),
                cols: 80,
                rows: 24,
                initial_commands: vec![],
                program: None,
                args: vec![],
                env: vec![],
            }
        );
    }

    #[test]
    fn test_subscribe_replays_by_default() {
        let request: IpcRequest = serde_json::from_str(r#"{"Subscribe":{"key":"dev:1"}}"#).unwrap();
        assert_eq!(
            request,
            IpcRequest::Subscribe {
                key: "dev:1".to_string(),
                replay: true
            }
        );
    }

    #[test]
    fn test_stop_session_optional_timeouts() {
        let request: IpcRequest =
            serde_json::from_str(r#"{"StopSession":{"key":"dev:1","grace_period_ms":50}}"#).unwrap();
        assert_eq!(
            request,
            IpcRequest::StopSession {
                key: "dev:1".to_string(),
                grace_period_ms: Some(50),
                kill_timeout_ms: None,
            }
        );
    }

    #[test]
    fn test_output_carries_base64() {
        let response = IpcResponse::Output {
            key: "shell:1".to_string(),
            data: encode_data(b"\x1b[31mred\x1b[0m\n"),
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(!json.contains('\n'));

        let IpcResponse::Output { data, .. } = serde_json::from_str(&json).unwrap() else {
            panic!("expected Output");
        };
        assert_eq!(decode_data(&data).unwrap(), b"\x1b[31mred\x1b[0m\n");
        assert!(decode_data("not base64!").is_err());
    }

    #[test]
    fn test_stopped_report_serialization() {
        let response = IpcResponse::Stopped {
            report: ShutdownReport {
                key: SessionKey::new("dev:1").unwrap(),
                existed: true,
                phases: vec![ShutdownPhase::TerminateRequested, ShutdownPhase::Reaped],
                exit: Some(ExitStatus::with_signal("Terminated")),
                forced: false,
            },
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("terminate_requested"));

        let deserialized: IpcResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, response);
    }

    #[test]
    fn test_response_error_serialization() {
        let response = IpcResponse::Error {
            message: "Something went wrong".to_string(),
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("Error"));
        assert!(json.contains("Something went wrong"));

        let deserialized: IpcResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, response);
    }

    #[test]
    fn test_session_info_conversion() {
        let info = SessionInfo {
            key: SessionKey::new("shell:9").unwrap(),
            instance_id: uuid::Uuid::nil(),
            pid: Some(4242),
            program: "/bin/sh".to_string(),
            working_dir: PathBuf::from("/tmp"),
            size: Dimensions::new(120, 40),
            alive: false,
            exit: Some(ExitStatus::with_code(1)),
            created_at: 1_700_000_000_000,
            last_activity: 1_700_000_000_500,
            subscribers: 2,
            scrollback_chunks: 7,
        };

        let ipc = IpcSessionInfo::from(info);
        assert_eq!(ipc.key, "shell:9");
        assert_eq!(ipc.instance_id, "00000000-0000-0000-0000-000000000000");
        assert_eq!((ipc.cols, ipc.rows), (120, 40));
        assert_eq!(ipc.exit_code, Some(1));
        assert_eq!(ipc.exit_signal, None);
        assert!(!ipc.alive);
    }
}
