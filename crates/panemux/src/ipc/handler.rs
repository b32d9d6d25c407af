//! Dispatches IPC requests to the session manager.
//!
//! A connection is served request by request until it sends `Subscribe`.
//! From then on session output is pushed as it arrives while further
//! requests are still answered on the same connection.

use std::fmt::Display;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::messages::{decode_data, encode_data, IpcRequest, IpcResponse, IpcSessionInfo};
use super::server::{IpcConnection, IpcError};
use crate::session::{
    restart, CreateRequest, GracefulShutdown, SessionError, SessionEvent, SessionKey,
    SessionManager, ShutdownPolicy, SignalKind, SubscribeOptions,
};

/// Serves IPC connections against one [`SessionManager`].
pub struct RequestHandler {
    manager: Arc<SessionManager>,
    policy: ShutdownPolicy,
    shutdown: CancellationToken,
    started: Instant,
}

/// How a streaming phase ended.
enum StreamEnd {
    /// The session exited; the connection goes back to request mode.
    Finished,
    /// The client went away.
    Disconnected,
}

impl RequestHandler {
    /// `shutdown` is cancelled when a client sends `Stop`.
    pub fn new(
        manager: Arc<SessionManager>,
        policy: ShutdownPolicy,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            manager,
            policy,
            shutdown,
            started: Instant::now(),
        }
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    /// Serves one connection until the client disconnects.
    pub async fn serve_connection(&self, mut conn: IpcConnection) -> Result<(), IpcError> {
        loop {
            let request = match conn.read_request().await {
                Ok(Some(request)) => request,
                Ok(None) => return Ok(()),
                Err(IpcError::Io(e)) => return Err(IpcError::Io(e)),
                Err(e) => {
                    conn.send_response(&error_response(e)).await?;
                    continue;
                }
            };

            if let IpcRequest::Subscribe { key, replay } = request {
                match self.stream(&mut conn, &key, replay).await? {
                    StreamEnd::Finished => continue,
                    StreamEnd::Disconnected => return Ok(()),
                }
            } else {
                let response = self.handle(request).await;
                conn.send_response(&response).await?;
            }
        }
    }

    /// Answers a single request.
    ///
    /// `Subscribe` needs a connection and is answered with an error here.
    pub async fn handle(&self, request: IpcRequest) -> IpcResponse {
        debug!(?request, "Handling IPC request");

        match request {
            IpcRequest::Ping => IpcResponse::Pong,
            IpcRequest::Status => IpcResponse::Status {
                running: !self.shutdown.is_cancelled(),
                uptime_secs: self.started.elapsed().as_secs(),
                session_count: self.manager.count(),
                live_sessions: self.manager.live_count(),
                pid: std::process::id(),
            },
            IpcRequest::Stop => {
                info!("Stop requested over IPC");
                self.shutdown.cancel();
                IpcResponse::Stopping
            }
            IpcRequest::ListSessions => {
                let sessions = self
                    .manager
                    .list()
                    .await
                    .into_iter()
                    .map(IpcSessionInfo::from)
                    .collect();
                IpcResponse::Sessions { sessions }
            }
            IpcRequest::GetSession { key } => {
                let session = match self.manager.get(&key) {
                    Some(session) => Some(session.info().await.into()),
                    None => None,
                };
                IpcResponse::Session { session }
            }
            IpcRequest::CreateOrAttach {
                key,
                working_dir,
                cols,
                rows,
                initial_commands,
                program,
                args,
                env,
            } => {
                let key = match SessionKey::new(key) {
                    Ok(key) => key,
                    Err(e) => return error_response(e),
                };
                let mut request = CreateRequest::new(key, working_dir)
                    .with_size(cols, rows)
                    .with_initial_commands(initial_commands);
                if let Some(program) = program {
                    request = request.with_program(program, args);
                }
                for (name, value) in env {
                    request = request.with_env(name, value);
                }

                match self.manager.create_or_attach(request).await {
                    Ok(attached) => IpcResponse::Attached {
                        session: attached.session.info().await.into(),
                        spawned: attached.spawned,
                    },
                    Err(e) => error_response(e),
                }
            }
            IpcRequest::Write { key, data } => {
                let bytes = match decode_data(&data) {
                    Ok(bytes) => bytes,
                    Err(e) => return error_response(format!("invalid input encoding: {}", e)),
                };
                ok_or_error(self.manager.write(&key, &bytes).await)
            }
            IpcRequest::Resize { key, cols, rows } => {
                ok_or_error(self.manager.resize(&key, cols, rows).await)
            }
            IpcRequest::Signal { key, signal } => match signal.parse::<SignalKind>() {
                Ok(signal) => ok_or_error(self.manager.signal(&key, signal).await),
                Err(e) => error_response(e),
            },
            IpcRequest::Kill { key } => {
                let existed = self.manager.kill(&key).await;
                IpcResponse::Killed { key, existed }
            }
            IpcRequest::StopSession {
                key,
                grace_period_ms,
                kill_timeout_ms,
            } => {
                let key = match SessionKey::new(key) {
                    Ok(key) => key,
                    Err(e) => return error_response(e),
                };
                let mut policy = self.policy;
                if let Some(ms) = grace_period_ms {
                    policy.grace_period = Duration::from_millis(ms);
                }
                if let Some(ms) = kill_timeout_ms {
                    policy.kill_timeout = Duration::from_millis(ms);
                }

                let report = GracefulShutdown::new(Arc::clone(&self.manager), key, policy)
                    .run()
                    .await;
                IpcResponse::Stopped { report }
            }
            IpcRequest::Restart { key } => match restart(&self.manager, &key, self.policy).await {
                Ok(restarted) => IpcResponse::Attached {
                    session: restarted.attached.session.info().await.into(),
                    spawned: restarted.attached.spawned,
                },
                Err(e) => error_response(e),
            },
            IpcRequest::Subscribe { .. } => {
                error_response("subscribe is only available on a streaming connection")
            }
        }
    }

    async fn stream(
        &self,
        conn: &mut IpcConnection,
        key: &str,
        replay: bool,
    ) -> Result<StreamEnd, IpcError> {
        let options = SubscribeOptions {
            replay,
            ..SubscribeOptions::default()
        };
        let mut subscription = match self.manager.subscribe(key, options) {
            Ok(subscription) => subscription,
            Err(e) => {
                conn.send_response(&error_response(e)).await?;
                return Ok(StreamEnd::Finished);
            }
        };

        debug!(session_key = %key, subscriber = subscription.id(), "Streaming session output");
        conn.send_response(&IpcResponse::Subscribed {
            key: key.to_string(),
        })
        .await?;

        loop {
            tokio::select! {
                event = subscription.recv() => match event {
                    Some(SessionEvent::Data(chunk)) => {
                        conn.send_response(&IpcResponse::Output {
                            key: key.to_string(),
                            data: encode_data(&chunk),
                        })
                        .await?;
                    }
                    Some(SessionEvent::Exit(status)) => {
                        conn.send_response(&IpcResponse::Exited {
                            key: key.to_string(),
                            code: status.code,
                            signal: status.signal,
                        })
                        .await?;
                        return Ok(StreamEnd::Finished);
                    }
                    None => {
                        warn!(session_key = %key, "Subscriber detached after falling behind");
                        conn.send_response(&error_response("subscriber fell behind and was detached"))
                            .await?;
                        return Ok(StreamEnd::Finished);
                    }
                },
                request = conn.read_request() => match request {
                    Ok(Some(IpcRequest::Subscribe { .. })) => {
                        conn.send_response(&error_response("connection is already streaming")).await?;
                    }
                    Ok(Some(request)) => {
                        let response = self.handle(request).await;
                        conn.send_response(&response).await?;
                    }
                    Ok(None) => return Ok(StreamEnd::Disconnected),
                    Err(IpcError::Io(e)) => return Err(IpcError::Io(e)),
                    Err(e) => conn.send_response(&error_response(e)).await?,
                },
            }
        }
    }
}

fn error_response(error: impl Display) -> IpcResponse {
    IpcResponse::Error {
        message: error.to_string(),
    }
}

fn ok_or_error(result: Result<(), SessionError>) -> IpcResponse {
    match result {
        Ok(()) => IpcResponse::Ok,
        Err(e) => error_response(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::client::IpcClient;
    use crate::ipc::server::IpcServer;
    use crate::session::testing::FakeBackend;
    use crate::session::{ExitStatus, SessionSettings, ShutdownPhase};
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn handler(backend: &FakeBackend) -> RequestHandler {
        let settings = SessionSettings {
            default_shell: "/bin/sh".to_string(),
            exit_drain: Duration::from_millis(50),
            ..SessionSettings::default()
        };
        let manager = Arc::new(SessionManager::with_backend(Arc::new(backend.clone()), settings));
        let policy = ShutdownPolicy {
            grace_period: Duration::from_millis(100),
            kill_timeout: Duration::from_secs(2),
            restart_settle: Duration::from_millis(10),
        };
        RequestHandler::new(manager, policy, CancellationToken::new())
    }

    fn create(key: &str) -> IpcRequest {
        IpcRequest::CreateOrAttach {
            key: key.to_string(),
            working_dir: std::env::temp_dir(),
            cols: 100,
            rows: 30,
            initial_commands: vec![],
            program: None,
            args: vec![],
            env: vec![],
        }
    }

    #[tokio::test]
    async fn test_create_then_attach() {
        let backend = FakeBackend::new();
        let handler = handler(&backend);

        let IpcResponse::Attached { session, spawned } = handler.handle(create("shell:1")).await
        else {
            panic!("expected Attached");
        };
        assert!(spawned);
        assert_eq!((session.cols, session.rows), (100, 30));
        assert!(session.alive);

        let IpcResponse::Attached { spawned, .. } = handler.handle(create("shell:1")).await else {
            panic!("expected Attached");
        };
        assert!(!spawned);
        assert_eq!(backend.spawn_count(), 1);
    }

    #[tokio::test]
    async fn test_create_rejects_empty_key_and_missing_dir() {
        let backend = FakeBackend::new();
        let handler = handler(&backend);

        assert!(matches!(handler.handle(create("")).await, IpcResponse::Error { .. }));

        let response = handler
            .handle(IpcRequest::CreateOrAttach {
                key: "shell:1".to_string(),
                working_dir: PathBuf::from("/definitely/not/here"),
                cols: 80,
                rows: 24,
                initial_commands: vec![],
                program: None,
                args: vec![],
                env: vec![],
            })
            .await;
        assert!(matches!(response, IpcResponse::Error { .. }));
        assert_eq!(handler.manager().count(), 0);
    }

    #[tokio::test]
    async fn test_write_decodes_base64() {
        let backend = FakeBackend::new();
        let handler = handler(&backend);
        handler.handle(create("shell:1")).await;

        let response = handler
            .handle(IpcRequest::Write {
                key: "shell:1".to_string(),
                data: encode_data(b"echo hi\n"),
            })
            .await;
        assert_eq!(response, IpcResponse::Ok);
        assert!(backend.last().written().contains("echo hi\n"));

        let response = handler
            .handle(IpcRequest::Write {
                key: "shell:1".to_string(),
                data: "%%%".to_string(),
            })
            .await;
        assert!(matches!(response, IpcResponse::Error { .. }));
    }

    #[tokio::test]
    async fn test_signal_parsing() {
        let backend = FakeBackend::new();
        let handler = handler(&backend);
        handler.handle(create("shell:1")).await;

        let response = handler
            .handle(IpcRequest::Signal {
                key: "shell:1".to_string(),
                signal: "SIGINT".to_string(),
            })
            .await;
        assert_eq!(response, IpcResponse::Ok);
        assert_eq!(backend.last().signals(), vec![SignalKind::Interrupt]);

        let response = handler
            .handle(IpcRequest::Signal {
                key: "shell:1".to_string(),
                signal: "SIGWINCHX".to_string(),
            })
            .await;
        assert!(matches!(response, IpcResponse::Error { ref message } if message.contains("unknown signal")));
    }

    #[tokio::test]
    async fn test_unknown_session_errors() {
        let backend = FakeBackend::new();
        let handler = handler(&backend);

        let response = handler
            .handle(IpcRequest::Write {
                key: "nope".to_string(),
                data: encode_data(b"ls\n"),
            })
            .await;
        assert!(matches!(response, IpcResponse::Error { ref message } if message.contains("not found")));

        // Resize races with exit, so an absent session is not an error.
        let response = handler
            .handle(IpcRequest::Resize {
                key: "nope".to_string(),
                cols: 80,
                rows: 24,
            })
            .await;
        assert_eq!(response, IpcResponse::Ok);

        assert_eq!(
            handler.handle(IpcRequest::GetSession { key: "nope".to_string() }).await,
            IpcResponse::Session { session: None }
        );
        assert_eq!(
            handler.handle(IpcRequest::Kill { key: "nope".to_string() }).await,
            IpcResponse::Killed {
                key: "nope".to_string(),
                existed: false
            }
        );
    }

    #[tokio::test]
    async fn test_stop_session_reports_phases() {
        let backend = FakeBackend::new();
        let handler = handler(&backend);
        handler.handle(create("dev:1")).await;

        let response = handler
            .handle(IpcRequest::StopSession {
                key: "dev:1".to_string(),
                grace_period_ms: Some(200),
                kill_timeout_ms: None,
            })
            .await;
        let IpcResponse::Stopped { report } = response else {
            panic!("expected Stopped, got {:?}", response);
        };
        assert!(report.existed);
        assert!(!report.forced);
        assert_eq!(report.phases.last(), Some(&ShutdownPhase::Reaped));
        assert!(handler.manager().get("dev:1").is_none());
    }

    #[tokio::test]
    async fn test_restart_spawns_new_instance() {
        let backend = FakeBackend::new();
        let handler = handler(&backend);
        let IpcResponse::Attached { session: first, .. } = handler.handle(create("dev:1")).await
        else {
            panic!("expected Attached");
        };

        let IpcResponse::Attached { session, spawned } = handler
            .handle(IpcRequest::Restart {
                key: "dev:1".to_string(),
            })
            .await
        else {
            panic!("expected Attached");
        };
        assert!(spawned);
        assert_ne!(session.instance_id, first.instance_id);
        assert_eq!(backend.spawn_count(), 2);
    }

    #[tokio::test]
    async fn test_stop_cancels_token() {
        let backend = FakeBackend::new();
        let handler = handler(&backend);

        assert!(matches!(
            handler.handle(IpcRequest::Status).await,
            IpcResponse::Status { running: true, .. }
        ));
        assert_eq!(handler.handle(IpcRequest::Stop).await, IpcResponse::Stopping);
        assert!(handler.shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn test_streaming_connection() {
        let backend = FakeBackend::new();
        let handler = Arc::new(handler(&backend));
        handler.handle(create("shell:1")).await;
        backend.last().emit(b"before\n");

        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("test.sock");
        let server = IpcServer::bind(&socket_path).await.unwrap();
        let serving = Arc::clone(&handler);
        let server_task = tokio::spawn(async move {
            let conn = server.accept().await.unwrap();
            serving.serve_connection(conn).await
        });

        let mut client = IpcClient::connect(&socket_path).await.unwrap();
        client.subscribe("shell:1", true).await.unwrap();

        let replayed = client.next_event().await.unwrap();
        assert_eq!(
            replayed,
            IpcResponse::Output {
                key: "shell:1".to_string(),
                data: encode_data(b"before\n"),
            }
        );

        // Requests are still answered while streaming.
        client
            .send_streaming(IpcRequest::Write {
                key: "shell:1".to_string(),
                data: encode_data(b"x"),
            })
            .await
            .unwrap();
        assert_eq!(client.next_event().await.unwrap(), IpcResponse::Ok);

        backend.last().emit(b"live\n");
        assert_eq!(
            client.next_event().await.unwrap(),
            IpcResponse::Output {
                key: "shell:1".to_string(),
                data: encode_data(b"live\n"),
            }
        );

        backend.last().exit(ExitStatus::with_code(3));
        assert_eq!(
            client.next_event().await.unwrap(),
            IpcResponse::Exited {
                key: "shell:1".to_string(),
                code: Some(3),
                signal: None,
            }
        );

        // Back in request mode.
        assert!(client.ping().await.unwrap());
        drop(client);
        server_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_subscribe_to_missing_session() {
        let backend = FakeBackend::new();
        let handler = Arc::new(handler(&backend));

        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("test.sock");
        let server = IpcServer::bind(&socket_path).await.unwrap();
        let serving = Arc::clone(&handler);
        tokio::spawn(async move {
            let conn = server.accept().await.unwrap();
            let _ = serving.serve_connection(conn).await;
        });

        let mut client = IpcClient::connect(&socket_path).await.unwrap();
        let err = client.subscribe("ghost", true).await.unwrap_err();
        assert!(matches!(err, IpcError::Remote(ref m) if m.contains("not found")));
        assert!(client.ping().await.unwrap());
    }
}
