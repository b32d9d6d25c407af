//! Session registry.
//!
//! [`SessionManager`] maps logical keys to pty sessions. It is thread-safe
//! and meant to be shared behind an `Arc`. Lifecycle changes for one key
//! (create, replace, kill) are serialized through a per-key async lock, so a
//! kill racing a create can never leave a live process outside the registry.

use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::backend::{Dimensions, PtyBackend, SpawnRequest};
use super::multiplexer::{
    OverflowPolicy, SessionOutputBroadcaster, SubscribeOptions, Subscription,
    DEFAULT_SUBSCRIBER_CAPACITY,
};
use super::native::NativePtyBackend;
use super::pty::{Session, SessionError, SessionInfo, SessionKey};
use super::scrollback::{Scrollback, DEFAULT_SCROLLBACK_BYTES, DEFAULT_SCROLLBACK_CHUNKS};
use super::signal::SignalKind;

/// Default cap on live sessions.
pub const DEFAULT_MAX_SESSIONS: usize = 64;

/// Default time the exit watcher waits for buffered output after exit.
pub const DEFAULT_EXIT_DRAIN: Duration = Duration::from_millis(250);

/// Returns `$SHELL`, or `/bin/sh` when unset.
pub fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string())
}

/// Manager-wide settings applied to every session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Program used when a request does not name one.
    pub default_shell: String,
    /// Live sessions allowed at once. Dead entries do not count.
    pub max_sessions: usize,
    pub scrollback_chunks: usize,
    pub scrollback_bytes: usize,
    pub subscriber_capacity: usize,
    pub overflow: OverflowPolicy,
    pub term: String,
    pub exit_drain: Duration,
    /// Environment added to every spawned process, before per-request env.
    pub env: Vec<(String, String)>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            default_shell: default_shell(),
            max_sessions: DEFAULT_MAX_SESSIONS,
            scrollback_chunks: DEFAULT_SCROLLBACK_CHUNKS,
            scrollback_bytes: DEFAULT_SCROLLBACK_BYTES,
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
            overflow: OverflowPolicy::default(),
            term: "xterm-256color".to_string(),
            exit_drain: DEFAULT_EXIT_DRAIN,
            env: Vec::new(),
        }
    }
}

/// Parameters of `create_or_attach`. Kept by the session for restarts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateRequest {
    pub key: SessionKey,
    pub working_dir: PathBuf,
    pub size: Dimensions,
    /// Written to the process, each followed by a newline, right after spawn.
    pub initial_commands: Vec<String>,
    /// Defaults to the configured shell.
    pub program: Option<String>,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl CreateRequest {
    pub fn new(key: SessionKey, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            key,
            working_dir: working_dir.into(),
            size: Dimensions::default(),
            initial_commands: Vec::new(),
            program: None,
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn with_size(mut self, cols: u16, rows: u16) -> Self {
        self.size = Dimensions::new(cols, rows);
        self
    }

    pub fn with_initial_commands<I, S>(mut self, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.initial_commands = commands.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_program<I, S>(mut self, program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.program = Some(program.into());
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Result of [`SessionManager::create_or_attach`].
#[derive(Debug, Clone)]
pub struct Attached {
    pub session: Arc<Session>,
    /// `true` when a new process was started for this call.
    pub spawned: bool,
}

/// Registry of pty sessions keyed by [`SessionKey`].
pub struct SessionManager {
    backend: Arc<dyn PtyBackend>,
    settings: SessionSettings,
    sessions: DashMap<SessionKey, Arc<Session>>,
    key_locks: DashMap<SessionKey, Arc<Mutex<()>>>,
    /// Spawns admitted under the session limit but not registered yet.
    pending_spawns: StdMutex<usize>,
}

/// Holds one admitted spawn against the session limit until dropped.
struct SpawnSlot<'a> {
    pending: &'a StdMutex<usize>,
}

impl Drop for SpawnSlot<'_> {
    fn drop(&mut self) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        *pending = pending.saturating_sub(1);
    }
}

impl SessionManager {
    /// Creates a manager spawning real processes.
    pub fn new(settings: SessionSettings) -> Self {
        let backend = Arc::new(NativePtyBackend::with_term(settings.term.clone()));
        Self::with_backend(backend, settings)
    }

    pub fn with_backend(backend: Arc<dyn PtyBackend>, settings: SessionSettings) -> Self {
        Self {
            backend,
            settings,
            sessions: DashMap::new(),
            key_locks: DashMap::new(),
            pending_spawns: StdMutex::new(0),
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    async fn lock_key(&self, key: &SessionKey) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(self.key_locks.entry(key.clone()).or_default().value());
        lock.lock_owned().await
    }

    fn release_key(&self, key: &SessionKey, guard: OwnedMutexGuard<()>) {
        drop(guard);
        // Only the map still holds the lock: nobody is waiting on it.
        self.key_locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Admits one spawn if live sessions plus in-flight spawns stay under
    /// the limit.
    fn reserve_spawn(&self, key: &SessionKey) -> Result<SpawnSlot<'_>, SessionError> {
        let mut pending = self
            .pending_spawns
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let live = self.live_count();
        if live + *pending >= self.settings.max_sessions {
            tracing::warn!(session_key = %key, live, pending = *pending, "Session limit reached");
            return Err(SessionError::LimitReached(self.settings.max_sessions));
        }
        *pending += 1;
        Ok(SpawnSlot {
            pending: &self.pending_spawns,
        })
    }

    /// Returns the live session registered under the key, or spawns one.
    ///
    /// A dead session still registered under the key is replaced. Spawn
    /// failures leave the registry untouched.
    pub async fn create_or_attach(&self, request: CreateRequest) -> Result<Attached, SessionError> {
        if !request.size.is_valid() {
            return Err(SessionError::InvalidDimensions {
                cols: request.size.cols,
                rows: request.size.rows,
            });
        }

        let key = request.key.clone();
        let guard = self.lock_key(&key).await;
        let result = self.create_locked(request).await;
        self.release_key(&key, guard);
        result
    }

    async fn create_locked(&self, request: CreateRequest) -> Result<Attached, SessionError> {
        let key = request.key.clone();

        if let Some(existing) = self.get(key.as_str()) {
            if existing.is_alive() {
                tracing::debug!(session_key = %key, "Attached to existing session");
                return Ok(Attached {
                    session: existing,
                    spawned: false,
                });
            }
            tracing::debug!(
                session_key = %key,
                instance_id = %existing.instance_id(),
                "Replacing exited session"
            );
            self.sessions.remove(&key);
        }

        let slot = self.reserve_spawn(&key)?;

        let program = request
            .program
            .clone()
            .unwrap_or_else(|| self.settings.default_shell.clone());
        let mut env = self.settings.env.clone();
        env.extend(request.env.iter().cloned());

        let spawn_request = SpawnRequest {
            program: program.clone(),
            args: request.args.clone(),
            working_dir: request.working_dir.clone(),
            env,
            size: request.size,
        };
        let spawn_error = |source: io::Error| SessionError::Spawn {
            program: program.clone(),
            working_dir: request.working_dir.clone(),
            source,
        };

        let backend = Arc::clone(&self.backend);
        let process = tokio::task::spawn_blocking(move || backend.spawn(&spawn_request))
            .await
            .map_err(|e| io::Error::other(e.to_string()))
            .and_then(|spawned| spawned)
            .map_err(|source| {
                tracing::warn!(session_key = %key, error = %source, "Failed to spawn session");
                spawn_error(source)
            })?;

        let output = Arc::new(SessionOutputBroadcaster::new(
            key.to_string(),
            Scrollback::new(self.settings.scrollback_chunks, self.settings.scrollback_bytes),
            self.settings.overflow,
            self.settings.subscriber_capacity,
        ));

        let session = Session::start(
            request.clone(),
            program.clone(),
            process,
            output,
            self.settings.exit_drain,
        )
        .map_err(spawn_error)?;

        self.sessions.insert(key.clone(), Arc::clone(&session));
        // Registered sessions count through `live_count` from here on.
        drop(slot);

        for command in &request.initial_commands {
            let line = format!("{}\n", command);
            if let Err(e) = session.write(line.as_bytes()).await {
                tracing::warn!(session_key = %key, error = %e, "Failed to send initial command");
                break;
            }
        }

        Ok(Attached {
            session,
            spawned: true,
        })
    }

    /// Looks a session up. Never blocks and never spawns.
    pub fn get(&self, key: &str) -> Option<Arc<Session>> {
        self.sessions.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Writes input to a session.
    pub async fn write(&self, key: &str, data: &[u8]) -> Result<(), SessionError> {
        let session = self
            .get(key)
            .ok_or_else(|| SessionError::NotFound(key.to_string()))?;
        session.write(data).await
    }

    /// Resizes a session. Absent and exited sessions are ignored.
    pub async fn resize(&self, key: &str, cols: u16, rows: u16) -> Result<(), SessionError> {
        let size = Dimensions::new(cols, rows);
        if !size.is_valid() {
            return Err(SessionError::InvalidDimensions { cols, rows });
        }
        match self.get(key) {
            Some(session) => session.resize(size).await.map(|_| ()),
            None => Ok(()),
        }
    }

    /// Signals a session's process group. Absent and exited sessions are
    /// ignored.
    pub async fn signal(&self, key: &str, signal: SignalKind) -> Result<(), SessionError> {
        match self.get(key) {
            Some(session) => session.signal(signal).await.map(|_| ()),
            None => Ok(()),
        }
    }

    /// Removes a session, killing its process if still running.
    ///
    /// No output is published after this returns; the exit event still
    /// reaches subscribers once the process is gone. Returns whether an
    /// entry existed.
    pub async fn kill(&self, key: &str) -> bool {
        self.remove(key, None).await
    }

    /// Like [`kill`](Self::kill), but only if the registered session is the
    /// instance `instance_id`. A session that replaced it is left alone.
    pub async fn kill_instance(&self, key: &str, instance_id: Uuid) -> bool {
        self.remove(key, Some(instance_id)).await
    }

    async fn remove(&self, key: &str, instance_id: Option<Uuid>) -> bool {
        let Ok(key) = SessionKey::new(key) else {
            return false;
        };

        let guard = self.lock_key(&key).await;
        let removed = self
            .sessions
            .remove_if(&key, |_, session| {
                instance_id.map_or(true, |id| session.instance_id() == id)
            })
            .map(|(_, session)| session);
        let existed = match removed {
            Some(session) => {
                session.close_output();
                if session.is_alive() {
                    if let Err(e) = session.signal(SignalKind::Kill).await {
                        tracing::warn!(session_key = %key, error = %e, "Failed to kill session");
                    }
                }
                tracing::info!(session_key = %key, pid = ?session.pid(), "Session killed");
                true
            }
            None => false,
        };
        self.release_key(&key, guard);
        existed
    }

    /// Attaches a subscriber to a session's output.
    pub fn subscribe(&self, key: &str, options: SubscribeOptions) -> Result<Subscription, SessionError> {
        self.get(key)
            .map(|session| session.subscribe(options))
            .ok_or_else(|| SessionError::NotFound(key.to_string()))
    }

    /// Snapshot of every registered session, ordered by key.
    pub async fn list(&self) -> Vec<SessionInfo> {
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut infos = Vec::with_capacity(sessions.len());
        for session in sessions {
            infos.push(session.info().await);
        }
        infos.sort_by(|a, b| a.key.cmp(&b.key));
        infos
    }

    pub fn keys(&self) -> Vec<SessionKey> {
        let mut keys: Vec<SessionKey> = self.sessions.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Registered sessions, dead or alive.
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    pub fn live_count(&self) -> usize {
        self.sessions.iter().filter(|e| e.value().is_alive()).count()
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        let mut killed = 0;
        for entry in self.sessions.iter() {
            if entry.value().is_alive() && entry.value().force_kill() {
                killed += 1;
            }
        }
        if killed > 0 {
            tracing::debug!(killed, "Killed live sessions on manager drop");
        }
    }
}
