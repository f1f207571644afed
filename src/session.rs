//! Session lifecycle and the process-wide session registry.
//!
//! A `Session` binds one child process to a host-owned pseudoconsole and
//! fans its output out to any number of subscribers. Sessions outlive
//! client attachments; detaching is the normal exit path for a client.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{self, Config};
use crate::fanout::{Fanout, OutputSink, SinkId};
use crate::protocol::{SessionState, SessionSummary};
use crate::pty::{self, Pty, PtyError};
use crate::ring::RING_CAPACITY;

pub const DEFAULT_COLS: u16 = 120;
pub const DEFAULT_ROWS: u16 = 30;

/// Capacity of the per-session input channel. The dispatcher awaits on a
/// full channel, which backpressures one client's input without stalling
/// the PTY for anyone else.
const INPUT_CHANNEL_CAPACITY: usize = 64;

/// Inputs for creating a session, before defaults are applied.
#[derive(Debug, Clone, Default)]
pub struct CreateRequest {
    pub name: Option<String>,
    pub shell: Option<String>,
    pub cwd: Option<String>,
    pub env: Option<HashMap<String, String>>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
}

/// Fully-resolved spawn parameters.
pub(crate) struct SessionSpec {
    pub id: String,
    pub name: String,
    pub shell: String,
    pub cwd: String,
    pub env: HashMap<String, String>,
    pub cols: u16,
    pub rows: u16,
    /// Read-loop chunk size (the configured `bufferSize`).
    pub read_chunk: usize,
}

enum Lifecycle {
    Running,
    Exited { code: u32 },
}

struct SessionInner {
    id: String,
    name: String,
    shell: String,
    cwd: String,
    pid: Option<u32>,
    created_at: DateTime<Utc>,
    last_active: Mutex<DateTime<Utc>>,
    dims: Mutex<(u16, u16)>,
    state: RwLock<Lifecycle>,
    fanout: Fanout,
    /// Taken (closed) on exit so the writer task drains and stops.
    input_tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    /// Dropped on exit; releasing the master closes the pseudoconsole.
    pty: Mutex<Option<Pty>>,
    killer: Mutex<Option<Box<dyn portable_pty::ChildKiller + Send + Sync>>>,
    cancelled: CancellationToken,
}

impl SessionInner {
    fn touch(&self) {
        *self.last_active.lock() = Utc::now();
    }

    /// One-way transition to Exited. Idempotent: the first caller releases
    /// the PTY resources and notifies subscribers, later calls are no-ops.
    fn transition_exited(&self, code: u32) {
        {
            let mut state = self.state.write();
            if matches!(*state, Lifecycle::Exited { .. }) {
                return;
            }
            *state = Lifecycle::Exited { code };
        }
        *self.input_tx.lock() = None;
        *self.pty.lock() = None;
        *self.killer.lock() = None;
        self.cancelled.cancel();
        self.fanout.notify_exit(code);
        self.fanout.clear_sinks();
        tracing::info!(session = %self.id, name = %self.name, code, "session exited");
    }
}

/// One pseudoconsole, one child process, and the listener set fed by its
/// output. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("pid", &self.inner.pid)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Spawn a session: open the pseudoconsole, start the child, and start
    /// the read loop, the input writer, and the child-exit waiter.
    pub(crate) fn spawn(spec: SessionSpec) -> Result<Self, PtyError> {
        let cmd = pty::build_command(&pty::SpawnSpec {
            shell: spec.shell.clone(),
            cwd: spec.cwd.clone(),
            env: spec.env,
            session_name: spec.name.clone(),
        });
        let spawned = pty::spawn(spec.cols, spec.rows, cmd)?;

        let (input_tx, mut input_rx) = mpsc::channel::<Bytes>(INPUT_CHANNEL_CAPACITY);
        let now = Utc::now();
        let inner = Arc::new(SessionInner {
            id: spec.id,
            name: spec.name,
            shell: spec.shell,
            cwd: spec.cwd,
            pid: spawned.pid,
            created_at: now,
            last_active: Mutex::new(now),
            dims: Mutex::new((spec.cols, spec.rows)),
            state: RwLock::new(Lifecycle::Running),
            fanout: Fanout::new(RING_CAPACITY),
            input_tx: Mutex::new(Some(input_tx)),
            pty: Mutex::new(Some(spawned.pty)),
            killer: Mutex::new(Some(spawned.killer)),
            cancelled: CancellationToken::new(),
        });

        // PTY read loop: publish chunks to the fan-out until EOF.
        {
            let inner = Arc::clone(&inner);
            let mut reader = spawned.reader;
            let chunk = spec.read_chunk.max(1);
            tokio::task::spawn_blocking(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    use std::io::Read;
                    let mut buf = vec![0u8; chunk];
                    loop {
                        match reader.read(&mut buf) {
                            Ok(0) => break,
                            Ok(n) => {
                                inner.fanout.publish(Bytes::copy_from_slice(&buf[..n]));
                                inner.touch();
                            }
                            Err(e) => {
                                tracing::debug!(session = %inner.id, error = %e, "pty read ended");
                                break;
                            }
                        }
                    }
                }));
                if let Err(e) = result {
                    tracing::error!("pty reader task panicked: {:?}", e);
                }
            });
        }

        // Input writer: a single drain task serializes all PTY writes.
        {
            let mut writer = spawned.writer;
            tokio::task::spawn_blocking(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    use std::io::Write;
                    while let Some(data) = input_rx.blocking_recv() {
                        if writer.write_all(&data).is_err() {
                            break;
                        }
                        let _ = writer.flush();
                    }
                }));
                if let Err(e) = result {
                    tracing::error!("pty writer task panicked: {:?}", e);
                }
            });
        }

        // Waiter: observe child exit and drive the state transition.
        {
            let inner = Arc::clone(&inner);
            let mut child = spawned.child;
            tokio::task::spawn_blocking(move || {
                let code = match child.wait() {
                    Ok(status) => status.exit_code(),
                    Err(e) => {
                        tracing::error!(session = %inner.id, error = %e, "error waiting for child");
                        1
                    }
                };
                inner.transition_exited(code);
            });
        }

        Ok(Self { inner })
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner.pid
    }

    pub fn state(&self) -> SessionState {
        match *self.inner.state.read() {
            Lifecycle::Running => SessionState::Running,
            Lifecycle::Exited { .. } => SessionState::Exited,
        }
    }

    pub fn exit_code(&self) -> Option<u32> {
        match *self.inner.state.read() {
            Lifecycle::Running => None,
            Lifecycle::Exited { code } => Some(code),
        }
    }

    /// Fires when the session has exited.
    pub fn cancelled(&self) -> CancellationToken {
        self.inner.cancelled.clone()
    }

    /// Queue bytes for the PTY input handle and advance last-active-at.
    /// Ignored once the session has exited (the channel is closed).
    pub async fn write_input(&self, data: Bytes) {
        let tx = self.inner.input_tx.lock().clone();
        if let Some(tx) = tx {
            if tx.send(data).await.is_ok() {
                self.inner.touch();
            }
        }
    }

    /// Update dimensions and resize the pseudoconsole. No listener
    /// notification. Ignored after exit.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        let cols = cols.max(1);
        let rows = rows.max(1);
        *self.inner.dims.lock() = (cols, rows);
        let pty = self.inner.pty.lock();
        match pty.as_ref() {
            Some(pty) => pty.resize(cols, rows),
            None => Ok(()),
        }
    }

    /// Register an output sink. If the ring buffer is non-empty the sink
    /// receives the current tail before any later chunk.
    pub fn add_sink(&self, sink: Arc<dyn OutputSink>) -> SinkId {
        self.inner.fanout.add_sink(sink)
    }

    pub fn remove_sink(&self, id: SinkId) {
        self.inner.fanout.remove_sink(id)
    }

    pub fn sink_count(&self) -> usize {
        self.inner.fanout.sink_count()
    }

    /// Best-effort termination of the process tree rooted at the child.
    /// Errors are swallowed; the actual state transition happens through
    /// the waiter when the child exits.
    pub fn kill(&self) {
        if let Some(pid) = self.inner.pid {
            kill_tree(pid);
        }
        if let Some(mut killer) = self.inner.killer.lock().take() {
            let _ = killer.kill();
        }
    }

    /// Tear down a session that could not be registered.
    pub(crate) fn shutdown(&self) {
        self.kill();
        self.inner.cancelled.cancel();
    }

    /// Snapshot of the externally visible fields.
    pub fn summary(&self) -> SessionSummary {
        let (cols, rows) = *self.inner.dims.lock();
        SessionSummary {
            id: self.inner.id.clone(),
            name: self.inner.name.clone(),
            state: self.state(),
            cols,
            rows,
            shell: self.inner.shell.clone(),
            cwd: self.inner.cwd.clone(),
            pid: self.inner.pid,
            created_at: self.inner.created_at,
            last_active_at: *self.inner.last_active.lock(),
        }
    }
}

#[cfg(windows)]
fn kill_tree(pid: u32) {
    use std::process::Stdio;
    let _ = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
}

#[cfg(unix)]
fn kill_tree(pid: u32) {
    if pid > i32::MAX as u32 {
        tracing::warn!(pid, "pid exceeds i32::MAX, cannot send signal");
        return;
    }
    unsafe {
        libc::kill(pid as i32, libc::SIGKILL);
    }
}

// ── Registry ───────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("session name already exists: {0}")]
    NameExists(String),

    #[error("maximum number of sessions reached")]
    MaxSessionsReached,

    #[error(transparent)]
    Spawn(#[from] PtyError),
}

struct RegistryInner {
    by_id: HashMap<String, Session>,
    by_name: HashMap<String, String>,
}

/// Process-wide session map plus a name index. The single lock keeps the
/// two maps mutually consistent: a name is present in the index iff its
/// referent is present in the session map.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RwLock<RegistryInner>>,
    config: Arc<Config>,
}

impl SessionRegistry {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(RegistryInner {
                by_id: HashMap::new(),
                by_name: HashMap::new(),
            })),
            config,
        }
    }

    /// Create a session: generate the id, apply configured defaults,
    /// spawn, and insert into both maps.
    pub fn create(&self, req: CreateRequest) -> Result<Session, RegistryError> {
        let id = Uuid::new_v4().simple().to_string();
        let name = match req.name {
            Some(n) if !n.is_empty() => n,
            _ => id[..6].to_string(),
        };

        // Preflight so an obviously doomed request doesn't spawn a child;
        // re-checked under the write lock at insert.
        {
            let inner = self.inner.read();
            if inner.by_id.len() >= self.config.max_sessions {
                return Err(RegistryError::MaxSessionsReached);
            }
            if inner.by_name.contains_key(&name) {
                return Err(RegistryError::NameExists(name));
            }
        }

        let shell = req
            .shell
            .unwrap_or_else(|| config::expand_env(&self.config.default_shell));
        let cwd = req
            .cwd
            .unwrap_or_else(|| config::expand_env(&self.config.default_cwd));
        let cols = req.cols.unwrap_or(DEFAULT_COLS).max(1);
        let rows = req.rows.unwrap_or(DEFAULT_ROWS).max(1);

        let session = Session::spawn(SessionSpec {
            id: id.clone(),
            name: name.clone(),
            shell,
            cwd,
            env: req.env.unwrap_or_default(),
            cols,
            rows,
            read_chunk: self.config.buffer_size,
        })?;

        let mut inner = self.inner.write();
        if inner.by_id.len() >= self.config.max_sessions {
            drop(inner);
            session.shutdown();
            return Err(RegistryError::MaxSessionsReached);
        }
        if inner.by_name.contains_key(&name) {
            drop(inner);
            session.shutdown();
            return Err(RegistryError::NameExists(name));
        }
        inner.by_id.insert(id.clone(), session.clone());
        inner.by_name.insert(name.clone(), id);
        drop(inner);

        tracing::info!(session = %session.id(), name = %name, pid = ?session.pid(), "session created");
        Ok(session)
    }

    /// Look up by id first, then by name.
    pub fn get(&self, id_or_name: &str) -> Option<Session> {
        let inner = self.inner.read();
        if let Some(session) = inner.by_id.get(id_or_name) {
            return Some(session.clone());
        }
        inner
            .by_name
            .get(id_or_name)
            .and_then(|id| inner.by_id.get(id))
            .cloned()
    }

    /// Summaries of all sessions, ordered by creation time.
    pub fn list(&self) -> Vec<SessionSummary> {
        let inner = self.inner.read();
        let mut summaries: Vec<SessionSummary> =
            inner.by_id.values().map(Session::summary).collect();
        summaries.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        summaries
    }

    /// Remove a session from both maps, returning it if present.
    pub fn remove(&self, id_or_name: &str) -> Option<Session> {
        let mut inner = self.inner.write();
        let id = if inner.by_id.contains_key(id_or_name) {
            id_or_name.to_string()
        } else {
            inner.by_name.get(id_or_name)?.clone()
        };
        let session = inner.by_id.remove(&id)?;
        inner.by_name.remove(session.name());
        Some(session)
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every session and kill its child. Used at daemon shutdown.
    pub fn drain(&self) {
        let sessions: Vec<Session> = {
            let mut inner = self.inner.write();
            inner.by_name.clear();
            inner.by_id.drain().map(|(_, s)| s).collect()
        };
        for session in &sessions {
            session.kill();
        }
        if !sessions.is_empty() {
            tracing::info!(count = sessions.len(), "drained sessions on shutdown");
        }
    }
}
