//! RPC server over the local pipe.
//!
//! The acceptor hands each connection to a concurrent handler. Per
//! connection there are two tasks: the reader loop (decode framed
//! requests, dispatch in arrival order) and a writer draining the
//! connection's outbound event queue. One writer per connection means
//! frames never interleave.

use bytes::Bytes;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::fanout::{OutputSink, SinkId};
use crate::protocol::{self, DecodeError, Event, Request};
use crate::session::{CreateRequest, RegistryError, Session, SessionRegistry};
use crate::transport::PipeListener;

/// How long connection disposal waits for the writer to drain.
const WRITER_GRACE: Duration = Duration::from_secs(2);

/// Accept connections until cancelled.
pub async fn serve(
    mut listener: PipeListener,
    registry: SessionRegistry,
    cancelled: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancelled.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(stream) => {
                    let registry = registry.clone();
                    let token = cancelled.child_token();
                    tokio::spawn(async move {
                        handle_connection(stream, registry, token).await;
                    });
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to accept pipe connection");
                }
            },
        }
    }
    tracing::info!("acceptor stopped");
}

/// One accepted pipe stream: the outbound event queue, its writer task,
/// and the disposal hooks that undo this connection's subscriptions.
pub struct ClientConnection {
    outbound: parking_lot::Mutex<Option<mpsc::UnboundedSender<Event>>>,
    /// Hooks keyed by session id so `Detach` can undo one subscription.
    hooks: parking_lot::Mutex<Vec<(String, Box<dyn FnOnce() + Send>)>>,
    writer: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
    writer_gone: CancellationToken,
    disposed: AtomicBool,
}

impl ClientConnection {
    /// Wrap a write half: spawns the writer task draining the queue.
    pub fn spawn<W>(writer: W) -> Arc<Self>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let writer_gone = CancellationToken::new();
        let conn = Arc::new(Self {
            outbound: parking_lot::Mutex::new(Some(tx)),
            hooks: parking_lot::Mutex::new(Vec::new()),
            writer: parking_lot::Mutex::new(None),
            writer_gone: writer_gone.clone(),
            disposed: AtomicBool::new(false),
        });
        let handle = tokio::spawn(writer_loop(writer, rx, writer_gone));
        *conn.writer.lock() = Some(handle);
        conn
    }

    /// Enqueue an event for the writer. Fails (returning false) once the
    /// connection is disposed.
    pub fn try_enqueue(&self, event: Event) -> bool {
        if self.disposed.load(Ordering::Acquire) {
            return false;
        }
        match self.outbound.lock().as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    /// Register a cleanup hook tied to `session_id`, run at disposal (or
    /// earlier, by an explicit `Detach`). If the connection is already
    /// disposed the hook runs immediately.
    fn add_disposal_hook(&self, session_id: &str, hook: Box<dyn FnOnce() + Send>) {
        if self.disposed.load(Ordering::Acquire) {
            run_hook(hook);
            return;
        }
        self.hooks.lock().push((session_id.to_string(), hook));
        // A dispose racing the push above may have drained before it
        // landed; anything left behind is ours to run.
        if self.disposed.load(Ordering::Acquire) {
            let leftover: Vec<_> = self.hooks.lock().drain(..).collect();
            for (_, hook) in leftover {
                run_hook(hook);
            }
        }
    }

    /// Run and remove the hooks registered for one session.
    fn run_hooks_for(&self, session_id: &str) {
        let drained: Vec<_> = {
            let mut hooks = self.hooks.lock();
            let mut kept = Vec::with_capacity(hooks.len());
            let mut matched = Vec::new();
            for entry in hooks.drain(..) {
                if entry.0 == session_id {
                    matched.push(entry);
                } else {
                    kept.push(entry);
                }
            }
            *hooks = kept;
            matched
        };
        for (_, hook) in drained {
            run_hook(hook);
        }
    }

    /// Tear down: run every hook exactly once, close the outbound queue,
    /// and join the writer within a bounded grace period. Idempotent.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let hooks: Vec<_> = self.hooks.lock().drain(..).collect();
        for (_, hook) in hooks {
            run_hook(hook);
        }
        *self.outbound.lock() = None;
        let handle = self.writer.lock().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(WRITER_GRACE, handle).await.is_err() {
                tracing::warn!("connection writer did not drain within grace period");
            }
        }
    }
}

fn run_hook(hook: Box<dyn FnOnce() + Send>) {
    if std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || hook())).is_err() {
        tracing::warn!("connection disposal hook panicked");
    }
}

async fn writer_loop<W>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<Event>,
    done: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(event) = rx.recv().await {
        if let Err(e) = protocol::write_frame(&mut writer, &event).await {
            tracing::debug!(error = %e, "connection writer ended");
            break;
        }
    }
    done.cancel();
}

/// Sink forwarding one session's output onto a connection's queue.
struct ConnectionSink {
    session_id: String,
    conn: Arc<ClientConnection>,
}

impl OutputSink for ConnectionSink {
    fn data(&self, chunk: Bytes) {
        self.conn.try_enqueue(Event::Output {
            session_id: self.session_id.clone(),
            data: chunk.to_vec(),
        });
    }

    fn exited(&self, code: u32) {
        self.conn.try_enqueue(Event::Exit {
            session_id: self.session_id.clone(),
            code,
        });
    }
}

/// Serve one connection to completion.
///
/// Ends on clean client disconnect, framing error, writer failure, or
/// cancellation; always disposes the connection on the way out.
pub async fn handle_connection<S>(
    stream: S,
    registry: SessionRegistry,
    cancelled: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut reader, writer) = tokio::io::split(stream);
    let conn = ClientConnection::spawn(writer);

    loop {
        tokio::select! {
            _ = cancelled.cancelled() => break,
            _ = conn.writer_gone.cancelled() => break,
            frame = protocol::read_frame(&mut reader) => match frame {
                Ok(Some(payload)) => {
                    if dispatch(&conn, &registry, &payload).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break, // clean disconnect
                Err(e) => {
                    tracing::debug!(error = %e, "client framing error");
                    break;
                }
            },
        }
    }

    conn.dispose().await;
}

fn not_found(conn: &ClientConnection) {
    conn.try_enqueue(Event::Error {
        req_id: None,
        code: "NOT_FOUND".to_string(),
        message: "Session not found".to_string(),
    });
}

fn create_error_code(err: &RegistryError) -> &'static str {
    match err {
        RegistryError::NameExists(_) => "NAME_EXISTS",
        RegistryError::MaxSessionsReached => "MAX_SESSIONS",
        RegistryError::Spawn(_) => "SPAWN_FAILED",
    }
}

/// Act on one decoded request. `Err` means the payload was undecodable
/// and the connection must close; everything else is reported in-band.
async fn dispatch(
    conn: &Arc<ClientConnection>,
    registry: &SessionRegistry,
    payload: &[u8],
) -> Result<(), DecodeError> {
    let request = match protocol::decode_request(payload) {
        Ok(request) => request,
        Err(DecodeError::UnknownType(variant)) => {
            conn.try_enqueue(Event::Error {
                req_id: None,
                code: "UNIMPLEMENTED".to_string(),
                message: format!("{variant} not implemented"),
            });
            return Ok(());
        }
        Err(err) => return Err(err),
    };

    match request {
        Request::Ping => {
            conn.try_enqueue(Event::Pong {
                server_time: Utc::now(),
            });
        }

        Request::List => {
            conn.try_enqueue(Event::Sessions {
                sessions: registry.list(),
            });
        }

        Request::CreateSession {
            name,
            shell,
            cwd,
            env,
            cols,
            rows,
        } => {
            let result = registry.create(CreateRequest {
                name,
                shell,
                cwd,
                env,
                cols,
                rows,
            });
            match result {
                Ok(session) => {
                    conn.try_enqueue(Event::Created {
                        session_id: session.id().to_string(),
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "session create failed");
                    conn.try_enqueue(Event::Error {
                        req_id: None,
                        code: create_error_code(&e).to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }

        Request::Attach { id_or_name } => match registry.get(&id_or_name) {
            None => not_found(conn),
            Some(session) => attach(conn, &session),
        },

        Request::Input { session_id, data } => match registry.get(&session_id) {
            None => not_found(conn),
            Some(session) => session.write_input(Bytes::from(data)).await,
        },

        Request::Resize {
            session_id,
            cols,
            rows,
        } => match registry.get(&session_id) {
            None => not_found(conn),
            Some(session) => {
                if let Err(e) = session.resize(cols, rows) {
                    tracing::warn!(session = %session.id(), error = %e, "pty resize failed");
                }
            }
        },

        Request::Kill { session_id } => match registry.get(&session_id) {
            None => not_found(conn),
            Some(session) => {
                tracing::info!(session = %session.id(), "kill requested");
                session.kill();
                conn.try_enqueue(Event::Ack { req_id: None });
            }
        },

        Request::Detach { session_id } => {
            // Unregister exactly this connection's subscription; the
            // client closing the pipe achieves the same via disposal.
            if let Some(session) = registry.get(&session_id) {
                conn.run_hooks_for(session.id());
            }
        }
    }

    Ok(())
}

/// Register an output sink for `session` on this connection, then
/// acknowledge. Registration must come first: the warm replay emitted by
/// `add_sink` and the `Attached` ack land on the queue before any chunk
/// published after this point.
fn attach(conn: &Arc<ClientConnection>, session: &Session) {
    let session_id = session.id().to_string();
    let sink = Arc::new(ConnectionSink {
        session_id: session_id.clone(),
        conn: Arc::clone(conn),
    });
    let sink_id: SinkId = session.add_sink(sink);

    let hook_session = session.clone();
    conn.add_disposal_hook(
        &session_id,
        Box::new(move || hook_session.remove_sink(sink_id)),
    );

    conn.try_enqueue(Event::Attached {
        session_id: session_id.clone(),
    });

    // An attach that raced the exit still gets told the session is gone;
    // the sink itself only ever saw the ring tail.
    if let Some(code) = session.exit_code() {
        conn.try_enqueue(Event::Exit { session_id, code });
    }
}
