//! Client side of the pipe protocol.
//!
//! A `Client` wraps one pipe connection: typed request helpers for the
//! one-shot commands, and the interactive streaming loop used by
//! `attach`. The streaming loop forwards stdin from a dedicated blocking
//! reader thread and prints `Output` events as they arrive; `Ctrl+\`
//! detaches, leaving the session running.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::io::{self, Read, Write};
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;

use crate::protocol::{self, Event, Request, SessionSummary};
use crate::terminal::RawModeGuard;
use crate::transport::{self, PipeStream};

/// Detach key: Ctrl+\ (FS, 0x1C). Never forwarded to the PTY.
const DETACH_KEY: u8 = 0x1c;

/// How long to wait for an auto-spawned daemon to come up.
const SPAWN_WAIT_ATTEMPTS: u32 = 40;
const SPAWN_WAIT_INTERVAL: Duration = Duration::from_millis(100);

pub struct Client {
    stream: PipeStream,
}

impl Client {
    /// Connect to a running daemon.
    pub async fn connect() -> io::Result<Self> {
        let stream = transport::connect().await?;
        Ok(Self { stream })
    }

    /// Connect, starting the daemon first if none is running.
    pub async fn connect_or_spawn() -> io::Result<Self> {
        if let Ok(client) = Self::connect().await {
            return Ok(client);
        }
        spawn_daemon()?;
        for _ in 0..SPAWN_WAIT_ATTEMPTS {
            tokio::time::sleep(SPAWN_WAIT_INTERVAL).await;
            if let Ok(client) = Self::connect().await {
                return Ok(client);
            }
        }
        Err(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "daemon did not start in time",
        ))
    }

    async fn send(&mut self, request: &Request) -> io::Result<()> {
        protocol::write_frame(&mut self.stream, request)
            .await
            .map_err(io::Error::other)
    }

    async fn next_event(&mut self) -> io::Result<Event> {
        let payload = protocol::read_frame(&mut self.stream)
            .await
            .map_err(io::Error::other)?
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::UnexpectedEof, "daemon closed the connection")
            })?;
        protocol::decode_event(&payload)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// `Ping` → the daemon's clock.
    pub async fn ping(&mut self) -> io::Result<DateTime<Utc>> {
        self.send(&Request::Ping).await?;
        match self.next_event().await? {
            Event::Pong { server_time } => Ok(server_time),
            Event::Error { code, message, .. } => Err(io::Error::other(format!("{code}: {message}"))),
            other => Err(unexpected(other)),
        }
    }

    /// `List` → session summaries, oldest first.
    pub async fn list(&mut self) -> io::Result<Vec<SessionSummary>> {
        self.send(&Request::List).await?;
        match self.next_event().await? {
            Event::Sessions { sessions } => Ok(sessions),
            Event::Error { code, message, .. } => Err(io::Error::other(format!("{code}: {message}"))),
            other => Err(unexpected(other)),
        }
    }

    /// `CreateSession` → the new session's id.
    pub async fn create(
        &mut self,
        name: Option<String>,
        shell: Option<String>,
        cwd: Option<String>,
        cols: Option<u16>,
        rows: Option<u16>,
    ) -> io::Result<String> {
        self.send(&Request::CreateSession {
            name,
            shell,
            cwd,
            env: None,
            cols,
            rows,
        })
        .await?;
        match self.next_event().await? {
            Event::Created { session_id } => Ok(session_id),
            Event::Error { code, message, .. } => Err(io::Error::other(format!("{code}: {message}"))),
            other => Err(unexpected(other)),
        }
    }

    /// `Kill` → waits for the daemon's ack.
    pub async fn kill(&mut self, id_or_name: &str) -> io::Result<()> {
        self.send(&Request::Kill {
            session_id: id_or_name.to_string(),
        })
        .await?;
        match self.next_event().await? {
            Event::Ack { .. } => Ok(()),
            Event::Error { code, message, .. } => Err(io::Error::other(format!("{code}: {message}"))),
            other => Err(unexpected(other)),
        }
    }

    /// `Resize`. Fire-and-forget: success produces no event.
    pub async fn resize(&mut self, id_or_name: &str, cols: u16, rows: u16) -> io::Result<()> {
        self.send(&Request::Resize {
            session_id: id_or_name.to_string(),
            cols,
            rows,
        })
        .await
    }

    /// Attach to a session and run the interactive streaming loop until
    /// detach, session exit, or disconnect.
    pub async fn attach(mut self, id_or_name: &str) -> io::Result<()> {
        // Match the remote dimensions to this terminal before attaching so
        // the replay renders at the right width.
        let (mut cols, mut rows) = crate::terminal::terminal_size().unwrap_or((80, 24));
        self.send(&Request::Resize {
            session_id: id_or_name.to_string(),
            cols,
            rows,
        })
        .await?;
        self.send(&Request::Attach {
            id_or_name: id_or_name.to_string(),
        })
        .await?;

        eprintln!("[wmux] attaching; press Ctrl+\\ to detach");
        let raw = RawModeGuard::new().map_err(io::Error::other)?;

        let (mut reader, mut writer) = tokio::io::split(self.stream);
        let mut stdout = io::stdout();

        // Wait for the ack, rendering any replayed output that precedes it.
        let session_id = loop {
            match read_event(&mut reader).await? {
                Event::Attached { session_id } => break session_id,
                Event::Output { data, .. } => {
                    stdout.write_all(&data)?;
                    stdout.flush()?;
                }
                Event::Error { code, message, .. } => {
                    drop(raw);
                    return Err(io::Error::other(format!("{code}: {message}")));
                }
                _ => {}
            }
        };

        // Dedicated blocking stdin reader. The thread cannot be cancelled
        // while blocked in read(); it dies with the process on detach.
        let (stdin_tx, mut stdin_rx) = mpsc::channel::<Bytes>(64);
        std::thread::spawn(move || {
            let mut stdin = io::stdin();
            let mut buf = [0u8; 4096];
            loop {
                match stdin.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if stdin_tx.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });

        let mut resize_check = tokio::time::interval(Duration::from_millis(500));
        let mut outcome = Ok(());

        loop {
            tokio::select! {
                data = stdin_rx.recv() => match data {
                    Some(data) => {
                        if data.contains(&DETACH_KEY) {
                            let _ = protocol::write_frame(&mut writer, &Request::Detach {
                                session_id: session_id.clone(),
                            })
                            .await;
                            break;
                        }
                        let sent = protocol::write_frame(&mut writer, &Request::Input {
                            session_id: session_id.clone(),
                            data: data.to_vec(),
                        })
                        .await;
                        if sent.is_err() {
                            break;
                        }
                    }
                    None => break,
                },

                event = read_event(&mut reader) => match event {
                    Ok(Event::Output { data, .. }) => {
                        stdout.write_all(&data)?;
                        stdout.flush()?;
                    }
                    Ok(Event::Exit { code, .. }) => {
                        outcome = Err(io::Error::other(format!("session exited with code {code}")));
                        break;
                    }
                    Ok(_) => {}
                    Err(_) => break, // daemon went away
                },

                _ = resize_check.tick() => {
                    if let Ok((c, r)) = crate::terminal::terminal_size() {
                        if (c, r) != (cols, rows) {
                            cols = c;
                            rows = r;
                            let _ = protocol::write_frame(&mut writer, &Request::Resize {
                                session_id: session_id.clone(),
                                cols,
                                rows,
                            })
                            .await;
                        }
                    }
                },
            }
        }

        drop(raw);
        match &outcome {
            Ok(()) => eprintln!("\r\n[wmux] detached"),
            Err(e) => eprintln!("\r\n[wmux] {e}"),
        }
        Ok(())
    }
}

async fn read_event<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Event> {
    let payload = protocol::read_frame(reader)
        .await
        .map_err(io::Error::other)?
        .ok_or_else(|| {
            io::Error::new(io::ErrorKind::UnexpectedEof, "daemon closed the connection")
        })?;
    protocol::decode_event(&payload).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn unexpected(event: Event) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("unexpected event from daemon: {event:?}"),
    )
}

/// Start the daemon detached from this terminal.
fn spawn_daemon() -> io::Result<()> {
    let exe = std::env::current_exe()?;
    let mut cmd = std::process::Command::new(exe);
    cmd.arg("daemon")
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());
    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        const DETACHED_PROCESS: u32 = 0x0000_0008;
        const CREATE_NO_WINDOW: u32 = 0x0800_0000;
        cmd.creation_flags(DETACHED_PROCESS | CREATE_NO_WINDOW);
    }
    cmd.spawn()?;
    tracing::debug!("spawned background daemon");
    Ok(())
}
