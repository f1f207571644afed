//! Pseudoconsole glue built on portable-pty (ConPTY on Windows).
//!
//! `spawn` opens a pseudoconsole of the requested size, starts the child
//! attached to it, and hands back the master-side handles. The slave-side
//! ends are dropped immediately after spawn so the child holds the only
//! copies.

use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::collections::HashMap;
use std::io::{Read, Write};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("failed to open pty: {0}")]
    OpenPty(#[source] anyhow::Error),

    #[error("failed to spawn command: {0}")]
    SpawnCommand(#[source] anyhow::Error),

    #[error("failed to clone reader: {0}")]
    CloneReader(#[source] anyhow::Error),

    #[error("failed to take writer: {0}")]
    TakeWriter(#[source] anyhow::Error),

    #[error("failed to resize pty: {0}")]
    Resize(#[source] anyhow::Error),
}

/// What to run in the pseudoconsole, after defaults have been applied.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    /// Shell program (a path or a PATH-resolvable name, no arguments).
    pub shell: String,
    pub cwd: String,
    /// Extra environment on top of the daemon's own.
    pub env: HashMap<String, String>,
    /// Session name, exported to the child as `WMUX_SESSION`.
    pub session_name: String,
}

/// Build the child's command: inherited environment, then the user
/// overlay, then the winmux markers. The environment block is assembled
/// per child on the builder, never via process-global mutation.
pub fn build_command(spec: &SpawnSpec) -> CommandBuilder {
    let term = std::env::var("TERM").unwrap_or_else(|_| "xterm-256color".to_string());

    let mut cmd = CommandBuilder::new(&spec.shell);
    cmd.cwd(&spec.cwd);
    for (k, v) in &spec.env {
        cmd.env(k, v);
    }
    cmd.env("TERM", term);
    cmd.env("WMUX", "1");
    cmd.env("WMUX_SESSION", &spec.session_name);
    cmd
}

/// The master side of an open pseudoconsole.
pub struct Pty {
    master: Box<dyn MasterPty + Send>,
}

impl Pty {
    /// Update the visible dimensions.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(PtyError::Resize)
    }
}

/// Everything produced by a successful spawn.
pub struct Spawned {
    pub pty: Pty,
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
    pub child: Box<dyn Child + Send + Sync>,
    pub killer: Box<dyn ChildKiller + Send + Sync>,
    pub pid: Option<u32>,
}

/// Open a pseudoconsole of `cols` x `rows` and start `cmd` under it.
pub fn spawn(cols: u16, rows: u16, cmd: CommandBuilder) -> Result<Spawned, PtyError> {
    let pty_system = native_pty_system();
    let size = PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    };
    let pair = pty_system.openpty(size).map_err(PtyError::OpenPty)?;

    let child = pair.slave.spawn_command(cmd).map_err(PtyError::SpawnCommand)?;
    // The child now holds the only PTY-slave ends.
    drop(pair.slave);

    let reader = pair
        .master
        .try_clone_reader()
        .map_err(PtyError::CloneReader)?;
    let writer = pair.master.take_writer().map_err(PtyError::TakeWriter)?;
    let killer = child.clone_killer();
    let pid = child.process_id();

    Ok(Spawned {
        pty: Pty {
            master: pair.master,
        },
        reader,
        writer,
        child,
        killer,
        pid,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn sh_spec() -> SpawnSpec {
        SpawnSpec {
            shell: "sh".to_string(),
            cwd: std::env::temp_dir().display().to_string(),
            env: HashMap::new(),
            session_name: "test".to_string(),
        }
    }

    /// Read from the PTY until the marker shows up or the timeout expires.
    fn read_until(
        mut reader: Box<dyn Read + Send>,
        marker: &str,
        timeout: Duration,
    ) -> String {
        let (tx, rx) = mpsc::channel();
        let marker_owned = marker.to_string();
        thread::spawn(move || {
            let mut buf = vec![0u8; 4096];
            let mut collected = Vec::new();
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        collected.extend_from_slice(&buf[..n]);
                        let text = String::from_utf8_lossy(&collected).to_string();
                        if text.contains(&marker_owned) {
                            let _ = tx.send(text);
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });
        rx.recv_timeout(timeout).unwrap_or_default()
    }

    #[test]
    fn spawn_starts_child_with_pid() {
        let spawned = spawn(80, 24, build_command(&sh_spec())).expect("spawn failed");
        assert!(spawned.pid.is_some(), "child should report a pid");
    }

    #[test]
    fn child_sees_wmux_environment() {
        let spawned = spawn(80, 24, build_command(&sh_spec())).expect("spawn failed");
        let mut writer = spawned.writer;
        writer
            .write_all(b"echo \"mark:$WMUX:$WMUX_SESSION\"\n")
            .expect("write failed");
        writer.flush().expect("flush failed");

        let output = read_until(spawned.reader, "mark:1:test", Duration::from_secs(5));
        assert!(
            output.contains("mark:1:test"),
            "expected WMUX env markers, got: {output}"
        );
    }

    #[test]
    fn env_overlay_is_applied() {
        let mut spec = sh_spec();
        spec.env
            .insert("WINMUX_TEST_VAR".to_string(), "overlay_value".to_string());
        let spawned = spawn(80, 24, build_command(&spec)).expect("spawn failed");
        let mut writer = spawned.writer;
        writer
            .write_all(b"echo \"var:$WINMUX_TEST_VAR\"\n")
            .expect("write failed");
        writer.flush().expect("flush failed");

        let output = read_until(spawned.reader, "var:overlay_value", Duration::from_secs(5));
        assert!(
            output.contains("var:overlay_value"),
            "expected overlay var, got: {output}"
        );
    }

    #[test]
    fn resize_succeeds_repeatedly() {
        let spawned = spawn(80, 24, build_command(&sh_spec())).expect("spawn failed");
        spawned.pty.resize(120, 40).expect("first resize failed");
        spawned.pty.resize(100, 25).expect("second resize failed");
    }

    #[test]
    fn wait_observes_exit() {
        let spawned = spawn(80, 24, build_command(&sh_spec())).expect("spawn failed");
        let mut writer = spawned.writer;
        writer.write_all(b"exit 0\n").expect("write failed");
        writer.flush().expect("flush failed");

        let mut child = spawned.child;
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let _ = tx.send(child.wait());
        });
        let status = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("child did not exit in time")
            .expect("wait failed");
        assert!(status.success());
    }

    #[test]
    fn killer_terminates_child() {
        let spawned = spawn(80, 24, build_command(&sh_spec())).expect("spawn failed");
        let mut killer = spawned.killer;
        let _ = killer.kill();

        let mut child = spawned.child;
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let _ = tx.send(child.wait());
        });
        rx.recv_timeout(Duration::from_secs(5))
            .expect("killed child did not exit in time")
            .expect("wait failed");
    }
}
