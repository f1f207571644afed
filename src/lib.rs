//! winmux - a terminal multiplexer daemon.
//!
//! A background daemon hosts long-lived shell sessions driven through the
//! platform pseudoconsole; short-lived clients connect over a local pipe
//! to list, create, attach to, resize, and terminate them. Sessions
//! outlive client attachments.
//!
//! Architecture:
//! - protocol: length-prefixed JSON frames, typed requests and events
//! - pty: pseudoconsole open/spawn/resize via portable-pty
//! - session: per-session state machine (read loop, input writer, waiter)
//!   plus the process-wide registry
//! - fanout/ring: output fan-out with warm-attach replay
//! - server: acceptor and per-connection reader/dispatcher/writer
//! - transport: named pipe (Windows) / unix socket (elsewhere)
//! - client: typed request helpers and the interactive attach loop

pub mod client;
pub mod config;
pub mod fanout;
pub mod protocol;
pub mod pty;
pub mod ring;
pub mod server;
pub mod session;
pub mod terminal;
pub mod transport;
