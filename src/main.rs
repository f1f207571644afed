//! wmux - terminal multiplexer CLI and daemon entrypoint.
//!
//! The same binary is both the client and, via `wmux daemon`, the
//! background server. Client commands connect to the daemon over the
//! local pipe and speak the framed JSON protocol; most of them start the
//! daemon on demand if none is running.

use clap::{Parser, Subcommand};
use std::io::IsTerminal;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use winmux::client::Client;
use winmux::config::Config;
use winmux::server;
use winmux::session::SessionRegistry;
use winmux::transport::PipeListener;

#[derive(Parser, Debug)]
#[command(name = "wmux", version, about = "Terminal multiplexer: background shell sessions over a local pipe")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check that the daemon is alive.
    Ping,
    /// List sessions.
    Ls,
    /// Create a session (and attach to it when run from a terminal).
    New {
        /// Session name.
        #[arg(short = 'n', long)]
        name: Option<String>,
        /// Shell program to run.
        #[arg(short = 's', long)]
        shell: Option<String>,
        /// Working directory for the shell.
        #[arg(short = 'C', long)]
        cwd: Option<String>,
        /// Initial columns.
        #[arg(short = 'c', long)]
        cols: Option<u16>,
        /// Initial rows.
        #[arg(short = 'r', long)]
        rows: Option<u16>,
        /// Create without attaching.
        #[arg(short = 'd', long)]
        detached: bool,
    },
    /// Attach to a session by id or name.
    Attach { id_or_name: String },
    /// Kill a session's process tree.
    Kill { id_or_name: String },
    /// Resize a session.
    Resize {
        id_or_name: String,
        cols: u16,
        rows: u16,
    },
    /// Run the daemon in the foreground.
    Daemon,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "winmux=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match args.command {
        Command::Ping => {
            let mut client = match Client::connect().await {
                Ok(client) => client,
                Err(e) => {
                    eprintln!("wmux: daemon not reachable: {e}");
                    std::process::exit(1);
                }
            };
            let started = std::time::Instant::now();
            let server_time = client.ping().await?;
            println!(
                "pong: server time {} (rtt {:?})",
                server_time.to_rfc3339(),
                started.elapsed()
            );
        }

        Command::Ls => {
            let mut client = Client::connect_or_spawn().await?;
            let sessions = client.list().await?;
            if sessions.is_empty() {
                println!("no sessions");
                return Ok(());
            }
            println!(
                "{:<12} {:<16} {:<8} {:>9} {:>8}  {}",
                "ID", "NAME", "STATE", "SIZE", "PID", "SHELL"
            );
            for s in sessions {
                println!(
                    "{:<12} {:<16} {:<8?} {:>4}x{:<4} {:>8}  {}",
                    &s.id[..12.min(s.id.len())],
                    s.name,
                    s.state,
                    s.cols,
                    s.rows,
                    s.pid.map_or_else(|| "-".to_string(), |p| p.to_string()),
                    s.shell,
                );
            }
        }

        Command::New {
            name,
            shell,
            cwd,
            cols,
            rows,
            detached,
        } => {
            let mut client = Client::connect_or_spawn().await?;
            let (term_cols, term_rows) = winmux::terminal::terminal_size().unwrap_or((120, 30));
            let session_id = client
                .create(
                    name,
                    shell,
                    cwd,
                    cols.or(Some(term_cols)),
                    rows.or(Some(term_rows)),
                )
                .await?;
            println!("{session_id}");

            if !detached && std::io::stdin().is_terminal() {
                let client = Client::connect().await?;
                client.attach(&session_id).await?;
            }
        }

        Command::Attach { id_or_name } => {
            let client = Client::connect_or_spawn().await?;
            client.attach(&id_or_name).await?;
        }

        Command::Kill { id_or_name } => {
            let mut client = Client::connect_or_spawn().await?;
            client.kill(&id_or_name).await?;
            println!("killed {id_or_name}");
        }

        Command::Resize {
            id_or_name,
            cols,
            rows,
        } => {
            let mut client = Client::connect_or_spawn().await?;
            client.resize(&id_or_name, cols, rows).await?;
        }

        Command::Daemon => run_daemon().await?,
    }

    Ok(())
}

async fn run_daemon() -> anyhow::Result<()> {
    let config = Arc::new(Config::load_default()?);
    tracing::info!(
        max_sessions = config.max_sessions,
        default_shell = %config.default_shell,
        "winmux daemon starting"
    );

    let registry = SessionRegistry::new(config);
    let listener = PipeListener::bind()?;

    let cancelled = CancellationToken::new();
    let signal_token = cancelled.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            signal_token.cancel();
        }
    });

    server::serve(listener, registry.clone(), cancelled).await;

    registry.drain();
    tracing::info!("winmux daemon stopped");
    Ok(())
}
