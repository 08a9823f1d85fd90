//! objsock CLI - echo server and line client for queued object sockets.
//!
//! This is the main binary entry point. See the `objsock` library for the
//! core functionality.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use objsock::{
    Config, ConnectionListener, LoggingListener, QueuedAcceptLoop, QueuedConnection, SocketError,
};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Global allocator configured per M-MIMALLOC-APPS guideline.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

// CLI
#[derive(Parser)]
#[command(name = "objsock")]
#[command(version)]
#[command(about = "Queue-mediated object sockets over TCP")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an echo server: every received message is sent straight back
    Serve {
        /// Port to listen on (overrides config)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Connect to a server, send stdin lines, print whatever comes back
    Connect {
        /// Server address, e.g. 127.0.0.1:7420
        addr: String,
    },
    /// Print the effective configuration
    Config {
        /// Write the effective configuration to the config file
        #[arg(long)]
        save: bool,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;

    match cli.command {
        Commands::Serve { port } => {
            let config = Config {
                port: port.unwrap_or(config.port),
                ..config
            };
            runtime()?.block_on(serve(config))
        }
        Commands::Connect { addr } => runtime()?.block_on(connect(config, addr)),
        Commands::Config { save } => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            if save {
                let path = config.save()?;
                println!("Saved to {}", path.display());
            }
            Ok(())
        }
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new().context("Failed to start tokio runtime")
}

/// Echo server until Ctrl-C.
async fn serve(config: Config) -> Result<()> {
    let server = QueuedAcceptLoop::queued(&config, |conn: QueuedConnection<Value>| {
        conn.add_listener(Arc::new(LoggingListener));
        tokio::spawn(echo(conn));
    });

    let addr = server.start_serving().await?;
    println!("Echo server listening on {addr} (Ctrl-C to stop)");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for Ctrl-C")?;

    println!("Shutting down...");
    server.stop_serving().await;
    Ok(())
}

async fn echo(conn: QueuedConnection<Value>) {
    if !conn.is_running() {
        if let Err(e) = conn.start() {
            log::error!("[Echo] {} could not start: {e}", conn.id());
            return;
        }
    }
    // `receive` yields `None` once the connection stops.
    while let Some(value) = conn.receive(true).await {
        conn.send(value);
    }
    conn.close().await;
}

/// Reports a lost connection on stderr.
struct Printer;

impl ConnectionListener<Value> for Printer {
    fn exception_occurred(&self, _conn: &QueuedConnection<Value>, err: &SocketError) {
        eprintln!("! connection lost: {err}");
    }
}

/// Line client: each stdin line is sent as JSON, or as a string if it
/// doesn't parse.
async fn connect(config: Config, addr: String) -> Result<()> {
    let conn = QueuedConnection::<Value>::connect(addr.as_str(), config.connection_options())
        .await
        .with_context(|| format!("Failed to connect to {addr}"))?;
    conn.add_listener(Arc::new(Printer));
    conn.start()?;
    println!("Connected to {addr}");
    let incoming = tokio::spawn(print_incoming(conn.clone(), |value| println!("< {value}")));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if !conn.is_running() {
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let value = serde_json::from_str(line).unwrap_or_else(|_| Value::String(line.to_string()));
        conn.send(value);
        println!("> {line}");
    }

    if conn.is_running() {
        conn.close_after_sending().await;
    } else {
        conn.close().await;
    }
    if let Err(e) = incoming.await {
        log::debug!("Receive task ended abnormally: {e}");
    }
    Ok(())
}

/// Drains the inbound queue until the connection stops.
async fn print_incoming(conn: QueuedConnection<Value>, print: impl Fn(&Value)) {
    while let Some(value) = conn.receive(true).await {
        print(&value);
    }
}
