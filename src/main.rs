//! socket-engine: a command-dispatching TCP socket server
//!
//! Serves the built-in commands (ECHO, ADD, MULT, QUIT) over either
//! framing:
//! - `line`: `KEY body\r\n` text lines
//! - `length-prefixed`: fixed-width key, big-endian body length, body
//!
//! Configuration via CLI arguments or TOML file.

use anyhow::Context;
use socket_engine::builtin;
use socket_engine::command::CommandRegistry;
use socket_engine::config::{Config, FramingMode};
use socket_engine::{ServerHandle, SocketServer};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        framing = ?config.framing,
        max_connections = config.max_connections,
        workers = config.max_working_threads,
        min_workers = config.min_working_threads,
        blocking_threads = config.max_blocking_threads,
        min_blocking_threads = config.min_blocking_threads,
        "Starting socket-engine server"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.max_working_threads)
        .max_blocking_threads(config.max_blocking_threads)
        .thread_name("socket-engine-worker")
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    runtime.block_on(run(config))
}

async fn run(config: Config) -> anyhow::Result<()> {
    let server = match config.framing {
        FramingMode::Line => {
            let mut registry = CommandRegistry::new().case_insensitive(true);
            builtin::register(&mut registry)?;
            SocketServer::line(config, registry).start().await?
        }
        FramingMode::LengthPrefixed => {
            let mut registry = CommandRegistry::new();
            builtin::register(&mut registry)?;
            SocketServer::length_prefixed(config, registry).start().await?
        }
    };

    serve(server).await
}

async fn serve(server: ServerHandle) -> anyhow::Result<()> {
    let mut errors = server.subscribe_errors();
    let drain = tokio::spawn(async move {
        // Every record is already logged when reported; count what was missed.
        loop {
            match errors.recv().await {
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(missed = n, "Exception channel lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    server.shutdown().await;
    drain.abort();
    Ok(())
}
