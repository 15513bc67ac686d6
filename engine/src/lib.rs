//! Logsieve Engine Server
//!
//! This crate provides the query engine server for logsieve. It accepts
//! framed TCP connections, executes log queries against the configured
//! providers, and streams job results back to clients.
//!
//! # Architecture
//!
//! The server is built on Tokio and the shared query core, providing:
//! - A length-prefixed envelope protocol for requests and job notifications
//! - Per-connection job tables with cancellable query jobs
//! - Provider fan-out over container logs and remote backends
//!
//! # Example
//!
//! ```no_run
//! use engine::run_server;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     run_server().await
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

mod config;
mod connection;

pub use config::Config;
pub use connection::serve_connection;

use anyhow::Result;
use shared::jobs::QueryEngine;
use shared::providers::{DockerProvider, HttpLogBackend, RemoteProvider};
use std::sync::Arc;
use tokio::net::TcpListener;

const REMOTE_PAGE_SIZE: usize = 1_000;

/// Runs the logsieve engine server.
///
/// This function initializes the server with configuration from environment
/// variables and starts listening for incoming connections. It handles
/// graceful shutdown on SIGTERM/SIGINT signals.
///
/// # Errors
///
/// Returns an error if:
/// - Configuration cannot be loaded from environment
/// - The server fails to bind to the configured address
pub async fn run_server() -> Result<()> {
    let config = Config::from_env()?;
    run_server_with_config(config).await
}

/// Runs the logsieve engine server with the provided configuration.
///
/// This is useful for testing or when you want to provide configuration
/// programmatically.
///
/// # Errors
///
/// Returns an error if the server fails to bind to the configured address.
pub async fn run_server_with_config(config: Config) -> Result<()> {
    let addr = config.socket_addr();

    tracing::info!(
        host = %config.host,
        port = %config.port,
        "Logsieve engine server starting"
    );

    let engine = Arc::new(build_engine(&config));
    let listener = TcpListener::bind(addr).await?;

    tracing::info!(%addr, "Listening for connections");

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            () = &mut shutdown => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        tracing::info!(%peer, "client connected");
                        let engine = Arc::clone(&engine);
                        tokio::spawn(async move {
                            if let Err(error) = serve_connection(stream, engine).await {
                                tracing::warn!(%peer, %error, "connection failed");
                            }
                        });
                    }
                    Err(error) => {
                        tracing::warn!(%error, "failed to accept connection");
                    }
                }
            }
        }
    }

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Creates the query engine with every provider the configuration enables.
///
/// This function is public to allow testing connections without starting a
/// full server.
#[must_use]
pub fn build_engine(config: &Config) -> QueryEngine {
    let mut engine = QueryEngine::new();
    if config.docker_enabled {
        engine = engine.with_provider(Arc::new(DockerProvider::new()));
    }
    if let Some(ref url) = config.loki_url {
        let backend = HttpLogBackend::new(url.clone());
        engine = engine.with_provider(Arc::new(RemoteProvider::new(
            "loki",
            backend,
            REMOTE_PAGE_SIZE,
        )));
    }
    engine
}

/// Waits for a shutdown signal (SIGTERM or SIGINT).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
