//! brokerd - message broker daemon
//!
//! Accepts client connections, negotiates the wire protocol and runs one
//! session per connection until shutdown.

use brokerd_server::metrics::run_metrics_server;
use brokerd_server::{Config, Metrics, Server, ServerConfig, ServerError};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// How long shutdown waits for sessions to unwind after force-closing them.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "brokerd")]
#[command(about = "Message broker daemon")]
#[command(version)]
struct Cli {
    /// Path to YAML config file
    #[arg(short, long, env = "BROKERD_CONFIG")]
    config: Option<PathBuf>,

    /// Address to accept client connections on (overrides config)
    #[arg(short, long)]
    bind: Option<SocketAddr>,
}

/// Runs the accept loop until shutdown.
///
/// A shutdown that lands before the loop starts is a clean stop, not an error.
async fn serve_until_shutdown(server: &Server) -> Result<(), ServerError> {
    match server.run().await {
        Err(ServerError::ShuttingDown) => {
            tracing::info!("Shutdown requested before accepting connections");
            Ok(())
        }
        result => result,
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match Config::load_from(cli.config.as_deref()) {
        Ok(c) => {
            if let Some(ref path) = cli.config {
                tracing::info!("Loaded config from {}", path.display());
            }
            c
        }
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            return Err(e.into());
        }
    };
    if let Some(bind) = cli.bind {
        config.network.bind_addr = bind;
    }

    tracing::info!("Starting brokerd");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!("  Max connections: {}", config.network.max_connections);
    match config.network.handshake_timeout() {
        Some(t) => tracing::info!("  Handshake timeout: {:?}", t),
        None => tracing::info!("  Handshake timeout: disabled"),
    }

    let mut server_config = ServerConfig::from_config(&config);

    let metrics = if config.metrics.enabled {
        let metrics = Arc::new(Metrics::new()?);
        server_config = server_config.with_metrics(metrics.clone());
        tracing::info!("  Metrics: enabled on {}", config.metrics.bind_addr);
        Some(metrics)
    } else {
        tracing::info!("  Metrics: disabled");
        None
    };

    let server = Arc::new(Server::new(server_config));

    let metrics_handle = metrics.map(|metrics| {
        let addr = config.metrics.bind_addr;
        let shutdown = server.subscribe_shutdown();
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(addr, metrics, shutdown).await {
                tracing::error!("Metrics server failed: {}", e);
            }
        })
    });

    // Spawn shutdown signal handler
    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping server...");
        shutdown_server.shutdown();
    });

    // Run server (blocks until shutdown)
    serve_until_shutdown(&server).await?;

    if !server.wait_for_drain(DRAIN_TIMEOUT).await {
        tracing::warn!(
            "{} connection(s) still open after {:?}",
            server.registry().len(),
            DRAIN_TIMEOUT
        );
    }

    if let Some(handle) = metrics_handle {
        let _ = handle.await;
    }

    tracing::info!("Server stopped");
    Ok(())
}
