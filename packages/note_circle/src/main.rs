use anyhow::{Context, Result};
use axum::{Router, routing::get};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::prelude::*;

mod config;
mod handlers;
mod metrics;
mod session;
mod ws;

use crate::config::FileConfig;
use crate::metrics::ServerMetrics;
use crate::session::SessionRegistry;
use crate::ws::{Coordinator, Hub, attach_disconnect_handler};

#[derive(Parser)]
#[command(name = "circle")]
#[command(about = "Real-time server for appreciation note circles")]
struct Cli {
    /// Host to bind to
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Port for the web server
    #[arg(short, long)]
    port: Option<u16>,

    /// Path to the config file (defaults to ./circle.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

/// Shared state handed to every axum handler.
#[derive(Clone)]
pub(crate) struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub hub: Arc<Hub>,
    pub coordinator: Arc<Coordinator>,
    pub metrics: Arc<ServerMetrics>,
    pub config: Arc<FileConfig>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let default_directive = if cli.debug {
        "circle=debug,tower_http=debug,info"
    } else {
        "circle=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    info!("Starting note circle server");

    let file_config: FileConfig = config::load_config(cli.config.as_deref())
        .extract()
        .context("invalid configuration")?;
    let config = Arc::new(file_config);

    let metrics = Arc::new(ServerMetrics::new());
    let registry = Arc::new(SessionRegistry::new());
    let hub = Arc::new(Hub::new());
    let coordinator = Arc::new(Coordinator::new(
        hub.clone(),
        registry.clone(),
        metrics.clone(),
    ));
    attach_disconnect_handler(&hub, coordinator.clone());

    // Background sweep evicting abandoned and expired sessions.
    let shutdown = CancellationToken::new();
    tokio::spawn(registry.clone().run_sweeper(
        config.session.sweep_interval(),
        config.session.completed_retention(),
        metrics.clone(),
        shutdown.clone(),
    ));

    let app_state = AppState {
        registry,
        hub,
        coordinator,
        metrics,
        config: config.clone(),
    };

    let app = Router::new()
        .route("/health", get(handlers::health_handler))
        .route("/health/live", get(handlers::health_live_handler))
        .route("/metrics", get(handlers::metrics_handler))
        .route("/ws", get(handlers::websocket_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(app_state);

    let host = cli
        .host
        .or_else(|| config.server.host.clone())
        .unwrap_or_else(|| "127.0.0.1".to_string());
    let port = cli.port.or(config.server.port).unwrap_or(8080);
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .context("invalid bind address")?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    let actual_addr = listener.local_addr()?;
    info!("Note circle listening on http://{actual_addr}");
    info!("WebSocket endpoint: ws://{actual_addr}/ws");

    // Create shutdown signal handler
    let sweep_shutdown = shutdown.clone();
    let shutdown_signal = async move {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
        info!("Received shutdown signal, cleaning up...");
        sweep_shutdown.cancel();
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error")?;

    info!("Shutdown complete");
    Ok(())
}
