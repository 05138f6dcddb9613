//! Club Capy Match Server - Authoritative multiplayer match server
//!
//! This is the main entry point for the match server. It handles:
//! - The find-match RPC that lists open matches or creates one
//! - WebSocket connections for joining matches and exchanging match data
//! - One tick-driven task per match that broadcasts player positions

mod app;
mod config;
mod game;
mod http;
mod matchmaking;
mod util;
mod ws;

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::app::AppState;
use crate::config::Config;
use crate::http::build_router;
use crate::util::time::init_server_time;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    init_tracing(&config.log_level);

    // Initialize server time tracking
    init_server_time();

    info!("Starting Club Capy Match Server");
    info!("Server address: {}", config.server_addr);
    info!(
        capacity = config.game.capacity,
        tick_rate = config.game.tick_rate,
        max_empty_secs = config.game.max_empty_secs,
        rejoin_policy = ?config.game.rejoin_policy,
        "Match settings"
    );

    // Create application state
    let state = AppState::new(config.clone());

    // Kept for shutdown; the router owns the rest of the state
    let match_registry = state.match_registry.clone();

    // Build router
    let router = build_router(state);

    // Start server
    let addr: SocketAddr = config.server_addr;
    let listener = TcpListener::bind(addr).await?;

    info!("Server listening on {}", addr);
    info!("Health check: http://{}/health", addr);
    info!("Find match RPC: http://{}/rpc/find_match", addr);
    info!("WebSocket endpoint: ws://{}/ws", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop matches that are still running
    let grace_secs = config.shutdown_grace_secs;
    match_registry.terminate_all(grace_secs).await;
    let grace = Duration::from_secs(grace_secs as u64);
    if tokio::time::timeout(grace, match_registry.drained()).await.is_err() {
        warn!(
            remaining = match_registry.active_matches(),
            "Matches still running after grace period"
        );
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        }
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        }
    }
}
