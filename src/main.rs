//! Tabletop Session Engine - Live-session backend for tabletop RPG tables
//!
//! The engine coordinates a table while it plays:
//! - Turn rotation with pause, skip and timed auto-advance
//! - Chat, whispers and dice rolls on an ordered, replayable event log
//! - Scene broadcast from the GM to every player
//! - Reconnect with replay from the last seen event

mod application;
mod domain;
mod infrastructure;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::infrastructure::config::AppConfig;
use crate::infrastructure::http;
use crate::infrastructure::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tabletop_session_engine=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Tabletop Session Engine");

    // Load configuration
    let config = AppConfig::from_env()?;
    tracing::info!("Configuration loaded");
    tracing::info!("  Store: {}", config.store.backend);
    tracing::info!("  Turn duration: {}s", config.session.turn_duration_secs);
    tracing::info!("  Open enrollment: {}", config.open_enrollment);

    // Initialize application state
    let state = Arc::new(AppState::new(config).await?);
    tracing::info!("Application state initialized");

    // Pick up sessions from before the restart: open ones with their timers,
    // ended ones for read-back until retention runs out
    let restored = state.coordinator.restore_sessions().await?;
    tracing::info!("Restored {} session(s)", restored);

    let shutdown = CancellationToken::new();

    // Cleanup worker (purges ended sessions past their retention window)
    let cleanup_worker = {
        let coordinator = state.coordinator.clone();
        let interval = Duration::from_secs(state.config.session.cleanup_interval_secs.max(1));
        let cancel = shutdown.clone();
        tokio::spawn(async move {
            tracing::info!("Starting ended-session cleanup worker");
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let purged = coordinator.cleanup_ended(chrono::Utc::now()).await;
                        if purged > 0 {
                            tracing::info!("Purged {} ended session(s)", purged);
                        }
                    }
                }
            }
        })
    };

    // Build the router
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(infrastructure::websocket::ws_handler))
        // Merge REST API routes
        .merge(http::create_routes())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    // Start the server
    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.server_port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let server = axum::serve(listener, app);

    // Wait for shutdown signal (Ctrl+C)
    tokio::select! {
        result = server => {
            if let Err(e) = result {
                tracing::error!("Server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received, stopping workers...");
        }
    }

    shutdown.cancel();
    if let Err(e) = cleanup_worker.await {
        tracing::warn!("Cleanup worker ended abnormally: {}", e);
    }
    state.coordinator.shutdown().await;
    tracing::info!("Turn timers stopped");

    Ok(())
}

async fn health_check() -> &'static str {
    "OK"
}
