//! # siren-server
//!
//! HTTP server for the siren emergency backend.
//!
//! This binary provides:
//! - REST API for device registration, contact pairing and emergency alerts
//! - OpenAPI document at `/api/openapi.json`
//! - Structured logging to file and stdout
//! - Background expiry sweep for authentication codes
//!
//! ## Running
//!
//! ```bash
//! # Development (defaults; file storage under the platform data dir)
//! cargo run --package siren-server
//!
//! # Explicit configuration file
//! SIREN_CONFIG=/etc/siren/config.toml ./siren-server
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use siren_core::{default_config_path, Config, Siren};
use siren_server::api::create_router;
use siren_server::logging;
use siren_server::state::AppState;
use tokio::net::TcpListener;
use tracing::info;

/// Environment variable naming the configuration file.
const CONFIG_ENV: &str = "SIREN_CONFIG";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::var_os(CONFIG_ENV).map_or_else(default_config_path, PathBuf::from);
    let config = Config::load_or_default(&config_path)
        .with_context(|| format!("loading configuration from {}", config_path.display()))?;

    logging::init(&config.logging)?;
    info!(config = %config_path.display(), "Starting siren-server");

    let addr: SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {}", config.server.bind))?;

    let siren = Siren::open(config).await.context("assembling service")?;
    let _sweeper = siren.spawn_sweeper();

    let dispatcher = siren.alerts().clone();
    tokio::spawn(async move {
        if let Err(e) = dispatcher.resume_pending().await {
            tracing::error!(error = %e, "Failed to resume pending alerts");
        }
    });

    let app = create_router(AppState::new(siren));
    let listener = TcpListener::bind(addr).await?;
    info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("siren-server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
