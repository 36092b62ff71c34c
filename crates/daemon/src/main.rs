//! Steward Control Daemon (stewardctl)
//!
//! Standalone service that:
//! - Runs the autonomous coordination core (governance, improvement, health)
//! - Persists decisions, outcomes, limits and events under a state directory
//! - Exposes a REST control API with Swagger UI
//!
//! Default bind: 127.0.0.1:8861
//! REST API: /api/v1/*

mod adapters;
mod api;
mod bootstrap;
mod config;

use anyhow::Result;
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with structured fields.
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true),
        )
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,stewardctl=debug,steward_core=debug")),
        )
        .init();

    info!("Starting Steward Control Daemon (stewardctl)");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let daemon_config = config::DaemonConfig::from_env();
    let bind_addr = daemon_config.bind.parse::<SocketAddr>()?;
    info!(
        state_dir = %daemon_config.state_dir.display(),
        repo_dir = %daemon_config.repo_dir.display(),
        "Configuration loaded"
    );

    // Wire the core and start its loops.
    let state = bootstrap::build(&daemon_config)?;
    let orchestrator = state.orchestrator.clone();
    orchestrator.clone().start();

    // Create API router and serve.
    let app = api::create_router(state);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

    info!("stewardctl listening on http://{}", bind_addr);
    info!("Swagger UI: http://{}/swagger-ui", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    // Reverse-order component shutdown with executor drain.
    orchestrator.shutdown().await;
    Ok(())
}
