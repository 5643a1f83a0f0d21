//! Main entry point for the ziprelay service.
//!
//! Wires the configured storage backend, the session registry, and the HTTP
//! surface together and serves until interrupted.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use ziprelay::{
    AppState, Cli, HttpObjectStore, MemoryObjectStore, ObjectStore, SessionRegistry,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let store: Arc<dyn ObjectStore> = match &cli.storage_url {
        Some(url) => Arc::new(HttpObjectStore::new(url, &cli.bucket)?),
        None => {
            tracing::warn!("no --storage-url given; objects are kept in memory only");
            Arc::new(MemoryObjectStore::new(&cli.bucket))
        }
    };

    let state = AppState {
        registry: Arc::new(SessionRegistry::new()),
        store,
        incoming_prefix: cli.incoming_prefix.clone(),
        dest_prefix: cli.dest_prefix.clone(),
        grant_ttl: cli.grant_ttl(),
        max_in_flight: cli.max_in_flight,
        session_retention: cli.session_retention(),
    };

    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    tracing::info!(addr = %cli.listen, "listening");

    axum::serve(listener, ziprelay::server::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutting down");
}
