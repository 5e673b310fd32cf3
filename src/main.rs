//! uptrail - network reachability monitor
//!
//! Probes a public DNS server, the default gateway and operator-defined
//! targets, and records failure episodes and daily summaries.

mod config;
mod db;
mod events;
mod probe;
mod registry;
mod scheduler;
mod web;

use config::ServerConfig;
use db::Store;
use events::EventSink;
use probe::PingProber;
use registry::TargetRegistry;
use scheduler::{RetentionManager, Scheduler};
use web::{AppState, Server};

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("uptrail=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting uptrail on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);

    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    let events = EventSink::new();
    let registry = Arc::new(TargetRegistry::new(events.clone()));
    let scheduler = Arc::new(Scheduler::new(
        registry.clone(),
        store.clone(),
        Arc::new(PingProber),
        events.clone(),
        cfg.monitor,
    ));

    let retention = RetentionManager::new(store.clone(), cfg.retention_days);
    retention.start().await;

    if cfg.autostart {
        scheduler.start().await;
    } else {
        tracing::info!("Autostart disabled; waiting for POST /api/monitoring/start");
    }

    let server = Server::new(AppState {
        config: cfg,
        store,
        registry,
        scheduler: scheduler.clone(),
        events,
    });
    server.start(shutdown_signal()).await?;

    tracing::info!("Shutting down");
    scheduler.stop().await;
    retention.stop().await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
