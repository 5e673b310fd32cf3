//! Web server module.

mod handlers;

use crate::config::ServerConfig;
use crate::db::Store;
use crate::events::EventSink;
use crate::registry::TargetRegistry;
use crate::scheduler::Scheduler;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post, put},
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub store: Arc<Store>,
    pub registry: Arc<TargetRegistry>,
    pub scheduler: Arc<Scheduler>,
    pub events: EventSink,
}

/// Web server for uptrail.
pub struct Server {
    state: AppState,
}

impl Server {
    /// Create a new server with the given dependencies.
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Build the router with all routes.
    pub fn routes(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        Router::new()
            .route("/api/status", get(handlers::handle_status))
            // Targets
            .route("/api/targets", get(handlers::handle_get_targets))
            .route("/api/targets/custom", post(handlers::handle_add_target))
            .route(
                "/api/targets/custom/{id}",
                put(handlers::handle_update_target).delete(handlers::handle_remove_target),
            )
            // Monitoring control
            .route("/api/monitoring/start", post(handlers::handle_start_monitoring))
            .route("/api/monitoring/stop", post(handlers::handle_stop_monitoring))
            .route("/api/config", put(handlers::handle_update_config))
            // Reports
            .route("/api/reports", get(handlers::handle_get_reports))
            .route("/api/reports/generate", post(handlers::handle_generate_report))
            .route("/api/reports/{name}", get(handlers::handle_get_report))
            .route("/api/history", get(handlers::handle_get_history))
            // Live feed
            .route("/api/events", get(handlers::handle_events))
            .layer(cors)
            .layer(TraceLayer::new_for_http())
            .layer(DefaultBodyLimit::max(64 * 1024))
            .with_state(self.state.clone())
    }

    /// Serve on the configured port until `shutdown` resolves.
    pub async fn start(
        &self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = self.routes();

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}
