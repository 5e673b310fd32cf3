//! HTTP request handlers.

use super::AppState;
use crate::db::DbError;
use crate::events::Event;
use crate::registry::{RegistryError, GOOGLE_DNS};
use crate::scheduler::MonitorError;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tokio_stream::{Stream, StreamExt};

const SUMMARY_DAYS: u32 = 7;

// ============================================================================
// Errors
// ============================================================================

/// Failure of a request, rendered as `{"detail": "..."}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }

    #[cfg(test)]
    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        let status = match e {
            RegistryError::InvalidTarget(_) | RegistryError::FixedTarget(_) => StatusCode::BAD_REQUEST,
            RegistryError::DuplicateTarget(_) => StatusCode::CONFLICT,
            RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
        };
        Self::new(status, e.to_string())
    }
}

impl From<DbError> for ApiError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::NotFound(_) => Self::new(StatusCode::NOT_FOUND, e.to_string()),
            other => Self::new(StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
        }
    }
}

impl From<MonitorError> for ApiError {
    fn from(e: MonitorError) -> Self {
        match e {
            MonitorError::NotInitialized => Self::new(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
            MonitorError::Persistence(db) => db.into(),
            MonitorError::Worker(_) => Self::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!("Request failed: {}", self.detail);
        }
        (self.status, Json(json!({ "detail": self.detail }))).into_response()
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

// ============================================================================
// API: Status
// ============================================================================

pub async fn handle_status(State(state): State<AppState>) -> ApiResult {
    let stats = state.scheduler.stats().await;
    Ok(Json(json!({
        "status": "online",
        "timestamp": Utc::now(),
        "monitoring_active": stats.is_running,
        "targets": {
            "google_dns": GOOGLE_DNS,
            "gateway": state.scheduler.gateway_ip().await,
            "custom_targets": state.registry.custom().await,
        },
        "stats": stats,
        "version": env!("CARGO_PKG_VERSION"),
    })))
}

// ============================================================================
// API: Targets
// ============================================================================

pub async fn handle_get_targets(State(state): State<AppState>) -> ApiResult {
    Ok(Json(json!({
        "default_targets": {
            "google_dns": GOOGLE_DNS,
            "gateway": state.scheduler.gateway_ip().await,
        },
        "targets": state.registry.list().await,
    })))
}

#[derive(Debug, Deserialize)]
pub struct TargetRequest {
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub name: String,
    pub enabled: Option<bool>,
}

impl TargetRequest {
    fn address(&self) -> Result<&str, ApiError> {
        match self.ip.trim() {
            "" => Err(ApiError::new(StatusCode::BAD_REQUEST, "ip is required")),
            ip => Ok(ip),
        }
    }
}

pub async fn handle_add_target(
    State(state): State<AppState>,
    Json(req): Json<TargetRequest>,
) -> ApiResult {
    let ip = req.address()?;
    let target = state
        .registry
        .add(ip, &req.name, req.enabled.unwrap_or(true))
        .await?;

    Ok(Json(json!({
        "success": true,
        "message": "Target added",
        "target": target,
    })))
}

pub async fn handle_update_target(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<TargetRequest>,
) -> ApiResult {
    let new_ip = req.address()?;
    let target = state
        .registry
        .update(&id, new_ip, &req.name, req.enabled)
        .await?;

    Ok(Json(json!({
        "success": true,
        "message": "Target updated",
        "target": target,
    })))
}

pub async fn handle_remove_target(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult {
    state.registry.remove(&id).await?;
    Ok(Json(json!({
        "success": true,
        "message": "Target removed",
    })))
}

// ============================================================================
// API: Monitoring control
// ============================================================================

pub async fn handle_start_monitoring(State(state): State<AppState>) -> ApiResult {
    state.scheduler.start().await;
    Ok(Json(json!({ "success": true, "monitoring_active": state.scheduler.is_running() })))
}

pub async fn handle_stop_monitoring(State(state): State<AppState>) -> ApiResult {
    state.scheduler.stop().await;
    Ok(Json(json!({ "success": true, "monitoring_active": state.scheduler.is_running() })))
}

#[derive(Debug, Deserialize)]
pub struct ConfigRequest {
    pub ping_interval: Option<u64>,
    pub failure_threshold: Option<u32>,
}

pub async fn handle_update_config(
    State(state): State<AppState>,
    Json(req): Json<ConfigRequest>,
) -> ApiResult {
    let settings = state
        .scheduler
        .update_config(req.ping_interval, req.failure_threshold)
        .await;
    Ok(Json(json!({ "success": true, "settings": settings })))
}

// ============================================================================
// API: Reports
// ============================================================================

pub async fn handle_get_reports(State(state): State<AppState>) -> ApiResult {
    let reports = state.store.list_reports()?;
    let summary = state.store.failure_summary(SUMMARY_DAYS)?;

    Ok(Json(json!({
        "active_failures": state.scheduler.active_failures().await,
        "reports": reports,
        "summary": summary,
    })))
}

pub async fn handle_generate_report(State(state): State<AppState>) -> ApiResult {
    let name = state.scheduler.generate_daily_report().await?;
    Ok(Json(json!({
        "success": true,
        "message": "Report generated",
        "filename": name,
    })))
}

pub async fn handle_get_report(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult {
    Ok(Json(state.store.get_report_content(&name)?))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

/// Probe history, oldest first. `limit` keeps only the most recent entries.
pub async fn handle_get_history(
    State(state): State<AppState>,
    Query(q): Query<HistoryQuery>,
) -> ApiResult {
    let mut history = state.scheduler.history().await;
    if let Some(limit) = q.limit {
        let skip = history.len().saturating_sub(limit);
        history.drain(..skip);
    }
    Ok(Json(json!(history)))
}

// ============================================================================
// Live events
// ============================================================================

pub async fn handle_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let stream = BroadcastStream::new(state.events.subscribe()).filter_map(|msg| match msg {
        Ok(event) => to_sse(&event).map(Ok),
        Err(BroadcastStreamRecvError::Lagged(n)) => {
            tracing::warn!("Event subscriber lagged, {} events dropped", n);
            None
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn to_sse(event: &Event) -> Option<SseEvent> {
    match SseEvent::default().event(event.kind()).json_data(event) {
        Ok(sse) => Some(sse),
        Err(e) => {
            tracing::warn!("Failed to encode {} event: {}", event.kind(), e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::db::Store;
    use crate::events::EventSink;
    use crate::probe::PingProber;
    use crate::registry::TargetRegistry;
    use crate::scheduler::{MonitorSettings, Scheduler};
    use std::sync::Arc;
    use tempfile::NamedTempFile;

    fn state(db: &NamedTempFile) -> AppState {
        let store = Arc::new(Store::new(db.path()).unwrap());
        let events = EventSink::new();
        let registry = Arc::new(TargetRegistry::new(events.clone()));
        let scheduler = Arc::new(Scheduler::new(
            registry.clone(),
            store.clone(),
            Arc::new(PingProber),
            events.clone(),
            MonitorSettings::default(),
        ));
        AppState {
            config: ServerConfig::default(),
            store,
            registry,
            scheduler,
            events,
        }
    }

    fn request(ip: &str) -> Json<TargetRequest> {
        Json(TargetRequest {
            ip: ip.to_string(),
            name: String::new(),
            enabled: None,
        })
    }

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (ApiError::from(RegistryError::InvalidTarget("x".into())), StatusCode::BAD_REQUEST),
            (ApiError::from(RegistryError::FixedTarget("x".into())), StatusCode::BAD_REQUEST),
            (ApiError::from(RegistryError::DuplicateTarget("x".into())), StatusCode::CONFLICT),
            (ApiError::from(RegistryError::NotFound("x".into())), StatusCode::NOT_FOUND),
            (ApiError::from(MonitorError::NotInitialized), StatusCode::SERVICE_UNAVAILABLE),
            (ApiError::from(DbError::NotFound("x".into())), StatusCode::NOT_FOUND),
            (ApiError::from(DbError::Poisoned), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(err.status(), status);
        }
    }

    #[tokio::test]
    async fn test_target_lifecycle() {
        let db = NamedTempFile::new().unwrap();
        let state = state(&db);

        let err = handle_add_target(State(state.clone()), request("  ")).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        let Json(body) = handle_add_target(State(state.clone()), request("192.0.2.10")).await.unwrap();
        assert_eq!(body["target"]["name"], "Target 192.0.2.10");
        assert_eq!(body["target"]["enabled"], true);

        let err = handle_add_target(State(state.clone()), request("192.0.2.10")).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::CONFLICT);

        let Json(body) = handle_update_target(
            State(state.clone()),
            Path("192.0.2.10".to_string()),
            request("192.0.2.11"),
        )
        .await
        .unwrap();
        assert_eq!(body["target"]["id"], "192.0.2.11");

        let err = handle_remove_target(State(state.clone()), Path("192.0.2.10".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);

        let err = handle_remove_target(State(state.clone()), Path(GOOGLE_DNS.to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        assert!(handle_remove_target(State(state.clone()), Path("192.0.2.11".to_string()))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_targets_listing_includes_fixed_then_custom() {
        let db = NamedTempFile::new().unwrap();
        let state = state(&db);
        handle_add_target(State(state.clone()), request("192.0.2.10")).await.unwrap();

        let Json(body) = handle_get_targets(State(state)).await.unwrap();
        let ids: Vec<_> = body["targets"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(ids, vec![GOOGLE_DNS, "gateway", "192.0.2.10"]);
        assert_eq!(body["default_targets"]["google_dns"], GOOGLE_DNS);
    }

    #[tokio::test]
    async fn test_generate_report_before_start_is_unavailable() {
        let db = NamedTempFile::new().unwrap();
        let err = handle_generate_report(State(state(&db))).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_unknown_report_is_not_found() {
        let db = NamedTempFile::new().unwrap();
        let err = handle_get_report(State(state(&db)), Path("daily_report_1999-01-01.json".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_config_update_is_clamped() {
        let db = NamedTempFile::new().unwrap();
        let Json(body) = handle_update_config(
            State(state(&db)),
            Json(ConfigRequest {
                ping_interval: Some(0),
                failure_threshold: Some(25),
            }),
        )
        .await
        .unwrap();
        assert_eq!(body["settings"]["ping_interval"], 1);
        assert_eq!(body["settings"]["failure_threshold"], 10);
    }

    #[tokio::test]
    async fn test_reports_listing_shape() {
        let db = NamedTempFile::new().unwrap();
        let Json(body) = handle_get_reports(State(state(&db))).await.unwrap();
        assert!(body["reports"].as_array().unwrap().is_empty());
        assert_eq!(body["summary"]["period_days"], 7);
        assert!(body["active_failures"].as_object().unwrap().is_empty());
    }

    #[test]
    fn test_event_encodes_as_sse() {
        let event = Event::ReportPersistFailed {
            report_id: "FAIL_192_0_2_1_20240501_090000".into(),
            error: "disk I/O error".into(),
        };
        assert!(to_sse(&event).is_some());
    }
}
