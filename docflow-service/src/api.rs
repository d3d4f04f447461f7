//! HTTP API for the docflow service.
//!
//! This module provides the REST API endpoints for:
//! - Health and metrics monitoring
//! - Document upload and job control
//! - Dispatch and reaper triggers
//! - Runtime settings

use axum::{
    Json, RequestPartsExt, Router,
    extract::{DefaultBodyLimit, FromRequestParts, State},
    http::{StatusCode, header, request::Parts},
    response::IntoResponse,
    routing::{get, post},
};
use axum_extra::{
    TypedHeader,
    headers::{Authorization, authorization::Bearer},
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::ServiceError;
use crate::service::DocflowService;

pub mod documents;
pub mod jobs;
pub mod settings;
use documents::{
    cancel_handler, enqueue_handler, retry_handler, status_handler, upload_document_handler,
};
use jobs::{dispatch_handler, reap_handler};
use settings::{get_settings_handler, update_settings_handler};

/// Application state
pub struct AppState {
    pub service: Arc<DocflowService>,
    pub start_time: Instant,
    pub metrics: Option<PrometheusHandle>,
}

/// Owner id resolved from the request's bearer token
pub struct Owner(pub String);

impl FromRequestParts<Arc<AppState>> for Owner {
    type Rejection = ServiceError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(bearer)) = parts
            .extract::<TypedHeader<Authorization<Bearer>>>()
            .await
            .map_err(|_| ServiceError::Unauthorized)?;

        let owner_id = state.service.authenticate(bearer.token()).await?;
        Ok(Owner(owner_id))
    }
}

/// Build the API router
pub fn router(service: Arc<DocflowService>, metrics: Option<PrometheusHandle>) -> Router {
    // Use the configured max document size for uploads
    let max_body_size = service
        .runtime_config
        .dynamic()
        .limits
        .max_document_size_bytes as usize;

    let state = Arc::new(AppState {
        service,
        start_time: Instant::now(),
        metrics,
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        // Document endpoints - with larger body limit for file uploads
        .route(
            "/documents",
            post(upload_document_handler).layer(DefaultBodyLimit::max(max_body_size)),
        )
        .route("/documents/{id}/enqueue", post(enqueue_handler))
        .route("/documents/{id}/status", get(status_handler))
        .route("/documents/{id}/retry", post(retry_handler))
        .route("/documents/{id}/cancel", post(cancel_handler))
        // Triggers
        .route("/jobs/dispatch", post(dispatch_handler))
        .route("/jobs/reap", post(reap_handler))
        // Settings endpoints
        .route(
            "/settings",
            get(get_settings_handler).put(update_settings_handler),
        );

    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .nest("/api", api_routes)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// === Health & Metrics ===

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let backend_available = state.service.backend.health_check().await;

    let status = if backend_available {
        "healthy".to_string()
    } else {
        "degraded: processing backend unavailable".to_string()
    };

    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        backend_available,
    })
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    uptime_seconds: u64,
    backend_available: bool,
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        ),
        None => (
            StatusCode::NOT_FOUND,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            "metrics recorder not installed\n".to_string(),
        ),
    }
}
