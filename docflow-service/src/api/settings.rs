//! Settings API endpoints for managing runtime configuration.

use axum::{Json, extract::State};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::api::{AppState, Owner};
use crate::error::ServiceError;

/// Response for GET /api/settings
#[derive(Debug, Serialize)]
pub struct SettingsResponse {
    /// All current settings (merged: defaults + DB overrides)
    pub settings: HashMap<String, serde_json::Value>,
    /// Which keys have DB overrides (vs using defaults)
    pub overridden: Vec<String>,
}

/// Request body for PUT /api/settings
#[derive(Debug, Deserialize)]
pub struct UpdateSettingsRequest {
    /// Settings to update (key -> value). Use null to delete/revert to default.
    pub settings: HashMap<String, serde_json::Value>,
}

/// GET /api/settings - retrieve all settings with their current values
pub async fn get_settings_handler(
    State(state): State<Arc<AppState>>,
    _owner: Owner,
) -> Result<Json<SettingsResponse>, ServiceError> {
    settings_response(&state).map(Json)
}

/// PUT /api/settings - update settings (triggers hot reload)
pub async fn update_settings_handler(
    State(state): State<Arc<AppState>>,
    _owner: Owner,
    Json(request): Json<UpdateSettingsRequest>,
) -> Result<Json<SettingsResponse>, ServiceError> {
    state.service.update_settings(request.settings)?;
    settings_response(&state).map(Json)
}

fn settings_response(state: &AppState) -> Result<SettingsResponse, ServiceError> {
    // DB overrides tell us which keys are explicitly set
    let mut overridden: Vec<String> = state.service.db.get_all_settings()?.into_keys().collect();
    overridden.sort();

    Ok(SettingsResponse {
        settings: state.service.settings(),
        overridden,
    })
}

#[cfg(test)]
mod tests {
    use axum::http::{Method, StatusCode};
    use serde_json::json;
    use tower::ServiceExt;

    use crate::api::router;
    use crate::api::tests::{json_body, request};
    use crate::service::testing::Harness;

    #[tokio::test]
    async fn test_update_settings_hot_reloads() {
        let h = Harness::new();
        let app = router(h.service.clone(), None);

        let response = app
            .clone()
            .oneshot(request(
                Method::PUT,
                "/api/settings",
                Some(json!({ "settings": { "queue.retry_priority_boost": 25 } })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["settings"]["queue.retry_priority_boost"], 25);
        assert_eq!(body["overridden"], json!(["queue.retry_priority_boost"]));
        assert_eq!(
            h.service.runtime_config.dynamic().queue.retry_priority_boost,
            25
        );

        let response = app
            .oneshot(request(
                Method::PUT,
                "/api/settings",
                Some(json!({ "settings": { "queue.bogus": 1 } })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_retry_ceiling_is_not_a_setting() {
        let h = Harness::new();
        let app = router(h.service.clone(), None);

        let response = app
            .clone()
            .oneshot(request(
                Method::PUT,
                "/api/settings",
                Some(json!({ "settings": { "queue.max_retries": 5 } })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["code"], "invalid_request");
        assert!(h.service.db.get_all_settings().unwrap().is_empty());

        let response = app
            .oneshot(request(Method::GET, "/api/settings", None))
            .await
            .unwrap();
        assert!(json_body(response).await["settings"]
            .get("queue.max_retries")
            .is_none());
    }
}
