//! Trigger endpoints for the dispatcher and the stuck-job reaper.
//!
//! Both run exactly one invocation of the underlying operation, the same one
//! the bundled interval triggers call.

use axum::{Json, extract::State};
use serde::Serialize;
use std::sync::Arc;

use crate::error::ServiceError;
use crate::service::SweepReport;

use super::{AppState, Owner};

/// Response for POST /api/jobs/dispatch
#[derive(Serialize)]
pub struct DispatchResponse {
    /// Whether this invocation claimed and ran a job
    pub processed: bool,
}

/// POST /api/jobs/dispatch - process the next pending job, if any
pub async fn dispatch_handler(
    State(state): State<Arc<AppState>>,
    _owner: Owner,
) -> Result<Json<DispatchResponse>, ServiceError> {
    let processed = state.service.process_next_job().await?;
    Ok(Json(DispatchResponse { processed }))
}

/// POST /api/jobs/reap - sweep for jobs stuck in processing
pub async fn reap_handler(
    State(state): State<Arc<AppState>>,
    _owner: Owner,
) -> Result<Json<SweepReport>, ServiceError> {
    Ok(Json(state.service.sweep_stuck_jobs()?))
}

#[cfg(test)]
mod tests {
    use axum::http::{Method, StatusCode};
    use chrono::{Duration, Utc};
    use tower::ServiceExt;

    use crate::api::router;
    use crate::api::tests::{json_body, request};
    use crate::service::testing::{Harness, OWNER};

    #[tokio::test]
    async fn test_dispatch_on_empty_queue() {
        let h = Harness::new();
        let app = router(h.service.clone(), None);

        let response = app
            .oneshot(request(Method::POST, "/api/jobs/dispatch", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["processed"], false);
    }

    #[tokio::test]
    async fn test_reap_reports_cleaned_jobs() {
        let h = Harness::new();
        h.add_document("doc", "some text");
        let job = h.service.enqueue(OWNER, "doc", 0).unwrap();
        h.service
            .db
            .claim_job(&job.id, Utc::now() - Duration::minutes(16))
            .unwrap()
            .unwrap();
        let app = router(h.service.clone(), None);

        let response = app
            .oneshot(request(Method::POST, "/api/jobs/reap", None))
            .await
            .unwrap();
        let report = json_body(response).await;
        assert_eq!(report["cleaned"], 1);
        assert_eq!(report["errors"], serde_json::json!([]));
    }
}
