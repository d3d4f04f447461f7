//! Document API endpoints.
//!
//! Upload plus the per-document job operations: enqueue, status, retry and
//! cancel. All of them are scoped to the authenticated owner.

use axum::{
    Json,
    extract::{Multipart, Path, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::db::{Document, Job};
use crate::error::ServiceError;
use crate::service::JobStatusView;

use super::{AppState, Owner};

/// Response for an accepted upload
#[derive(Serialize)]
pub struct UploadResponse {
    pub document: Document,
    pub job: Job,
}

/// Request to (re-)enqueue a document
#[derive(Deserialize)]
pub struct EnqueueRequest {
    #[serde(default)]
    pub priority: i64,
}

/// Upload a new document and enqueue it
pub async fn upload_document_handler(
    State(state): State<Arc<AppState>>,
    Owner(owner_id): Owner,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<UploadResponse>), ServiceError> {
    let mut file_data: Option<(Vec<u8>, String)> = None;
    let mut title: Option<String> = None;
    let mut priority: i64 = 0;

    while let Ok(Some(field)) = multipart.next_field().await {
        let name = field.name().unwrap_or("").to_string();

        match name.as_str() {
            "file" => {
                let filename = field.file_name().unwrap_or("").to_string();
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| ServiceError::InvalidRequest {
                        message: e.to_string(),
                    })?;
                file_data = Some((data.to_vec(), filename));
            }
            "title" => {
                title = Some(field.text().await.map_err(|e| {
                    ServiceError::InvalidRequest {
                        message: e.to_string(),
                    }
                })?);
            }
            "priority" => {
                let raw = field
                    .text()
                    .await
                    .map_err(|e| ServiceError::InvalidRequest {
                        message: e.to_string(),
                    })?;
                priority = raw
                    .trim()
                    .parse()
                    .map_err(|_| ServiceError::InvalidRequest {
                        message: format!("Invalid priority: {}", raw),
                    })?;
            }
            _ => {}
        }
    }

    let (data, filename) = file_data.ok_or_else(|| ServiceError::InvalidRequest {
        message: "No file provided".to_string(),
    })?;
    let title = title.unwrap_or_default();

    let (document, job) = state
        .service
        .upload_document(&owner_id, &data, &filename, &title, priority)
        .await?;

    Ok((StatusCode::CREATED, Json(UploadResponse { document, job })))
}

/// Enqueue a document, or re-prioritize its pending job
pub async fn enqueue_handler(
    State(state): State<Arc<AppState>>,
    Owner(owner_id): Owner,
    Path(id): Path<String>,
    Json(request): Json<EnqueueRequest>,
) -> Result<Json<Job>, ServiceError> {
    let job = state.service.enqueue(&owner_id, &id, request.priority)?;
    Ok(Json(job))
}

pub async fn status_handler(
    State(state): State<Arc<AppState>>,
    Owner(owner_id): Owner,
    Path(id): Path<String>,
) -> Result<Json<JobStatusView>, ServiceError> {
    Ok(Json(state.service.job_status(&owner_id, &id)?))
}

pub async fn retry_handler(
    State(state): State<Arc<AppState>>,
    Owner(owner_id): Owner,
    Path(id): Path<String>,
) -> Result<Json<Job>, ServiceError> {
    Ok(Json(state.service.retry(&owner_id, &id)?))
}

pub async fn cancel_handler(
    State(state): State<Arc<AppState>>,
    Owner(owner_id): Owner,
    Path(id): Path<String>,
) -> Result<Json<Job>, ServiceError> {
    Ok(Json(state.service.cancel(&owner_id, &id)?))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode, header};
    use serde_json::json;
    use tower::ServiceExt;

    use crate::api::router;
    use crate::api::tests::{json_body, request};
    use crate::db::JobStage;
    use crate::service::testing::{Fault, Harness, OTHER_OWNER, OWNER, TOKEN, add_document};

    #[tokio::test]
    async fn test_enqueue_dispatch_and_poll_status() {
        let h = Harness::new();
        h.add_document("doc", "alpha beta gamma delta epsilon");
        let app = router(h.service.clone(), None);

        let response = app
            .clone()
            .oneshot(request(
                Method::POST,
                "/api/documents/doc/enqueue",
                Some(json!({ "priority": 5 })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let job = json_body(response).await;
        assert_eq!(job["status"], "pending");
        assert_eq!(job["priority"], 5);

        let response = app
            .clone()
            .oneshot(request(Method::GET, "/api/documents/doc/status", None))
            .await
            .unwrap();
        let status = json_body(response).await;
        assert_eq!(status["status"], "pending");
        assert_eq!(status["progress"], 0);
        assert!(status["stage"].is_null());

        let response = app
            .clone()
            .oneshot(request(Method::POST, "/api/jobs/dispatch", None))
            .await
            .unwrap();
        assert_eq!(json_body(response).await["processed"], true);

        let response = app
            .oneshot(request(Method::GET, "/api/documents/doc/status", None))
            .await
            .unwrap();
        let status = json_body(response).await;
        assert_eq!(status["status"], "completed");
        assert_eq!(status["progress"], 100);
        assert!(status["stage"].is_null());
        assert_eq!(status["result_count"], 3);
    }

    #[tokio::test]
    async fn test_retry_limit_maps_to_conflict() {
        let h = Harness::new();
        h.add_document("doc", "some words here");
        h.service.enqueue(OWNER, "doc", 0).unwrap();
        for _ in 0..3 {
            h.backend
                .fail_next(JobStage::GeneratingEmbeddings, Fault::Transient);
            h.service.process_next_job().await.unwrap();
        }
        // The last allowed attempt fails too
        h.service.retry(OWNER, "doc").unwrap();
        h.backend
            .fail_next(JobStage::GeneratingEmbeddings, Fault::Transient);
        h.service.process_next_job().await.unwrap();
        let app = router(h.service.clone(), None);

        let response = app
            .oneshot(request(Method::POST, "/api/documents/doc/retry", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body = json_body(response).await;
        assert_eq!(body["code"], "retry_limit_reached");
        assert_eq!(body["details"]["retry_count"], 3);
    }

    #[tokio::test]
    async fn test_other_owners_document_reads_as_missing() {
        let h = Harness::new();
        add_document(&h.service, OTHER_OWNER, "theirs", "text");
        let app = router(h.service.clone(), None);

        let response = app
            .oneshot(request(
                Method::POST,
                "/api/documents/theirs/cancel",
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(response).await["code"], "document_not_found");
    }

    #[tokio::test]
    async fn test_multipart_upload_enqueues() {
        let h = Harness::new();
        let app = router(h.service.clone(), None);

        let boundary = "docflow-boundary";
        let body = format!(
            "--{b}\r\n\
             Content-Disposition: form-data; name=\"title\"\r\n\r\n\
             Field notes\r\n\
             --{b}\r\n\
             Content-Disposition: form-data; name=\"priority\"\r\n\r\n\
             3\r\n\
             --{b}\r\n\
             Content-Disposition: form-data; name=\"file\"; filename=\"notes.md\"\r\n\
             Content-Type: text/markdown\r\n\r\n\
             # Notes\n\nsome text\r\n\
             --{b}--\r\n",
            b = boundary
        );
        let upload = Request::builder()
            .method(Method::POST)
            .uri("/api/documents")
            .header(header::AUTHORIZATION, format!("Bearer {}", TOKEN))
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", boundary),
            )
            .body(Body::from(body))
            .unwrap();

        let response = app.oneshot(upload).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = json_body(response).await;
        assert_eq!(body["document"]["title"], "Field notes");
        assert_eq!(body["job"]["status"], "pending");
        assert_eq!(body["job"]["priority"], 3);
    }
}
