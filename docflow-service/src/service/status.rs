//! Read-only job status for polling clients.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::db::{JobErrorDetails, JobErrorKind, JobStage, JobStatus, MAX_RETRIES};
use crate::error::ServiceResult;
use crate::service::DocflowService;

/// Latest known state of a document's job
#[derive(Debug, Clone, Serialize)]
pub struct JobStatusView {
    pub job_id: String,
    pub document_id: String,
    pub status: JobStatus,
    pub stage: Option<JobStage>,
    pub progress: u8,
    pub priority: i64,
    pub retry_count: u32,
    pub max_retries: u32,
    pub error_kind: Option<JobErrorKind>,
    pub error_message: Option<String>,
    pub error_details: Option<JobErrorDetails>,
    pub result_count: usize,
    pub created_at: DateTime<Utc>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub processing_completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub last_retry_at: Option<DateTime<Utc>>,
}

impl DocflowService {
    /// Current status of an owner's document job.
    ///
    /// For completed jobs the result count is recounted from stored chunks
    /// rather than trusted from the job row.
    pub fn job_status(&self, owner_id: &str, document_id: &str) -> ServiceResult<JobStatusView> {
        let job = self.owned_job(owner_id, document_id)?;

        let result_count = if job.status == JobStatus::Completed {
            self.db.count_chunks(&job.document_id)?
        } else {
            job.result_count
        };

        Ok(JobStatusView {
            job_id: job.id,
            document_id: job.document_id,
            status: job.status,
            stage: job.stage,
            progress: job.progress,
            priority: job.priority,
            retry_count: job.retry_count,
            max_retries: MAX_RETRIES,
            error_kind: job.error_kind,
            error_message: job.error_message,
            error_details: job.error_details,
            result_count,
            created_at: job.created_at,
            processing_started_at: job.processing_started_at,
            processing_completed_at: job.processing_completed_at,
            updated_at: job.updated_at,
            last_retry_at: job.last_retry_at,
        })
    }
}
