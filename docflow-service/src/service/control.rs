//! Owner-initiated job transitions: enqueue, retry and cancel.

use tracing::info;

use crate::db::{Job, JobStatus, MAX_RETRIES};
use crate::error::{ServiceError, ServiceResult};
use crate::service::DocflowService;

impl DocflowService {
    /// Queue a document for processing at the given priority
    pub fn enqueue(&self, owner_id: &str, document_id: &str, priority: i64) -> ServiceResult<Job> {
        let document = self
            .db
            .get_document(document_id)?
            .filter(|doc| doc.owner_id == owner_id)
            .ok_or_else(|| ServiceError::DocumentNotFound {
                document_id: document_id.to_string(),
            })?;

        let job = self
            .db
            .upsert_job_for_enqueue(&document.id, &document.owner_id, priority)?;

        metrics::counter!("docflow_jobs_enqueued_total").increment(1);
        info!(job_id = %job.id, doc_id = %document.id, priority, "Job enqueued");
        self.broadcast_job_progress(&job.id, &job.document_id, job.status, None, job.progress);

        Ok(job)
    }

    /// Revive a failed job that has retries left
    pub fn retry(&self, owner_id: &str, document_id: &str) -> ServiceResult<Job> {
        let job = self.owned_job(owner_id, document_id)?;
        let boost = self.runtime_config.dynamic().queue.retry_priority_boost;

        if !self.db.retry_job(&job.id, MAX_RETRIES, boost)? {
            // Report against the freshest state we can see
            let current = self.db.get_job(&job.id)?.unwrap_or(job);
            return Err(retry_rejection(&current));
        }

        let job = self.owned_job(owner_id, document_id)?;
        info!(
            job_id = %job.id,
            doc_id = %job.document_id,
            retry_count = job.retry_count,
            priority = job.priority,
            "Job retry requested"
        );
        self.broadcast_job_progress(&job.id, &job.document_id, job.status, None, job.progress);

        Ok(job)
    }

    /// Cancel a pending or processing job.
    ///
    /// A running pipeline notices at its next stage boundary and stops
    /// without further writes.
    pub fn cancel(&self, owner_id: &str, document_id: &str) -> ServiceResult<Job> {
        let job = self.owned_job(owner_id, document_id)?;

        if !job.status.is_cancellable() || !self.db.cancel_job(&job.id)? {
            let current = self.db.get_job(&job.id)?.unwrap_or(job);
            return Err(ServiceError::InvalidTransition {
                document_id: current.document_id,
                status: current.status,
                action: "cancel",
            });
        }

        let job = self.owned_job(owner_id, document_id)?;
        info!(job_id = %job.id, doc_id = %job.document_id, "Job cancelled");
        self.broadcast_job_progress(&job.id, &job.document_id, job.status, None, job.progress);

        Ok(job)
    }
}

fn retry_rejection(job: &Job) -> ServiceError {
    if job.status == JobStatus::Failed && job.retry_count >= MAX_RETRIES {
        ServiceError::RetryLimitReached {
            document_id: job.document_id.clone(),
            retry_count: job.retry_count,
            max_retries: MAX_RETRIES,
        }
    } else {
        ServiceError::InvalidTransition {
            document_id: job.document_id.clone(),
            status: job.status,
            action: "retry",
        }
    }
}
