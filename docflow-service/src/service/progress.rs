//! Progress event broadcast helpers.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::db::{JobStage, JobStatus};
use crate::service::DocflowService;

/// A job state change as observed by the process that made it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobProgressEvent {
    pub job_id: String,
    pub document_id: String,
    pub status: JobStatus,
    pub stage: Option<JobStage>,
    pub progress: u8,
}

impl DocflowService {
    /// Subscribe to job progress events published by this process
    pub fn subscribe_progress(&self) -> broadcast::Receiver<JobProgressEvent> {
        self.progress_tx.subscribe()
    }

    /// Broadcast a job state change
    pub(crate) fn broadcast_job_progress(
        &self,
        job_id: &str,
        document_id: &str,
        status: JobStatus,
        stage: Option<JobStage>,
        progress: u8,
    ) {
        // No subscribers is fine
        let _ = self.progress_tx.send(JobProgressEvent {
            job_id: job_id.to_string(),
            document_id: document_id.to_string(),
            status,
            stage,
            progress,
        });
    }
}
