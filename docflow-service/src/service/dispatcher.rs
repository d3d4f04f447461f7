//! Claiming and executing one pending job per invocation.

use std::any::Any;
use std::panic::AssertUnwindSafe;

use chrono::Utc;
use futures::FutureExt;
use tracing::{debug, error, info, warn};

use super::pipeline::{PipelineOutcome, StageFailure};
use crate::db::{
    JobClaim, JobErrorDetails, JobErrorKind, JobFailure, JobStage, JobStatus, MAX_RETRIES,
};
use crate::error::{
    ProcessingError, ServiceError, ServiceResult, error_chain, format_error_chain_ref,
};
use crate::service::DocflowService;

impl DocflowService {
    /// Claim the highest-priority pending job and run it to a terminal or
    /// re-queued state.
    ///
    /// Returns `false` when there was nothing to claim or another dispatcher
    /// won the claim. Once a claim succeeds the call returns `true` no matter
    /// how the attempt ended; pipeline errors and panics become job state,
    /// not errors of this call.
    pub async fn process_next_job(&self) -> ServiceResult<bool> {
        let Some(job) = self.db.next_pending_job()? else {
            return Ok(false);
        };

        let Some(claim) = self.db.claim_job(&job.id, Utc::now())? else {
            debug!(job_id = %job.id, "Job claimed by another dispatcher");
            return Ok(false);
        };

        metrics::counter!("docflow_jobs_claimed_total").increment(1);
        info!(
            job_id = %claim.job_id,
            doc_id = %claim.document_id,
            priority = claim.priority,
            attempt = claim.retry_count,
            "Processing job"
        );
        self.broadcast_job_progress(
            &claim.job_id,
            &claim.document_id,
            JobStatus::Processing,
            Some(JobStage::FIRST),
            0,
        );

        match AssertUnwindSafe(self.run_pipeline(&claim))
            .catch_unwind()
            .await
        {
            Ok(Ok(PipelineOutcome::Completed { .. })) => {
                metrics::counter!("docflow_jobs_finished_total", "outcome" => "completed")
                    .increment(1);
            }
            Ok(Ok(PipelineOutcome::Released)) => {
                metrics::counter!("docflow_jobs_finished_total", "outcome" => "released")
                    .increment(1);
            }
            Ok(Err(StageFailure { stage, error })) => {
                self.record_attempt_failure(&claim, stage, error);
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(job_id = %claim.job_id, panic = %message, "Pipeline panicked");
                // The stage the row says was running is the one that panicked
                let stage = self
                    .db
                    .get_job(&claim.job_id)
                    .ok()
                    .flatten()
                    .and_then(|job| job.active_stage())
                    .unwrap_or(JobStage::FIRST);
                self.record_attempt_failure(
                    &claim,
                    stage,
                    ServiceError::Processing(ProcessingError::Panicked { message }),
                );
            }
        }

        Ok(true)
    }

    /// Turn a failed attempt into a re-queue or a terminal failure.
    ///
    /// Retryable errors move the job back to pending while the incremented
    /// `retry_count` stays below the ceiling. Once it would reach the ceiling
    /// automatic retries stop: the job fails as `retry_exhausted` with
    /// `retry_count` unchanged, which leaves exactly one explicit retry.
    /// Non-retryable errors fail the job immediately.
    fn record_attempt_failure(&self, claim: &JobClaim, stage: JobStage, error: ServiceError) {
        let kind = error.classify();
        let causes = error_chain(&error);
        let message = format_error_chain_ref(&error);

        let details = |kind: JobErrorKind| JobErrorDetails {
            kind,
            stage: Some(stage),
            attempt: claim.retry_count,
            retryable: kind.is_retryable(),
            causes: causes.clone(),
            timeout_secs: None,
        };

        let next = claim.retry_count + 1;
        let (outcome, written) = if kind.is_retryable() && next < MAX_RETRIES {
            warn!(
                job_id = %claim.job_id,
                doc_id = %claim.document_id,
                stage = %stage,
                retry_count = next,
                error = %message,
                "Job attempt failed, re-queued"
            );
            let failure = JobFailure {
                message,
                details: details(kind),
            };
            ("requeued", self.db.requeue_job(claim, next, &failure))
        } else if kind.is_retryable() {
            error!(
                job_id = %claim.job_id,
                doc_id = %claim.document_id,
                stage = %stage,
                retry_count = claim.retry_count,
                error = %message,
                "Job failed, automatic retries exhausted"
            );
            let failure = JobFailure {
                message: format!(
                    "Automatic retries exhausted after {} attempts: {}",
                    next, message
                ),
                details: details(JobErrorKind::RetryExhausted),
            };
            ("retry_exhausted", self.db.fail_job(claim, claim.retry_count, &failure))
        } else {
            error!(
                job_id = %claim.job_id,
                doc_id = %claim.document_id,
                stage = %stage,
                error = %message,
                "Job failed with non-retryable error"
            );
            let failure = JobFailure {
                message,
                details: details(JobErrorKind::NonRetryable),
            };
            ("failed", self.db.fail_job(claim, claim.retry_count, &failure))
        };

        match written {
            Ok(true) => {
                metrics::counter!("docflow_jobs_finished_total", "outcome" => outcome)
                    .increment(1);
                let status = if outcome == "requeued" {
                    JobStatus::Pending
                } else {
                    JobStatus::Failed
                };
                let progress = if status == JobStatus::Pending {
                    0
                } else {
                    self.db
                        .get_job(&claim.job_id)
                        .ok()
                        .flatten()
                        .map_or(0, |job| job.progress)
                };
                self.broadcast_job_progress(
                    &claim.job_id,
                    &claim.document_id,
                    status,
                    None,
                    progress,
                );
            }
            Ok(false) => {
                info!(
                    job_id = %claim.job_id,
                    "Job no longer claimed, failure not recorded"
                );
            }
            Err(e) => {
                // The reaper will recover the job once it is stuck long enough
                error!(
                    job_id = %claim.job_id,
                    error = %format_error_chain_ref(&e),
                    "Failed to record job failure"
                );
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
