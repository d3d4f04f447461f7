//! Recovery of jobs orphaned in `processing`.
//!
//! A sweep resolves each stuck job with a write guarded on the
//! `processing_started_at` value its scan observed. Concurrent sweeps may
//! both see the same job, but only one resolution can land.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::db::{JobClaim, JobErrorDetails, JobErrorKind, JobFailure, JobStatus, MAX_RETRIES};
use crate::error::{ServiceResult, format_error_chain_ref};
use crate::service::DocflowService;

/// Result of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Stuck jobs this sweep resolved
    pub cleaned: usize,
    pub errors: Vec<SweepError>,
}

/// A stuck job the sweep could not resolve
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepError {
    pub job_id: String,
    pub message: String,
}

impl DocflowService {
    /// Sweep for jobs stuck in processing longer than the configured timeout
    pub fn sweep_stuck_jobs(&self) -> ServiceResult<SweepReport> {
        self.sweep_at(Utc::now())
    }

    /// Sweep as if the current time were `now`
    pub fn sweep_at(&self, now: DateTime<Utc>) -> ServiceResult<SweepReport> {
        let timeout = self.runtime_config.dynamic().queue.stuck_timeout();
        let timeout = Duration::from_std(timeout).unwrap_or(Duration::MAX);
        let cutoff = now.checked_sub_signed(timeout).unwrap_or(DateTime::<Utc>::MIN_UTC);

        let stuck = self.db.find_stuck_jobs(cutoff)?;
        let mut report = SweepReport::default();

        for claim in stuck {
            match self.resolve_stuck_job(&claim, timeout.num_seconds().max(0) as u64) {
                Ok(true) => report.cleaned += 1,
                Ok(false) => {
                    // Finished, cancelled or reaped by someone else since the scan
                }
                Err(e) => {
                    let message = format_error_chain_ref(&e);
                    error!(job_id = %claim.job_id, error = %message, "Failed to reclaim stuck job");
                    metrics::counter!("docflow_jobs_reaped_total", "outcome" => "error")
                        .increment(1);
                    report.errors.push(SweepError {
                        job_id: claim.job_id.clone(),
                        message,
                    });
                }
            }
        }

        if report.cleaned > 0 || !report.errors.is_empty() {
            info!(
                cleaned = report.cleaned,
                errors = report.errors.len(),
                "Stuck job sweep finished"
            );
        }

        Ok(report)
    }

    fn resolve_stuck_job(
        &self,
        claim: &JobClaim,
        timeout_secs: u64,
    ) -> ServiceResult<bool> {
        let message = format!(
            "Job exceeded the {}s processing timeout (started {})",
            timeout_secs, claim.started_at
        );
        let retryable = claim.retry_count < MAX_RETRIES;
        let failure = JobFailure {
            message,
            details: JobErrorDetails {
                kind: JobErrorKind::Orphaned,
                stage: self
                    .db
                    .get_job(&claim.job_id)?
                    .and_then(|job| job.active_stage()),
                attempt: claim.retry_count,
                retryable,
                causes: vec![],
                timeout_secs: Some(timeout_secs),
            },
        };

        let (resolved, status, outcome) = if retryable {
            let next = claim.retry_count + 1;
            (
                self.db.requeue_job(claim, next, &failure)?,
                JobStatus::Pending,
                "requeued",
            )
        } else {
            (
                self.db.fail_job(claim, claim.retry_count, &failure)?,
                JobStatus::Failed,
                "failed",
            )
        };

        if resolved {
            warn!(
                job_id = %claim.job_id,
                doc_id = %claim.document_id,
                retry_count = claim.retry_count,
                outcome,
                "Reclaimed stuck job"
            );
            metrics::counter!("docflow_jobs_reaped_total", "outcome" => outcome).increment(1);
            let progress = match status {
                JobStatus::Pending => 0,
                _ => self
                    .db
                    .get_job(&claim.job_id)?
                    .map_or(0, |job| job.progress),
            };
            self.broadcast_job_progress(
                &claim.job_id,
                &claim.document_id,
                status,
                None,
                progress,
            );
        }

        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::JobStage;
    use crate::service::testing::{Harness, OWNER, add_document};

    fn stuck_job(service: &DocflowService, doc: &str, minutes_ago: i64) -> JobClaim {
        add_document(service, OWNER, doc, "some text");
        let job = service.enqueue(OWNER, doc, 0).unwrap();
        service
            .db
            .claim_job(&job.id, Utc::now() - Duration::minutes(minutes_ago))
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_stuck_job_is_requeued_once() {
        let h = Harness::new();
        stuck_job(&h.service, "old", 20);
        stuck_job(&h.service, "fresh", 5);

        let report = h.service.sweep_stuck_jobs().unwrap();
        assert_eq!(report, SweepReport { cleaned: 1, errors: vec![] });

        let status = h.service.job_status(OWNER, "old").unwrap();
        assert_eq!(status.status, JobStatus::Pending);
        assert_eq!(status.retry_count, 1);
        assert_eq!(status.progress, 0);
        assert!(status.stage.is_none());
        assert_eq!(status.error_kind, Some(JobErrorKind::Orphaned));
        let details = status.error_details.unwrap();
        assert_eq!(details.timeout_secs, Some(900));
        assert_eq!(details.stage, Some(JobStage::ExtractingText));
        assert!(details.retryable);

        let fresh = h.service.job_status(OWNER, "fresh").unwrap();
        assert_eq!(fresh.status, JobStatus::Processing);

        // Already resolved
        assert_eq!(h.service.sweep_stuck_jobs().unwrap().cleaned, 0);
    }

    #[test]
    fn test_stuck_job_at_ceiling_fails() {
        let h = Harness::new();
        add_document(&h.service, OWNER, "doc", "some text");
        let job = h.service.enqueue(OWNER, "doc", 0).unwrap();

        // Walk the job up to the ceiling, then orphan its final attempt
        let claim = h.service.db.claim_job(&job.id, Utc::now()).unwrap().unwrap();
        let failure = JobFailure {
            message: "boom".to_string(),
            details: JobErrorDetails {
                kind: JobErrorKind::Transient,
                stage: None,
                attempt: 0,
                retryable: true,
                causes: vec![],
                timeout_secs: None,
            },
        };
        assert!(h.service.db.fail_job(&claim, 2, &failure).unwrap());
        h.service.retry(OWNER, "doc").unwrap();
        h.service
            .db
            .claim_job(&job.id, Utc::now() - Duration::hours(1))
            .unwrap()
            .unwrap();

        let report = h.service.sweep_stuck_jobs().unwrap();
        assert_eq!(report.cleaned, 1);

        let status = h.service.job_status(OWNER, "doc").unwrap();
        assert_eq!(status.status, JobStatus::Failed);
        assert_eq!(status.retry_count, 3);
        assert_eq!(status.error_kind, Some(JobErrorKind::Orphaned));
        assert!(status.error_message.unwrap().contains("processing timeout"));
        assert!(!status.error_details.unwrap().retryable);
    }

    #[test]
    fn test_sweep_respects_configured_timeout() {
        let h = Harness::new();
        stuck_job(&h.service, "doc", 20);

        let mut dynamic = (**h.service.runtime_config.dynamic()).clone();
        dynamic.queue.stuck_timeout_secs = 30 * 60;
        h.service.runtime_config.update_dynamic(dynamic);

        assert_eq!(h.service.sweep_stuck_jobs().unwrap().cleaned, 0);
        let later = Utc::now() + Duration::minutes(15);
        assert_eq!(h.service.sweep_at(later).unwrap().cleaned, 1);
    }

    #[test]
    fn test_concurrent_sweeps_resolve_each_job_once() {
        let dir = tempfile::tempdir().unwrap();
        let first = Harness::sharing(dir.path());
        let second = Harness::sharing(dir.path());
        for i in 0..5 {
            stuck_job(&first, &format!("doc-{i}"), 30);
        }

        let now = Utc::now();
        let sweeps: Vec<_> = [first.clone(), second.clone(), first.clone(), second.clone()]
            .into_iter()
            .map(|service| std::thread::spawn(move || service.sweep_at(now).unwrap()))
            .collect();

        let reports: Vec<SweepReport> = sweeps.into_iter().map(|t| t.join().unwrap()).collect();
        let cleaned: usize = reports.iter().map(|r| r.cleaned).sum();
        assert_eq!(cleaned, 5);
        assert!(reports.iter().all(|r| r.errors.is_empty()));

        for i in 0..5 {
            let status = first.job_status(OWNER, &format!("doc-{i}")).unwrap();
            assert_eq!(status.status, JobStatus::Pending);
            assert_eq!(status.retry_count, 1);
        }
    }
}
