//! Job store operations.
//!
//! Each state transition is one conditional `UPDATE` whose `WHERE` clause
//! names the state being replaced. A write that touches zero rows means some
//! other dispatcher, reaper or user request got there first; callers treat
//! that as "not mine" rather than as an error.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};

use super::Database;
use super::models::{
    JOB_COLUMNS, Job, JobClaim, JobFailure, JobStage, JobStatus, db_timestamp,
};
use crate::error::{DatabaseError, ServiceError, ServiceResult};

/// Guard shared by every write made on behalf of a claim
const CLAIM_GUARD: &str = "id = ?1 AND status = 'processing' AND processing_started_at = ?2";

impl Database {
    /// Create the job for a document, or reset an existing one for a new run.
    ///
    /// - no job: inserted as pending
    /// - pending: priority updated
    /// - processing: rejected
    /// - completed, failed or cancelled: restarted as a fresh lineage
    pub fn upsert_job_for_enqueue(
        &self,
        document_id: &str,
        owner_id: &str,
        priority: i64,
    ) -> ServiceResult<Job> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(DatabaseError::Query)?;
        let now = db_timestamp(&Utc::now());

        match job_by_document(&tx, document_id)? {
            None => {
                tx.execute(
                    r#"
                    INSERT INTO jobs (id, document_id, owner_id, status, progress, priority, retry_count, result_count, created_at, updated_at)
                    VALUES (?1, ?2, ?3, 'pending', 0, ?4, 0, 0, ?5, ?5)
                    "#,
                    params![
                        uuid::Uuid::new_v4().to_string(),
                        document_id,
                        owner_id,
                        priority,
                        now
                    ],
                )
                .map_err(DatabaseError::Query)?;
            }
            Some(job) if job.status == JobStatus::Pending => {
                tx.execute(
                    "UPDATE jobs SET priority = ?1, updated_at = ?2 WHERE id = ?3 AND status = 'pending'",
                    params![priority, now, job.id],
                )
                .map_err(DatabaseError::Query)?;
            }
            Some(job) if job.status == JobStatus::Processing => {
                return Err(ServiceError::InvalidTransition {
                    document_id: document_id.to_string(),
                    status: job.status,
                    action: "enqueue",
                });
            }
            Some(job) => {
                tx.execute(
                    r#"
                    UPDATE jobs SET status = 'pending', stage = NULL, progress = 0, priority = ?1,
                        retry_count = 0, error_kind = NULL, error_message = NULL, error_details = NULL,
                        result_count = 0, created_at = ?2, processing_started_at = NULL,
                        processing_completed_at = NULL, last_retry_at = NULL, updated_at = ?2
                    WHERE id = ?3 AND status = ?4
                    "#,
                    params![priority, now, job.id, job.status.as_str()],
                )
                .map_err(DatabaseError::Query)?;
            }
        }

        let job = job_by_document(&tx, document_id)?.ok_or_else(|| ServiceError::Internal {
            message: format!("Job for document {} vanished during enqueue", document_id),
        })?;
        tx.commit().map_err(DatabaseError::Query)?;

        Ok(job)
    }

    /// Get a job by its ID
    pub fn get_job(&self, job_id: &str) -> ServiceResult<Option<Job>> {
        let conn = self.conn()?;

        conn.query_row(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
            params![job_id],
            Job::from_row,
        )
        .optional()
        .map_err(DatabaseError::Query)
        .map_err(Into::into)
    }

    /// Get the job for a document
    pub fn get_job_by_document(&self, document_id: &str) -> ServiceResult<Option<Job>> {
        let conn = self.conn()?;
        job_by_document(&conn, document_id)
    }

    /// Highest-priority pending job, oldest first among equals
    pub fn next_pending_job(&self) -> ServiceResult<Option<Job>> {
        let conn = self.conn()?;

        conn.query_row(
            &format!(
                "SELECT {JOB_COLUMNS} FROM jobs WHERE status = 'pending' \
                 ORDER BY priority DESC, created_at ASC, id ASC LIMIT 1"
            ),
            [],
            Job::from_row,
        )
        .optional()
        .map_err(DatabaseError::Query)
        .map_err(Into::into)
    }

    /// Atomically move a pending job to processing.
    ///
    /// Returns `None` when the job is no longer pending, i.e. another caller
    /// claimed or cancelled it first. A successful claim starts a fresh
    /// attempt: first stage, zero progress, previous error cleared.
    pub fn claim_job(
        &self,
        job_id: &str,
        started_at: DateTime<Utc>,
    ) -> ServiceResult<Option<JobClaim>> {
        let conn = self.conn()?;
        let started_at = db_timestamp(&started_at);

        conn.query_row(
            r#"
            UPDATE jobs SET status = 'processing', stage = ?1, progress = 0,
                processing_started_at = ?2, processing_completed_at = NULL,
                error_kind = NULL, error_message = NULL, error_details = NULL, updated_at = ?2
            WHERE id = ?3 AND status = 'pending'
            RETURNING document_id, owner_id, retry_count, priority
            "#,
            params![JobStage::FIRST.as_str(), started_at, job_id],
            |row| {
                let retry_count: i64 = row.get(2)?;
                Ok(JobClaim {
                    job_id: job_id.to_string(),
                    document_id: row.get(0)?,
                    owner_id: row.get(1)?,
                    started_at: started_at.clone(),
                    retry_count: retry_count.max(0) as u32,
                    priority: row.get(3)?,
                })
            },
        )
        .optional()
        .map_err(DatabaseError::Query)
        .map_err(Into::into)
    }

    /// Record the current stage and progress for a claimed job.
    ///
    /// Progress never moves backwards within an attempt. Returns `false`
    /// when the claim has been lost.
    pub fn advance_stage(
        &self,
        claim: &JobClaim,
        stage: JobStage,
        progress: u8,
    ) -> ServiceResult<bool> {
        let conn = self.conn()?;

        let rows = conn
            .execute(
                &format!(
                    "UPDATE jobs SET stage = ?3, progress = MAX(progress, ?4), updated_at = ?5 \
                     WHERE {CLAIM_GUARD}"
                ),
                params![
                    claim.job_id,
                    claim.started_at,
                    stage.as_str(),
                    progress.min(100),
                    db_timestamp(&Utc::now())
                ],
            )
            .map_err(DatabaseError::Query)?;

        Ok(rows > 0)
    }

    /// Whether the claim still owns the job
    pub fn holds_claim(&self, claim: &JobClaim) -> ServiceResult<bool> {
        let conn = self.conn()?;
        holds_claim(&conn, claim)
    }

    /// Mark a claimed job completed
    pub fn complete_job(&self, claim: &JobClaim, result_count: usize) -> ServiceResult<bool> {
        let conn = self.conn()?;
        let now = db_timestamp(&Utc::now());

        let rows = conn
            .execute(
                &format!(
                    "UPDATE jobs SET status = 'completed', stage = NULL, progress = 100, \
                     result_count = ?3, processing_completed_at = ?4, updated_at = ?4 \
                     WHERE {CLAIM_GUARD}"
                ),
                params![claim.job_id, claim.started_at, result_count as i64, now],
            )
            .map_err(DatabaseError::Query)?;

        Ok(rows > 0)
    }

    /// Put a claimed job back in the queue for another attempt
    pub fn requeue_job(
        &self,
        claim: &JobClaim,
        retry_count: u32,
        failure: &JobFailure,
    ) -> ServiceResult<bool> {
        let conn = self.conn()?;
        let now = db_timestamp(&Utc::now());
        let details =
            serde_json::to_string(&failure.details).map_err(DatabaseError::Serialization)?;

        let rows = conn
            .execute(
                &format!(
                    "UPDATE jobs SET status = 'pending', stage = NULL, progress = 0, retry_count = ?3, \
                     error_kind = ?4, error_message = ?5, error_details = ?6, \
                     processing_started_at = NULL, last_retry_at = ?7, updated_at = ?7 \
                     WHERE {CLAIM_GUARD}"
                ),
                params![
                    claim.job_id,
                    claim.started_at,
                    retry_count,
                    failure.kind().as_str(),
                    failure.message,
                    details,
                    now
                ],
            )
            .map_err(DatabaseError::Query)?;

        Ok(rows > 0)
    }

    /// Mark a claimed job failed
    pub fn fail_job(
        &self,
        claim: &JobClaim,
        retry_count: u32,
        failure: &JobFailure,
    ) -> ServiceResult<bool> {
        let conn = self.conn()?;
        let now = db_timestamp(&Utc::now());
        let details =
            serde_json::to_string(&failure.details).map_err(DatabaseError::Serialization)?;

        let rows = conn
            .execute(
                &format!(
                    "UPDATE jobs SET status = 'failed', stage = NULL, retry_count = ?3, \
                     error_kind = ?4, error_message = ?5, error_details = ?6, \
                     processing_completed_at = ?7, updated_at = ?7 \
                     WHERE {CLAIM_GUARD}"
                ),
                params![
                    claim.job_id,
                    claim.started_at,
                    retry_count,
                    failure.kind().as_str(),
                    failure.message,
                    details,
                    now
                ],
            )
            .map_err(DatabaseError::Query)?;

        Ok(rows > 0)
    }

    /// Cancel a pending or processing job. Returns `false` if the job was in
    /// any other state.
    pub fn cancel_job(&self, job_id: &str) -> ServiceResult<bool> {
        let conn = self.conn()?;
        let now = db_timestamp(&Utc::now());

        let rows = conn
            .execute(
                "UPDATE jobs SET status = 'cancelled', stage = NULL, processing_completed_at = ?1, updated_at = ?1 \
                 WHERE id = ?2 AND status IN ('pending', 'processing')",
                params![now, job_id],
            )
            .map_err(DatabaseError::Query)?;

        Ok(rows > 0)
    }

    /// Revive a failed job that is still under the retry ceiling.
    ///
    /// Returns `false` if the job is not failed or has no retries left.
    pub fn retry_job(
        &self,
        job_id: &str,
        max_retries: u32,
        priority_boost: i64,
    ) -> ServiceResult<bool> {
        let conn = self.conn()?;
        let now = db_timestamp(&Utc::now());

        let rows = conn
            .execute(
                r#"
                UPDATE jobs SET status = 'pending', stage = NULL, progress = 0,
                    retry_count = retry_count + 1, priority = priority + ?1,
                    error_kind = NULL, error_message = NULL, error_details = NULL,
                    result_count = 0, processing_started_at = NULL, processing_completed_at = NULL,
                    last_retry_at = ?2, updated_at = ?2
                WHERE id = ?3 AND status = 'failed' AND retry_count < ?4
                "#,
                params![priority_boost, now, job_id, max_retries],
            )
            .map_err(DatabaseError::Query)?;

        Ok(rows > 0)
    }

    /// Processing jobs whose current attempt started before `cutoff`.
    ///
    /// The returned claims carry the `processing_started_at` observed by the
    /// scan, so resolving one through `requeue_job` / `fail_job` only succeeds
    /// if nobody else has touched the job since.
    pub fn find_stuck_jobs(&self, cutoff: DateTime<Utc>) -> ServiceResult<Vec<JobClaim>> {
        let conn = self.conn()?;

        let mut stmt = conn
            .prepare(
                "SELECT id, document_id, owner_id, processing_started_at, retry_count, priority \
                 FROM jobs WHERE status = 'processing' AND processing_started_at < ?1 \
                 ORDER BY processing_started_at ASC",
            )
            .map_err(DatabaseError::Query)?;

        let rows = stmt
            .query_map(params![db_timestamp(&cutoff)], |row| {
                let retry_count: i64 = row.get(4)?;
                Ok(JobClaim {
                    job_id: row.get(0)?,
                    document_id: row.get(1)?,
                    owner_id: row.get(2)?,
                    started_at: row.get(3)?,
                    retry_count: retry_count.max(0) as u32,
                    priority: row.get(5)?,
                })
            })
            .map_err(DatabaseError::Query)?;

        let mut claims = Vec::new();
        for row in rows {
            claims.push(row.map_err(DatabaseError::Query)?);
        }

        Ok(claims)
    }
}

fn job_by_document(conn: &Connection, document_id: &str) -> ServiceResult<Option<Job>> {
    conn.query_row(
        &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE document_id = ?1"),
        params![document_id],
        Job::from_row,
    )
    .optional()
    .map_err(DatabaseError::Query)
    .map_err(Into::into)
}

pub(super) fn holds_claim(conn: &Connection, claim: &JobClaim) -> ServiceResult<bool> {
    let count: i64 = conn
        .query_row(
            &format!("SELECT COUNT(*) FROM jobs WHERE {CLAIM_GUARD}"),
            params![claim.job_id, claim.started_at],
            |row| row.get(0),
        )
        .map_err(DatabaseError::Query)?;

    Ok(count > 0)
}
