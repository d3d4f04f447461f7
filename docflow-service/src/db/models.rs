//! Database model structs.
//!
//! This module contains the data structures for database records and the
//! job state machine vocabulary shared by the dispatcher, pipeline and reaper.

use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Row;
use rusqlite::types::Type;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

/// Ceiling on `retry_count`, shared by automatic and explicit retries
pub const MAX_RETRIES: u32 = 3;

/// Lifecycle status of a job
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed by a dispatcher
    Pending,
    /// Claimed; the pipeline is running
    Processing,
    /// All stages succeeded
    Completed,
    /// Gave up; may be revived by an explicit retry while under the ceiling
    Failed,
    /// Cancelled by the owner
    Cancelled,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        self.into()
    }

    /// Pending and processing jobs may still be cancelled.
    pub fn is_cancellable(self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Processing)
    }
}

/// Ordered pipeline stage. Only meaningful while a job is processing.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    ExtractingText,
    Chunking,
    GeneratingEmbeddings,
    StoringChunks,
    Completed,
}

impl JobStage {
    pub const FIRST: JobStage = JobStage::ExtractingText;

    pub fn as_str(self) -> &'static str {
        self.into()
    }

    /// Progress written once this stage has finished.
    pub fn checkpoint(self) -> u8 {
        match self {
            JobStage::ExtractingText => 25,
            JobStage::Chunking => 50,
            JobStage::GeneratingEmbeddings => 75,
            JobStage::StoringChunks | JobStage::Completed => 100,
        }
    }

    pub fn next(self) -> JobStage {
        match self {
            JobStage::ExtractingText => JobStage::Chunking,
            JobStage::Chunking => JobStage::GeneratingEmbeddings,
            JobStage::GeneratingEmbeddings => JobStage::StoringChunks,
            JobStage::StoringChunks | JobStage::Completed => JobStage::Completed,
        }
    }
}

/// Closed classification of job failures
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobErrorKind {
    /// Timeouts, unavailable services, store contention
    Transient,
    /// Malformed or unsupported input; the owner must act
    NonRetryable,
    /// The attempt never reached a terminal state and was recovered by the reaper
    Orphaned,
    /// Automatic retries are used up
    RetryExhausted,
}

impl JobErrorKind {
    pub fn as_str(self) -> &'static str {
        self.into()
    }

    pub fn is_retryable(self) -> bool {
        matches!(self, JobErrorKind::Transient | JobErrorKind::Orphaned)
    }
}

/// Structured failure payload stored alongside `error_message`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobErrorDetails {
    pub kind: JobErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<JobStage>,
    /// Zero-based attempt number that failed
    pub attempt: u32,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub causes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// A failure about to be recorded on a job row
#[derive(Debug, Clone)]
pub struct JobFailure {
    pub message: String,
    pub details: JobErrorDetails,
}

impl JobFailure {
    pub fn kind(&self) -> JobErrorKind {
        self.details.kind
    }
}

/// Job record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub document_id: String,
    pub owner_id: String,
    pub status: JobStatus,
    pub stage: Option<JobStage>,
    pub progress: u8,
    pub priority: i64,
    pub retry_count: u32,
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

impl Job {
    /// The stage a processing job is working on.
    ///
    /// `stage` names the latest stage the attempt reached; once that stage's
    /// checkpoint is written the attempt has moved on to the next one.
    pub fn active_stage(&self) -> Option<JobStage> {
        self.stage.map(|stage| {
            if self.progress >= stage.checkpoint() {
                stage.next()
            } else {
                stage
            }
        })
    }
}

/// Column list matching `Job::from_row`
pub(crate) const JOB_COLUMNS: &str = "id, document_id, owner_id, status, stage, progress, priority, \
     retry_count, error_kind, error_message, error_details, result_count, created_at, \
     processing_started_at, processing_completed_at, updated_at, last_retry_at";

impl Job {
    pub(crate) fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        let status: String = row.get(3)?;
        let stage: Option<String> = row.get(4)?;
        let progress: i64 = row.get(5)?;
        let retry_count: i64 = row.get(7)?;
        let error_kind: Option<String> = row.get(8)?;
        let error_details: Option<String> = row.get(10)?;
        let result_count: i64 = row.get(11)?;

        Ok(Self {
            id: row.get(0)?,
            document_id: row.get(1)?,
            owner_id: row.get(2)?,
            status: parse_enum(3, &status)?,
            stage: stage.map(|s| parse_enum(4, &s)).transpose()?,
            progress: progress.clamp(0, 100) as u8,
            priority: row.get(6)?,
            retry_count: retry_count.max(0) as u32,
            error_kind: error_kind.map(|k| parse_enum(8, &k)).transpose()?,
            error_message: row.get(9)?,
            error_details: error_details
                .map(|d| {
                    serde_json::from_str(&d).map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(10, Type::Text, Box::new(e))
                    })
                })
                .transpose()?,
            result_count: result_count.max(0) as usize,
            created_at: parse_timestamp(12, &row.get::<_, String>(12)?)?,
            processing_started_at: parse_optional_timestamp(13, row.get(13)?)?,
            processing_completed_at: parse_optional_timestamp(14, row.get(14)?)?,
            updated_at: parse_timestamp(15, &row.get::<_, String>(15)?)?,
            last_retry_at: parse_optional_timestamp(16, row.get(16)?)?,
        })
    }
}

/// Proof that the holder owns the processing claim on a job.
///
/// Every write made on behalf of a claim is guarded on
/// `status = 'processing' AND processing_started_at = started_at`, so a
/// claim silently loses all write access once the job is cancelled or
/// reclaimed by the reaper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobClaim {
    pub job_id: String,
    pub document_id: String,
    pub owner_id: String,
    /// Stored representation of `processing_started_at`
    pub started_at: String,
    pub retry_count: u32,
    pub priority: i64,
}

/// Uploaded document record (ownership relation for jobs)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub owner_id: String,
    pub title: String,
    pub file_path: Option<String>,
    pub file_hash: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Document {
    pub(crate) fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            title: row.get(2)?,
            file_path: row.get(3)?,
            file_hash: row.get(4)?,
            created_at: parse_timestamp(5, &row.get::<_, String>(5)?)?,
        })
    }
}

/// Chunk produced by an attempt, ready to be stored
#[derive(Debug, Clone, PartialEq)]
pub struct NewChunk {
    pub chunk_index: usize,
    pub content: String,
    pub embedding: Vec<f32>,
}

/// Stored chunk record
#[cfg(test)]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: usize,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
impl Chunk {
    pub(crate) fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        let chunk_index: i64 = row.get(2)?;
        Ok(Self {
            id: row.get(0)?,
            document_id: row.get(1)?,
            chunk_index: chunk_index.max(0) as usize,
            content: row.get(3)?,
            created_at: parse_timestamp(4, &row.get::<_, String>(4)?)?,
        })
    }
}

/// Format a timestamp for storage.
///
/// Fixed microsecond precision with a `Z` suffix keeps lexicographic order
/// equal to chronological order, which the stuck-job scan relies on.
pub fn db_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_enum<T>(idx: usize, value: &str) -> Result<T, rusqlite::Error>
where
    T: FromStr<Err = strum::ParseError>,
{
    T::from_str(value)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_timestamp(idx: usize, value: &str) -> Result<DateTime<Utc>, rusqlite::Error> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_optional_timestamp(
    idx: usize,
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>, rusqlite::Error> {
    value.map(|v| parse_timestamp(idx, &v)).transpose()
}
