//! Ordered stage execution for a claimed job.
//!
//! Stages run strictly in order and each is all-or-nothing. When a stage
//! finishes the executor writes one claim-guarded row carrying that stage and
//! its checkpoint, so a poller sees `{chunking, 50}` while embeddings are
//! generated. The claim starts the row at `{extracting_text, 0}`. When a
//! checkpoint write touches no rows the job has been cancelled or reclaimed,
//! and the attempt stops without writing anything else.

use std::future::Future;
use std::time::Instant;

use tracing::{debug, info};

use crate::db::{JobClaim, JobStage, JobStatus, NewChunk};
use crate::error::{EmbeddingError, ProcessingError, ServiceError, ServiceResult};
use crate::service::DocflowService;

/// How an attempt ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PipelineOutcome {
    Completed { result_count: usize },
    /// The claim was lost mid-attempt; the job now belongs to someone else
    Released,
}

/// A stage error, tagged with where it happened
#[derive(Debug)]
pub(crate) struct StageFailure {
    pub stage: JobStage,
    pub error: ServiceError,
}

impl DocflowService {
    /// Drive a claimed job through every stage
    pub(crate) async fn run_pipeline(
        &self,
        claim: &JobClaim,
    ) -> Result<PipelineOutcome, StageFailure> {
        let doc_id = &claim.document_id;

        // Stage 1: extracting_text
        if !self.still_claimed(claim, JobStage::ExtractingText)? {
            return Ok(PipelineOutcome::Released);
        }
        let (document, text) = run_stage(JobStage::ExtractingText, async {
            let document = self.db.get_document(doc_id)?.ok_or_else(|| {
                ServiceError::DocumentNotFound {
                    document_id: doc_id.clone(),
                }
            })?;
            let text = self.backend.extract_text(&document).await?;
            Ok((document, text))
        })
        .await?;
        debug!(doc_id = %doc_id, chars = text.len(), "Text extracted");

        if !self.finish_stage(claim, JobStage::ExtractingText)? {
            return Ok(PipelineOutcome::Released);
        }

        // Stage 2: chunking
        let pieces = run_stage(JobStage::Chunking, async {
            let pieces = self.backend.chunk_text(&document, &text).await?;
            if pieces.is_empty() {
                return Err(ServiceError::Processing(ProcessingError::EmptyDocument {
                    document_id: doc_id.clone(),
                }));
            }
            Ok(pieces)
        })
        .await?;
        debug!(doc_id = %doc_id, chunks = pieces.len(), "Text chunked");

        if !self.finish_stage(claim, JobStage::Chunking)? {
            return Ok(PipelineOutcome::Released);
        }

        // Stage 3: generating_embeddings
        let embeddings = run_stage(JobStage::GeneratingEmbeddings, async {
            let embeddings = self.backend.embed(&pieces).await?;
            if embeddings.len() != pieces.len() {
                return Err(ServiceError::Embedding(EmbeddingError::CountMismatch {
                    expected: pieces.len(),
                    actual: embeddings.len(),
                }));
            }
            Ok(embeddings)
        })
        .await?;

        if !self.finish_stage(claim, JobStage::GeneratingEmbeddings)? {
            return Ok(PipelineOutcome::Released);
        }

        // Stage 4: storing_chunks
        let chunks: Vec<NewChunk> = pieces
            .into_iter()
            .zip(embeddings)
            .enumerate()
            .map(|(chunk_index, (content, embedding))| NewChunk {
                chunk_index,
                content,
                embedding,
            })
            .collect();

        let stored = run_stage(JobStage::StoringChunks, async {
            self.db.replace_chunks(claim, &chunks)
        })
        .await?;
        let Some(result_count) = stored else {
            return Ok(PipelineOutcome::Released);
        };

        // Final transition carries the storing_chunks checkpoint
        let completed = self
            .db
            .complete_job(claim, result_count)
            .map_err(|error| StageFailure {
                stage: JobStage::StoringChunks,
                error,
            })?;
        if !completed {
            return Ok(PipelineOutcome::Released);
        }

        self.broadcast_job_progress(
            &claim.job_id,
            doc_id,
            JobStatus::Completed,
            None,
            JobStage::StoringChunks.checkpoint(),
        );
        info!(doc_id = %doc_id, job_id = %claim.job_id, chunks = result_count, "Job completed");

        Ok(PipelineOutcome::Completed { result_count })
    }

    fn still_claimed(&self, claim: &JobClaim, stage: JobStage) -> Result<bool, StageFailure> {
        self.db
            .holds_claim(claim)
            .map_err(|error| StageFailure { stage, error })
    }

    /// Write the checkpoint of a finished stage.
    ///
    /// Returns `false` once the claim is gone.
    fn finish_stage(&self, claim: &JobClaim, stage: JobStage) -> Result<bool, StageFailure> {
        let progress = stage.checkpoint();
        let recorded = self
            .db
            .advance_stage(claim, stage, progress)
            .map_err(|error| StageFailure { stage, error })?;

        if recorded {
            self.broadcast_job_progress(
                &claim.job_id,
                &claim.document_id,
                JobStatus::Processing,
                Some(stage),
                progress,
            );
        } else {
            info!(
                doc_id = %claim.document_id,
                job_id = %claim.job_id,
                stage = %stage,
                "Job no longer claimed, stopping pipeline"
            );
        }

        Ok(recorded)
    }
}

/// Run one stage body, timing it and tagging any error with the stage
async fn run_stage<T, F>(stage: JobStage, body: F) -> Result<T, StageFailure>
where
    F: Future<Output = ServiceResult<T>>,
{
    let started = Instant::now();
    let result = body.await;
    metrics::histogram!("docflow_stage_duration_seconds", "stage" => stage.as_str())
        .record(started.elapsed().as_secs_f64());
    result.map_err(|error| StageFailure { stage, error })
}
