//! Job queue service.
//!
//! `DocflowService` holds no queue of its own. Every operation here is a
//! short-lived invocation against the job table, so any number of them may
//! run at once, in this process or another sharing the same database.

mod control;
mod dispatcher;
mod pipeline;
mod progress;
mod reaper;
mod settings;
mod status;
#[cfg(test)]
pub(crate) mod testing;
mod triggers;
mod upload;

pub use progress::JobProgressEvent;
pub use reaper::{SweepError, SweepReport};
pub use status::JobStatusView;

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::auth::IdentityVerifier;
use crate::backend::ProcessingBackend;
use crate::config::RuntimeConfig;
use crate::db::{Database, Job};
use crate::error::{ServiceError, ServiceResult};

/// Capacity of the progress event channel; slow subscribers skip ahead
const PROGRESS_CHANNEL_CAPACITY: usize = 256;

/// Main service coordinator
pub struct DocflowService {
    pub runtime_config: Arc<RuntimeConfig>,
    pub db: Arc<Database>,
    pub backend: Arc<dyn ProcessingBackend>,
    pub verifier: Arc<dyn IdentityVerifier>,
    progress_tx: broadcast::Sender<JobProgressEvent>,
}

impl DocflowService {
    /// Create a new service instance
    /// Accepts a pre-opened database so that RuntimeConfig can load settings from it
    pub async fn new(
        db: Arc<Database>,
        runtime_config: Arc<RuntimeConfig>,
        backend: Arc<dyn ProcessingBackend>,
        verifier: Arc<dyn IdentityVerifier>,
    ) -> ServiceResult<Self> {
        info!("Initializing docflow job queue service");

        let base_url = runtime_config.dynamic().ollama.base_url.clone();
        if backend.health_check().await {
            info!(url = %base_url, "Processing backend is available");
        } else {
            warn!(url = %base_url, "Processing backend is not available, jobs will retry");
        }

        Ok(Self::with_parts(db, runtime_config, backend, verifier))
    }

    pub(crate) fn with_parts(
        db: Arc<Database>,
        runtime_config: Arc<RuntimeConfig>,
        backend: Arc<dyn ProcessingBackend>,
        verifier: Arc<dyn IdentityVerifier>,
    ) -> Self {
        let (progress_tx, _) = broadcast::channel(PROGRESS_CHANNEL_CAPACITY);
        Self {
            runtime_config,
            db,
            backend,
            verifier,
            progress_tx,
        }
    }

    /// Resolve a bearer credential to an owner id
    pub async fn authenticate(&self, credential: &str) -> ServiceResult<String> {
        self.verifier.verify(credential).await
    }

    /// Load an owner's job for a document.
    ///
    /// Another owner's document reads exactly like a missing one.
    pub(crate) fn owned_job(&self, owner_id: &str, document_id: &str) -> ServiceResult<Job> {
        let document = self
            .db
            .get_document(document_id)?
            .filter(|doc| doc.owner_id == owner_id)
            .ok_or_else(|| ServiceError::DocumentNotFound {
                document_id: document_id.to_string(),
            })?;

        self.db
            .get_job_by_document(&document.id)?
            .ok_or_else(|| ServiceError::JobNotFound {
                document_id: document_id.to_string(),
            })
    }
}
