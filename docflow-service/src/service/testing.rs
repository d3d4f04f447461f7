//! Test doubles and fixtures for service tests.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;
use tokio::sync::Notify;

use crate::auth::StaticTokenVerifier;
use crate::backend::ProcessingBackend;
use crate::config::{DynamicConfig, RuntimeConfig, StaticConfig};
use crate::db::{Database, Document, JobStage};
use crate::error::{OllamaError, ProcessingError, ServiceError, ServiceResult};
use crate::ingestion::{self, hash::sha256_hex};
use crate::service::DocflowService;

pub const OWNER: &str = "owner-1";
pub const OTHER_OWNER: &str = "owner-2";
pub const TOKEN: &str = "owner-1-token";

/// What a scripted stage call does instead of succeeding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Embedding service answered 503
    Transient,
    /// Content the backend cannot handle
    NonRetryable,
    Panic,
}

/// Backend whose behaviour is scripted per stage.
///
/// Text comes from the document title; chunks are two-word windows.
#[derive(Default)]
pub struct ScriptedBackend {
    faults: Mutex<VecDeque<(JobStage, Fault)>>,
    hold: Mutex<Option<StageHold>>,
    pub embed_calls: AtomicUsize,
}

/// Pauses the next embedding call until released
pub struct StageHold {
    pub entered: Arc<Notify>,
    pub release: Arc<Notify>,
}

impl ScriptedBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next call of `stage` with `fault`
    pub fn fail_next(&self, stage: JobStage, fault: Fault) {
        self.faults.lock().unwrap().push_back((stage, fault));
    }

    /// Block the next embedding call; returns (entered, release)
    pub fn hold_embeddings(&self) -> (Arc<Notify>, Arc<Notify>) {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        *self.hold.lock().unwrap() = Some(StageHold {
            entered: entered.clone(),
            release: release.clone(),
        });
        (entered, release)
    }

    fn scripted_fault(&self, stage: JobStage) -> ServiceResult<()> {
        let fault = {
            let mut faults = self.faults.lock().unwrap();
            match faults.front() {
                Some((s, _)) if *s == stage => faults.pop_front().map(|(_, f)| f),
                _ => None,
            }
        };

        match fault {
            None => Ok(()),
            Some(Fault::Transient) => Err(ServiceError::Ollama(OllamaError::Generation {
                status: 503,
                message: "model is loading".to_string(),
            })),
            Some(Fault::NonRetryable) => Err(ServiceError::Processing(
                ProcessingError::UnsupportedFormat {
                    format: "bin".to_string(),
                },
            )),
            Some(Fault::Panic) => panic!("scripted panic in {stage}"),
        }
    }
}

#[async_trait]
impl ProcessingBackend for ScriptedBackend {
    async fn extract_text(&self, doc: &Document) -> ServiceResult<String> {
        self.scripted_fault(JobStage::ExtractingText)?;
        Ok(doc.title.clone())
    }

    async fn chunk_text(&self, _doc: &Document, text: &str) -> ServiceResult<Vec<String>> {
        self.scripted_fault(JobStage::Chunking)?;
        Ok(ingestion::chunk_text(text, 2, 0))
    }

    async fn embed(&self, texts: &[String]) -> ServiceResult<Vec<Vec<f32>>> {
        self.embed_calls.fetch_add(1, Ordering::SeqCst);
        let hold = self.hold.lock().unwrap().take();
        if let Some(hold) = hold {
            hold.entered.notify_one();
            hold.release.notified().await;
        }
        self.scripted_fault(JobStage::GeneratingEmbeddings)?;
        Ok(texts
            .iter()
            .enumerate()
            .map(|(i, text)| vec![i as f32, text.len() as f32])
            .collect())
    }

    async fn health_check(&self) -> bool {
        true
    }
}

/// A service over a scripted backend with its own storage directory
pub struct Harness {
    pub service: Arc<DocflowService>,
    pub backend: Arc<ScriptedBackend>,
    pub dir: TempDir,
}

impl Harness {
    /// Service over a private in-memory database
    pub fn new() -> Self {
        let db = Database::open_in_memory().unwrap();
        Self::with_database(db, tempfile::tempdir().unwrap())
    }

    /// Service over the database file inside `dir`
    pub fn sharing(dir: &Path) -> Arc<DocflowService> {
        let db = Database::open(&dir.join("docflow.db")).unwrap();
        build_service(db, dir, ScriptedBackend::new())
    }

    fn with_database(db: Database, dir: TempDir) -> Self {
        let backend = ScriptedBackend::new();
        let service = build_service(db, dir.path(), backend.clone());
        Self {
            service,
            backend,
            dir,
        }
    }

    /// Insert a document whose text is `text`
    pub fn add_document(&self, id: &str, text: &str) {
        add_document(&self.service, OWNER, id, text);
    }
}

pub fn add_document(service: &DocflowService, owner_id: &str, id: &str, text: &str) {
    service
        .db
        .insert_document(&Document {
            id: id.to_string(),
            owner_id: owner_id.to_string(),
            title: text.to_string(),
            file_path: None,
            file_hash: None,
            created_at: Utc::now(),
        })
        .unwrap();
}

fn build_service(
    db: Database,
    data_dir: &Path,
    backend: Arc<ScriptedBackend>,
) -> Arc<DocflowService> {
    let mut static_config = StaticConfig::default();
    static_config.storage.data_dir = data_dir.to_path_buf();
    let mut tokens = HashMap::new();
    tokens.insert(sha256_hex(TOKEN.as_bytes()), OWNER.to_string());
    static_config.auth.tokens = tokens;

    let runtime_config = Arc::new(RuntimeConfig::new(static_config, DynamicConfig::default()));
    let verifier = Arc::new(StaticTokenVerifier::new(
        &runtime_config.static_config.auth.tokens,
    ));

    Arc::new(DocflowService::with_parts(
        Arc::new(db),
        runtime_config,
        backend,
        verifier,
    ))
}
