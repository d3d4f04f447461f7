//! External processing collaborator.
//!
//! The pipeline never extracts, chunks or embeds anything itself; it drives a
//! `ProcessingBackend` one stage at a time.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::RuntimeConfig;
use crate::db::Document;
use crate::error::ServiceResult;
use crate::ingestion;
use crate::ollama::OllamaClient;

/// Does the real work behind each pipeline stage
#[async_trait]
pub trait ProcessingBackend: Send + Sync {
    /// Plain text of the document's stored upload
    async fn extract_text(&self, doc: &Document) -> ServiceResult<String>;

    /// Split extracted text into chunk contents, in order
    async fn chunk_text(&self, doc: &Document, text: &str) -> ServiceResult<Vec<String>>;

    /// One embedding per input text, in the same order
    async fn embed(&self, texts: &[String]) -> ServiceResult<Vec<Vec<f32>>>;

    /// Whether the backend is reachable
    async fn health_check(&self) -> bool;
}

/// Backend reading stored text uploads and embedding through Ollama
pub struct OllamaBackend {
    runtime_config: Arc<RuntimeConfig>,
    ollama: OllamaClient,
}

impl OllamaBackend {
    pub fn new(runtime_config: Arc<RuntimeConfig>) -> ServiceResult<Self> {
        let ollama = OllamaClient::new(runtime_config.clone())?;
        Ok(Self {
            runtime_config,
            ollama,
        })
    }
}

#[async_trait]
impl ProcessingBackend for OllamaBackend {
    async fn extract_text(&self, doc: &Document) -> ServiceResult<String> {
        ingestion::extract_text(doc).await
    }

    async fn chunk_text(&self, _doc: &Document, text: &str) -> ServiceResult<Vec<String>> {
        let (chunk_size, overlap) = {
            let dynamic = self.runtime_config.dynamic();
            (dynamic.embeddings.chunk_size, dynamic.embeddings.chunk_overlap)
        };
        Ok(ingestion::chunk_text(text, chunk_size, overlap))
    }

    async fn embed(&self, texts: &[String]) -> ServiceResult<Vec<Vec<f32>>> {
        let mut embeddings = Vec::with_capacity(texts.len());
        for text in texts {
            embeddings.push(self.ollama.embed_text(text).await?);
        }
        Ok(embeddings)
    }

    async fn health_check(&self) -> bool {
        self.ollama.health_check().await
    }
}
