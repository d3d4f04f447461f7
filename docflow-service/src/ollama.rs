use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::config::RuntimeConfig;
use crate::error::{EmbeddingError, OllamaError, ServiceError, ServiceResult};

/// Ollama API client.
///
/// Base URL and model are read from the runtime config on every call so
/// settings changes apply to the next request.
pub struct OllamaClient {
    client: Client,
    runtime_config: Arc<RuntimeConfig>,
}

impl OllamaClient {
    /// Create a new Ollama client
    pub fn new(runtime_config: Arc<RuntimeConfig>) -> ServiceResult<Self> {
        let dynamic = runtime_config.dynamic();
        let client = Client::builder()
            .timeout(Duration::from_secs(dynamic.ollama.request_timeout_secs))
            .build()
            .map_err(|e| {
                ServiceError::Ollama(OllamaError::Connection {
                    url: dynamic.ollama.base_url.clone(),
                    source: e,
                })
            })?;
        drop(dynamic);

        Ok(Self {
            client,
            runtime_config,
        })
    }

    /// Check if Ollama is available
    pub async fn health_check(&self) -> bool {
        let url = format!("{}/api/tags", self.runtime_config.dynamic().ollama.base_url);

        match self.client.get(&url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                warn!(error = %e, "Ollama health check failed");
                false
            }
        }
    }

    /// Generate embedding for text using the configured embedding model
    pub async fn embed_text(&self, text: &str) -> ServiceResult<Vec<f32>> {
        let (url, model) = {
            let dynamic = self.runtime_config.dynamic();
            (
                format!("{}/api/embeddings", dynamic.ollama.base_url),
                dynamic.embeddings.model.clone(),
            )
        };

        let request = EmbeddingRequest {
            model: model.clone(),
            prompt: text.to_string(),
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| OllamaError::Connection {
                url: url.clone(),
                source: e,
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();

            if message.contains("model")
                && (message.contains("not found") || message.contains("does not exist"))
            {
                return Err(ServiceError::Ollama(OllamaError::ModelNotFound { model }));
            }

            return Err(ServiceError::Ollama(OllamaError::Generation {
                status,
                message,
            }));
        }

        let embedding_response: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| OllamaError::InvalidResponse { source: e })?;

        if embedding_response.embedding.is_empty() {
            return Err(ServiceError::Embedding(EmbeddingError::Generation {
                message: format!("Model {} returned an empty embedding", model),
            }));
        }

        Ok(embedding_response.embedding)
    }
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest {
    model: String,
    prompt: String,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedding_wire_format() {
        let request = EmbeddingRequest {
            model: "nomic-embed-text".to_string(),
            prompt: "hello".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            serde_json::json!({ "model": "nomic-embed-text", "prompt": "hello" })
        );

        let response: EmbeddingResponse =
            serde_json::from_str(r#"{"embedding": [0.25, -1.0]}"#).unwrap();
        assert_eq!(response.embedding, vec![0.25, -1.0]);
    }
}
