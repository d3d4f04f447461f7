use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::db::{JobErrorKind, JobStatus};

/// Main service error type
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Document not found: {document_id}")]
    DocumentNotFound { document_id: String },

    #[error("No job exists for document {document_id}")]
    JobNotFound { document_id: String },

    #[error("Document already uploaded as {existing_id}")]
    DuplicateDocument { existing_id: String },

    #[error("Retry limit reached for document {document_id} ({retry_count}/{max_retries})")]
    RetryLimitReached {
        document_id: String,
        retry_count: u32,
        max_retries: u32,
    },

    #[error("Cannot {action} job for document {document_id} while it is {status}")]
    InvalidTransition {
        document_id: String,
        status: JobStatus,
        action: &'static str,
    },

    #[error("Missing or invalid credentials")]
    Unauthorized,

    #[error("{0}")]
    Ollama(#[from] OllamaError),

    #[error("Database error")]
    Database(#[from] DatabaseError),

    #[error("Document processing failed")]
    Processing(#[from] ProcessingError),

    #[error("Embedding error")]
    Embedding(#[from] EmbeddingError),

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Ollama client errors
#[derive(Error, Debug)]
pub enum OllamaError {
    #[error("Connection failed to Ollama at {url}")]
    Connection {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Model not found: {model}")]
    ModelNotFound { model: String },

    #[error("Request failed (status {status}): {message}")]
    Generation { status: u16, message: String },

    #[error("Invalid response from Ollama")]
    InvalidResponse {
        #[source]
        source: reqwest::Error,
    },
}

/// Database errors
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database connection failed")]
    Connection(#[source] rusqlite::Error),

    #[error("Query failed")]
    Query(#[source] rusqlite::Error),

    #[error("Migration failed: {message}")]
    Migration { message: String },

    #[error("Serialization failed")]
    Serialization(#[source] serde_json::Error),

    #[error("Database lock poisoned")]
    Poisoned,
}

/// Document processing errors
#[derive(Error, Debug)]
pub enum ProcessingError {
    #[error("Unsupported file format: {format}")]
    UnsupportedFormat { format: String },

    #[error("File too large: {size} bytes (max {max} bytes)")]
    FileTooLarge { size: u64, max: u64 },

    #[error("Document {document_id} has no stored file")]
    MissingFile { document_id: String },

    #[error("Document {document_id} contains no extractable text")]
    EmptyDocument { document_id: String },

    #[error("IO error")]
    Io(#[source] std::io::Error),

    #[error("Pipeline panicked: {message}")]
    Panicked { message: String },
}

/// Embedding errors
#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("Model initialization failed: {message}")]
    ModelInit { message: String },

    #[error("Embedding generation failed: {message}")]
    Generation { message: String },

    #[error("Expected {expected} embeddings, backend returned {actual}")]
    CountMismatch { expected: usize, actual: usize },
}

/// API error response
#[derive(Serialize)]
pub struct ErrorResponse {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ServiceError {
    /// Decide how the job queue treats this error when it aborts an attempt.
    pub fn classify(&self) -> JobErrorKind {
        match self {
            ServiceError::Ollama(OllamaError::Connection { .. })
            | ServiceError::Ollama(OllamaError::InvalidResponse { .. }) => JobErrorKind::Transient,
            ServiceError::Ollama(OllamaError::Generation { status, .. })
                if *status == 429 || *status >= 500 =>
            {
                JobErrorKind::Transient
            }
            ServiceError::Database(_) => JobErrorKind::Transient,
            ServiceError::Embedding(EmbeddingError::CountMismatch { .. }) => {
                JobErrorKind::NonRetryable
            }
            ServiceError::Embedding(_) => JobErrorKind::Transient,
            ServiceError::Processing(ProcessingError::Io(e))
                if e.kind() != std::io::ErrorKind::NotFound =>
            {
                JobErrorKind::Transient
            }
            ServiceError::Processing(ProcessingError::Panicked { .. }) => JobErrorKind::Transient,
            _ => JobErrorKind::NonRetryable,
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::DocumentNotFound { .. } | ServiceError::JobNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            ServiceError::DuplicateDocument { .. }
            | ServiceError::RetryLimitReached { .. }
            | ServiceError::InvalidTransition { .. } => StatusCode::CONFLICT,
            ServiceError::Unauthorized => StatusCode::UNAUTHORIZED,
            ServiceError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            ServiceError::Processing(ProcessingError::UnsupportedFormat { .. }) => {
                StatusCode::UNSUPPORTED_MEDIA_TYPE
            }
            ServiceError::Processing(ProcessingError::FileTooLarge { .. }) => {
                StatusCode::PAYLOAD_TOO_LARGE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            ServiceError::DocumentNotFound { .. } => "document_not_found",
            ServiceError::JobNotFound { .. } => "job_not_found",
            ServiceError::DuplicateDocument { .. } => "duplicate_document",
            ServiceError::RetryLimitReached { .. } => "retry_limit_reached",
            ServiceError::InvalidTransition { .. } => "invalid_transition",
            ServiceError::Unauthorized => "unauthorized",
            ServiceError::Ollama(OllamaError::Connection { .. }) => "ollama_connection",
            ServiceError::Ollama(OllamaError::ModelNotFound { .. }) => "ollama_model_not_found",
            ServiceError::Ollama(OllamaError::Generation { .. }) => "ollama_generation",
            ServiceError::Ollama(OllamaError::InvalidResponse { .. }) => "ollama_invalid_response",
            ServiceError::Database(_) => "database_error",
            ServiceError::Processing(ProcessingError::UnsupportedFormat { .. }) => {
                "unsupported_format"
            }
            ServiceError::Processing(ProcessingError::FileTooLarge { .. }) => "file_too_large",
            ServiceError::Processing(ProcessingError::MissingFile { .. }) => "missing_file",
            ServiceError::Processing(ProcessingError::EmptyDocument { .. }) => "empty_document",
            ServiceError::Processing(ProcessingError::Io(_)) => "io_error",
            ServiceError::Processing(ProcessingError::Panicked { .. }) => "internal_error",
            ServiceError::Embedding(_) => "embedding_error",
            ServiceError::InvalidRequest { .. } => "invalid_request",
            ServiceError::Config { .. } => "config_error",
            ServiceError::Internal { .. } => "internal_error",
        }
    }

    fn details(&self) -> Option<serde_json::Value> {
        match self {
            ServiceError::DuplicateDocument { existing_id } => {
                Some(serde_json::json!({ "existing_id": existing_id }))
            }
            ServiceError::RetryLimitReached {
                retry_count,
                max_retries,
                ..
            } => Some(serde_json::json!({
                "retry_count": retry_count,
                "max_retries": max_retries,
            })),
            ServiceError::InvalidTransition { status, .. } => {
                Some(serde_json::json!({ "status": status }))
            }
            _ => None,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %format_error_chain_ref(&self), "Request failed");
        }

        let response = ErrorResponse {
            message: self.to_string(),
            code: Some(self.error_code().to_string()),
            details: self.details(),
        };

        (status, Json(response)).into_response()
    }
}

/// Result type alias for service operations
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Collect an error and its sources, outermost first.
pub fn error_chain(error: &(dyn std::error::Error + 'static)) -> Vec<String> {
    let mut chain = vec![error.to_string()];
    let mut current = error.source();
    while let Some(source) = current {
        chain.push(source.to_string());
        current = source.source();
    }
    chain
}

/// Render an error and its sources as a single `a: b: c` line for logs.
pub fn format_error_chain_ref(error: &(dyn std::error::Error + 'static)) -> String {
    error_chain(error).join(": ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_transient_errors() {
        let unavailable = ServiceError::Ollama(OllamaError::Generation {
            status: 503,
            message: "loading model".to_string(),
        });
        assert_eq!(unavailable.classify(), JobErrorKind::Transient);

        let throttled = ServiceError::Ollama(OllamaError::Generation {
            status: 429,
            message: "slow down".to_string(),
        });
        assert_eq!(throttled.classify(), JobErrorKind::Transient);

        let io = ServiceError::Processing(ProcessingError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "timed out",
        )));
        assert_eq!(io.classify(), JobErrorKind::Transient);

        let db = ServiceError::Database(DatabaseError::Poisoned);
        assert_eq!(db.classify(), JobErrorKind::Transient);
    }

    #[test]
    fn test_classify_non_retryable_errors() {
        let unsupported = ServiceError::Processing(ProcessingError::UnsupportedFormat {
            format: "docx".to_string(),
        });
        assert_eq!(unsupported.classify(), JobErrorKind::NonRetryable);

        let bad_request = ServiceError::Ollama(OllamaError::Generation {
            status: 400,
            message: "bad input".to_string(),
        });
        assert_eq!(bad_request.classify(), JobErrorKind::NonRetryable);

        let missing = ServiceError::Processing(ProcessingError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "gone",
        )));
        assert_eq!(missing.classify(), JobErrorKind::NonRetryable);

        let model = ServiceError::Ollama(OllamaError::ModelNotFound {
            model: "nomic-embed-text".to_string(),
        });
        assert_eq!(model.classify(), JobErrorKind::NonRetryable);
    }

    #[test]
    fn test_error_chain_includes_sources() {
        let error = ServiceError::Processing(ProcessingError::Io(std::io::Error::other("disk")));
        let chain = error_chain(&error);
        assert_eq!(chain, vec!["Document processing failed", "IO error", "disk"]);
        assert_eq!(
            format_error_chain_ref(&error),
            "Document processing failed: IO error: disk"
        );
    }

    #[test]
    fn test_retry_limit_response_code() {
        let error = ServiceError::RetryLimitReached {
            document_id: "doc".to_string(),
            retry_count: 3,
            max_retries: 3,
        };
        assert_eq!(error.status_code(), StatusCode::CONFLICT);
        assert_eq!(error.error_code(), "retry_limit_reached");
        assert_eq!(
            error.details(),
            Some(serde_json::json!({ "retry_count": 3, "max_retries": 3 }))
        );
    }
}
