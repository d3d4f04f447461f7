//! Document upload.

use std::io::Write;

use chrono::Utc;
use tracing::info;

use crate::db::{Document, Job};
use crate::error::{ProcessingError, ServiceError, ServiceResult};
use crate::ingestion::hash::sha256_hex;
use crate::ingestion::{ensure_supported, sanitize_filename};
use crate::service::DocflowService;

impl DocflowService {
    /// Store an uploaded file, record the document and enqueue it.
    ///
    /// The file is written to a temporary name inside the documents
    /// directory and renamed into place, so a crash never leaves a
    /// half-written upload under its final name.
    pub async fn upload_document(
        &self,
        owner_id: &str,
        content: &[u8],
        filename: &str,
        title: &str,
        priority: i64,
    ) -> ServiceResult<(Document, Job)> {
        // Check file size
        let max_size = self.runtime_config.dynamic().limits.max_document_size_bytes;
        if content.len() as u64 > max_size {
            return Err(ServiceError::Processing(ProcessingError::FileTooLarge {
                size: content.len() as u64,
                max: max_size,
            }));
        }

        let filename = sanitize_filename(filename);
        if filename.is_empty() {
            return Err(ServiceError::InvalidRequest {
                message: "Upload is missing a filename".to_string(),
            });
        }
        ensure_supported(&filename)?;

        // Compute content hash for duplicate detection
        let file_hash = sha256_hex(content);
        if let Some(existing_id) = self.db.find_document_by_hash(owner_id, &file_hash)? {
            return Err(ServiceError::DuplicateDocument { existing_id });
        }

        let doc_id = uuid::Uuid::new_v4().to_string();
        let docs_dir = self.runtime_config.static_config.storage.documents_dir();
        let permanent_path = docs_dir.join(format!("{}_{}", doc_id, filename));

        let bytes = content.to_vec();
        let target = permanent_path.clone();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            std::fs::create_dir_all(&docs_dir)?;
            let mut staged = tempfile::NamedTempFile::new_in(&docs_dir)?;
            staged.write_all(&bytes)?;
            staged.as_file().sync_all()?;
            staged.persist(&target).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .map_err(|e| ServiceError::Internal {
            message: format!("Upload writer task failed: {}", e),
        })?
        .map_err(ProcessingError::Io)?;

        let document = Document {
            id: doc_id.clone(),
            owner_id: owner_id.to_string(),
            title: if title.trim().is_empty() {
                filename.clone()
            } else {
                title.trim().to_string()
            },
            file_path: Some(permanent_path.to_string_lossy().to_string()),
            file_hash: Some(file_hash),
            created_at: Utc::now(),
        };
        self.db.insert_document(&document)?;

        info!(
            doc_id = %doc_id,
            title = %document.title,
            size = content.len(),
            "Document uploaded"
        );

        let job = self.enqueue(owner_id, &doc_id, priority)?;

        Ok((document, job))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::JobStatus;
    use crate::service::testing::{Harness, OTHER_OWNER, OWNER};

    #[tokio::test]
    async fn test_upload_stores_file_and_enqueues() {
        let h = Harness::new();
        let (document, job) = h
            .service
            .upload_document(OWNER, b"hello queue", "my notes.txt", "  Notes ", 7)
            .await
            .unwrap();

        assert_eq!(document.title, "Notes");
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.priority, 7);

        let path = document.file_path.unwrap();
        assert!(path.ends_with(&format!("{}_my_notes.txt", document.id)));
        assert!(path.starts_with(&h.dir.path().join("documents").to_string_lossy().to_string()));
        assert_eq!(std::fs::read(&path).unwrap(), b"hello queue");
    }

    #[tokio::test]
    async fn test_duplicate_upload_is_rejected_per_owner() {
        let h = Harness::new();
        let (first, _) = h
            .service
            .upload_document(OWNER, b"same bytes", "a.md", "A", 0)
            .await
            .unwrap();

        let err = h
            .service
            .upload_document(OWNER, b"same bytes", "b.md", "B", 0)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::DuplicateDocument { existing_id } if existing_id == first.id
        ));

        // Another owner may upload the same content
        h.service
            .upload_document(OTHER_OWNER, b"same bytes", "b.md", "B", 0)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_upload_limits() {
        let h = Harness::new();
        let mut dynamic = (**h.service.runtime_config.dynamic()).clone();
        dynamic.limits.max_document_size_bytes = 4;
        h.service.runtime_config.update_dynamic(dynamic);

        assert!(matches!(
            h.service
                .upload_document(OWNER, b"too large", "a.txt", "A", 0)
                .await,
            Err(ServiceError::Processing(ProcessingError::FileTooLarge { size: 9, max: 4 }))
        ));
        assert!(matches!(
            h.service.upload_document(OWNER, b"pdf", "a.pdf", "A", 0).await,
            Err(ServiceError::Processing(ProcessingError::UnsupportedFormat { .. }))
        ));
    }
}
