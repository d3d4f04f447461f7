//! Document operations.
//!
//! Documents are owned by the upload layer; the queue only needs them to
//! scope jobs to an owner and to find the stored file.

use rusqlite::{OptionalExtension, params};

use super::Database;
use super::models::{Document, db_timestamp};
use crate::error::{DatabaseError, ServiceResult};

impl Database {
    /// Insert a new document
    pub fn insert_document(&self, doc: &Document) -> ServiceResult<()> {
        let conn = self.conn()?;

        conn.execute(
            r#"
            INSERT INTO documents (id, owner_id, title, file_path, file_hash, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                doc.id,
                doc.owner_id,
                doc.title,
                doc.file_path,
                doc.file_hash,
                db_timestamp(&doc.created_at),
            ],
        )
        .map_err(DatabaseError::Query)?;

        Ok(())
    }

    /// Get a document by ID
    pub fn get_document(&self, id: &str) -> ServiceResult<Option<Document>> {
        let conn = self.conn()?;

        conn.query_row(
            "SELECT id, owner_id, title, file_path, file_hash, created_at FROM documents WHERE id = ?1",
            params![id],
            Document::from_row,
        )
        .optional()
        .map_err(DatabaseError::Query)
        .map_err(Into::into)
    }

    /// Find an owner's document with the given content hash.
    /// Returns the document ID if found.
    pub fn find_document_by_hash(
        &self,
        owner_id: &str,
        file_hash: &str,
    ) -> ServiceResult<Option<String>> {
        let conn = self.conn()?;

        conn.query_row(
            "SELECT id FROM documents WHERE owner_id = ?1 AND file_hash = ?2 ORDER BY created_at LIMIT 1",
            params![owner_id, file_hash],
            |row| row.get(0),
        )
        .optional()
        .map_err(DatabaseError::Query)
        .map_err(Into::into)
    }
}
