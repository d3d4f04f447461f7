//! Chunk storage operations.
//!
//! Chunks are written only through `replace_chunks`, which swaps the whole
//! chunk set of a document inside one transaction. A retried attempt
//! therefore never leaves duplicates or a mix of old and new chunks.

use chrono::Utc;
use rusqlite::{TransactionBehavior, params};

use super::Database;
use super::jobs::holds_claim;
#[cfg(test)]
use super::models::Chunk;
use super::models::{JobClaim, NewChunk, db_timestamp};
use crate::error::{DatabaseError, ServiceResult};

impl Database {
    /// Replace every chunk of the claimed document with `chunks`.
    ///
    /// Returns `None` without touching anything when the claim has been lost,
    /// otherwise the number of chunks now stored.
    pub fn replace_chunks(
        &self,
        claim: &JobClaim,
        chunks: &[NewChunk],
    ) -> ServiceResult<Option<usize>> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(DatabaseError::Query)?;

        if !holds_claim(&tx, claim)? {
            return Ok(None);
        }

        // Embeddings go with their chunks via ON DELETE CASCADE
        tx.execute(
            "DELETE FROM chunks WHERE document_id = ?1",
            params![claim.document_id],
        )
        .map_err(DatabaseError::Query)?;

        let now = db_timestamp(&Utc::now());
        {
            let mut insert_chunk = tx
                .prepare(
                    "INSERT INTO chunks (id, document_id, chunk_index, content, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )
                .map_err(DatabaseError::Query)?;
            let mut insert_embedding = tx
                .prepare("INSERT INTO chunk_embeddings (chunk_id, embedding) VALUES (?1, ?2)")
                .map_err(DatabaseError::Query)?;

            for chunk in chunks {
                let chunk_id = uuid::Uuid::new_v4().to_string();
                insert_chunk
                    .execute(params![
                        chunk_id,
                        claim.document_id,
                        chunk.chunk_index as i64,
                        chunk.content,
                        now
                    ])
                    .map_err(DatabaseError::Query)?;

                // Convert f32 slice to bytes
                let embedding_bytes: Vec<u8> = chunk
                    .embedding
                    .iter()
                    .flat_map(|f| f.to_le_bytes())
                    .collect();
                insert_embedding
                    .execute(params![chunk_id, embedding_bytes])
                    .map_err(DatabaseError::Query)?;
            }
        }

        tx.commit().map_err(DatabaseError::Query)?;

        Ok(Some(chunks.len()))
    }

    /// Count the stored chunks of a document
    pub fn count_chunks(&self, document_id: &str) -> ServiceResult<usize> {
        let conn = self.conn()?;

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM chunks WHERE document_id = ?1",
                params![document_id],
                |row| row.get(0),
            )
            .map_err(DatabaseError::Query)?;

        Ok(count.max(0) as usize)
    }

    /// Get all chunks for a document in order
    #[cfg(test)]
    pub(crate) fn get_chunks(&self, document_id: &str) -> ServiceResult<Vec<Chunk>> {
        let conn = self.conn()?;

        let mut stmt = conn
            .prepare(
                "SELECT id, document_id, chunk_index, content, created_at FROM chunks \
                 WHERE document_id = ?1 ORDER BY chunk_index",
            )
            .map_err(DatabaseError::Query)?;

        let rows = stmt
            .query_map(params![document_id], Chunk::from_row)
            .map_err(DatabaseError::Query)?;

        let mut chunks = Vec::new();
        for row in rows {
            chunks.push(row.map_err(DatabaseError::Query)?);
        }

        Ok(chunks)
    }

    /// Get the stored embedding of a chunk
    #[cfg(test)]
    pub(crate) fn get_embedding(&self, chunk_id: &str) -> ServiceResult<Option<Vec<f32>>> {
        use rusqlite::OptionalExtension;

        let conn = self.conn()?;

        let bytes: Option<Vec<u8>> = conn
            .query_row(
                "SELECT embedding FROM chunk_embeddings WHERE chunk_id = ?1",
                params![chunk_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(DatabaseError::Query)?;

        Ok(bytes.map(|bytes| {
            bytes
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::Document;

    fn claimed_document(db: &Database) -> JobClaim {
        db.insert_document(&Document {
            id: "doc-1".to_string(),
            owner_id: "owner-1".to_string(),
            title: "Rulebook".to_string(),
            file_path: None,
            file_hash: None,
            created_at: Utc::now(),
        })
        .unwrap();
        let job = db.upsert_job_for_enqueue("doc-1", "owner-1", 0).unwrap();
        db.claim_job(&job.id, Utc::now()).unwrap().unwrap()
    }

    fn new_chunks(texts: &[&str]) -> Vec<NewChunk> {
        texts
            .iter()
            .enumerate()
            .map(|(i, text)| NewChunk {
                chunk_index: i,
                content: text.to_string(),
                embedding: vec![i as f32, 0.5],
            })
            .collect()
    }

    #[test]
    fn test_replace_chunks_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let claim = claimed_document(&db);

        let stored = db
            .replace_chunks(&claim, &new_chunks(&["one", "two", "three"]))
            .unwrap();
        assert_eq!(stored, Some(3));

        let stored = db
            .replace_chunks(&claim, &new_chunks(&["alpha", "beta"]))
            .unwrap();
        assert_eq!(stored, Some(2));

        let chunks = db.get_chunks("doc-1").unwrap();
        assert_eq!(db.count_chunks("doc-1").unwrap(), 2);
        assert_eq!(chunks[0].content, "alpha");
        assert_eq!(chunks[1].chunk_index, 1);

        let embedding = db.get_embedding(&chunks[1].id).unwrap().unwrap();
        assert_eq!(embedding, vec![1.0, 0.5]);
    }

    #[test]
    fn test_replace_chunks_requires_claim() {
        let db = Database::open_in_memory().unwrap();
        let claim = claimed_document(&db);
        db.replace_chunks(&claim, &new_chunks(&["kept"])).unwrap();

        db.cancel_job(&claim.job_id).unwrap();
        let stored = db
            .replace_chunks(&claim, &new_chunks(&["lost", "write"]))
            .unwrap();

        assert_eq!(stored, None);
        assert_eq!(db.count_chunks("doc-1").unwrap(), 1);
    }
}
