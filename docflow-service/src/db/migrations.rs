//! Database schema migrations.
//!
//! This module contains all database migrations and schema setup.

use rusqlite::Connection;

use crate::error::{DatabaseError, ServiceResult};

/// Run all database migrations.
///
/// This function is called during database initialization to ensure
/// the schema is up to date.
pub(super) fn run_migrations(conn: &Connection) -> ServiceResult<()> {
    // Initial schema setup
    conn.execute_batch(
        r#"
        -- Documents table (ownership relation and stored upload)
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            title TEXT NOT NULL,
            file_path TEXT,
            file_hash TEXT,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_documents_owner_hash ON documents(owner_id, file_hash);

        -- One job row per document; the row is the whole queue
        CREATE TABLE IF NOT EXISTS jobs (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL UNIQUE,
            owner_id TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'processing', 'completed', 'failed', 'cancelled')),
            stage TEXT
                CHECK (stage IS NULL OR stage IN ('extracting_text', 'chunking', 'generating_embeddings', 'storing_chunks', 'completed')),
            progress INTEGER NOT NULL DEFAULT 0 CHECK (progress BETWEEN 0 AND 100),
            priority INTEGER NOT NULL DEFAULT 0,
            retry_count INTEGER NOT NULL DEFAULT 0 CHECK (retry_count >= 0),
            error_kind TEXT,
            error_message TEXT,
            error_details TEXT,
            result_count INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            processing_started_at TEXT,
            processing_completed_at TEXT,
            updated_at TEXT NOT NULL,
            last_retry_at TEXT,
            CHECK (status != 'processing' OR (stage IS NOT NULL AND processing_started_at IS NOT NULL)),
            FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_jobs_dispatch ON jobs(status, priority DESC, created_at ASC);
        CREATE INDEX IF NOT EXISTS idx_jobs_stuck ON jobs(status, processing_started_at);
        CREATE INDEX IF NOT EXISTS idx_jobs_owner ON jobs(owner_id);

        -- Chunks table
        CREATE TABLE IF NOT EXISTS chunks (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            content TEXT NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE(document_id, chunk_index),
            FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_chunks_document ON chunks(document_id);

        -- Vector embeddings stored as little-endian f32 BLOBs
        CREATE TABLE IF NOT EXISTS chunk_embeddings (
            chunk_id TEXT PRIMARY KEY,
            embedding BLOB NOT NULL,
            FOREIGN KEY (chunk_id) REFERENCES chunks(id) ON DELETE CASCADE
        );
    "#,
    )
    .map_err(|e| DatabaseError::Migration {
        message: e.to_string(),
    })?;

    run_settings_table_migration(conn)?;

    Ok(())
}

/// Migration: Add settings table for runtime configuration overrides
fn run_settings_table_migration(conn: &Connection) -> ServiceResult<()> {
    let has_settings_table: bool = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='settings'",
            [],
            |row| row.get::<_, i64>(0),
        )
        .unwrap_or(0)
        > 0;

    if !has_settings_table {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            "#,
        )
        .map_err(|e| DatabaseError::Migration {
            message: format!("Failed to create settings table: {}", e),
        })?;
    }

    Ok(())
}
