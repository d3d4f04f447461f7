//! Database module for SQLite operations.
//!
//! This module provides the `Database` struct and all database operations
//! organized into submodules by domain. The `jobs` table is the only
//! coordination point between dispatchers and reapers: every state change is
//! a single conditional write naming the state it expects to replace.

mod chunks;
mod documents;
mod jobs;
mod migrations;
pub mod models;
mod settings;

pub use models::{
    Document, Job, JobClaim, JobErrorDetails, JobErrorKind, JobFailure, JobStage,
    JobStatus, MAX_RETRIES, NewChunk, db_timestamp,
};

use rusqlite::Connection;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::error::{DatabaseError, ServiceError, ServiceResult};

/// How long a connection waits on a lock held by another process
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Database manager for SQLite operations
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create the database at the given path
    pub fn open(path: &Path) -> ServiceResult<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ServiceError::Database(DatabaseError::Connection(
                    rusqlite::Error::ToSqlConversionFailure(Box::new(e)),
                ))
            })?;
        }

        let conn = Connection::open(path).map_err(DatabaseError::Connection)?;

        // WAL lets status readers proceed while a dispatcher writes
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(DatabaseError::Query)?;

        Self::from_connection(conn)
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> ServiceResult<Self> {
        let conn = Connection::open_in_memory().map_err(DatabaseError::Connection)?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(DatabaseError::Query)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> ServiceResult<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(DatabaseError::Connection)?;

        // Run all migrations
        migrations::run_migrations(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> ServiceResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| ServiceError::Database(DatabaseError::Poisoned))
    }
}
