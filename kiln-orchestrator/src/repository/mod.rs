//! Repository Module
//!
//! Data access layer for the orchestrator.
//! Each repository is a trait with a Postgres implementation, so services can
//! be exercised against in-memory stores.

pub mod job;
#[cfg(test)]
pub mod memory;
pub mod user;

// Re-export for convenience
pub use job::{JobRecordStore, PgJobStore};
pub use user::{PgUserStore, UserStore};

use thiserror::Error;

/// Errors raised by the persistence layer
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// The statement never reached the database, so repeating it cannot
    /// apply it twice
    pub fn never_sent(&self) -> bool {
        matches!(self, StoreError::Database(sqlx::Error::PoolTimedOut))
    }
}
