//! Metadata store error types.

use thiserror::Error;

/// Metadata store operation errors.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("meta blob decode error: {0}")]
    Meta(#[from] serde_json::Error),

    #[error("core error: {0}")]
    Core(#[from] stevedore_core::Error),

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl MetadataError {
    /// True for PostgreSQL serialization failures (SQLSTATE 40001), the
    /// signal that a serializable transaction should be retried.
    pub fn is_serialization_failure(&self) -> bool {
        match self {
            MetadataError::Database(sqlx::Error::Database(db)) => {
                db.code().as_deref() == Some("40001")
            }
            _ => false,
        }
    }
}

/// Result type for metadata operations.
pub type MetadataResult<T> = std::result::Result<T, MetadataError>;
