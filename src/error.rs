//! Error types for ratings-store

use diesel::result::{DatabaseErrorKind, Error as DieselError};
use thiserror::Error;
use tracing::error;

#[derive(Error, Debug)]
pub enum StoreError {
    /// Malformed input, reported to the caller immediately. Never retried.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Referenced entity absent. Never retried.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A second rating attempt for the same (post, user) pair, caught by
    /// the application pre-check. Never retried.
    #[error("Duplicate rating: {0}")]
    Duplicate(String),

    /// A concurrent first-time submission lost the race to the storage
    /// uniqueness constraint. Transient: safe to retry, after which the
    /// pre-check resolves it to `Duplicate`.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Storage/infra failure. The payload carries the storage detail for
    /// logs; the display string stays opaque to callers.
    #[error("Internal storage error")]
    Internal(String),
}

impl StoreError {
    /// Whether this error signals a benign lost race worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

/// Central mapping from diesel errors to the store taxonomy.
///
/// The uniqueness constraint on (post_id, user_id) is the authoritative
/// duplicate guard; when it fires the application pre-check has already
/// passed, so the violation is a race between two in-flight submissions,
/// not an ordinary duplicate.
impl From<DieselError> for StoreError {
    fn from(err: DieselError) -> Self {
        match err {
            DieselError::NotFound => StoreError::NotFound("record not found".to_string()),
            DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, info) => {
                StoreError::Conflict(info.message().to_string())
            }
            DieselError::DatabaseError(DatabaseErrorKind::CheckViolation, info) => {
                StoreError::Validation(info.message().to_string())
            }
            other => {
                error!("storage error: {}", other);
                StoreError::Internal(other.to_string())
            }
        }
    }
}
