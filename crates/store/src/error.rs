//! Store-level errors.

use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    /// A unique index rejected the write. The constraint name is stable and
    /// callers match on it ("already done" signals).
    #[error("unique constraint violated: {constraint}")]
    UniqueViolation { constraint: String },

    /// The row an update targeted does not exist.
    #[error("row not found: {0}")]
    RowNotFound(&'static str),

    /// A state precondition inside a transactional operation failed.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Anything the backend reports that is not one of the above.
    #[error("storage backend failure: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn unique(constraint: impl Into<String>) -> Self {
        StoreError::UniqueViolation {
            constraint: constraint.into(),
        }
    }

    pub fn is_unique_violation(&self) -> bool {
        matches!(self, StoreError::UniqueViolation { .. })
    }
}

impl From<StoreError> for meterline_shared::error::ServiceError {
    fn from(err: StoreError) -> Self {
        use meterline_shared::error::ServiceError;
        match err {
            StoreError::UniqueViolation { constraint } => {
                ServiceError::conflict(format!("duplicate: {constraint}"))
            }
            StoreError::RowNotFound(table) => ServiceError::not_found(format!("{table} row missing")),
            StoreError::Conflict(reason) => ServiceError::conflict(reason),
            StoreError::Backend(detail) => {
                tracing::error!(error = %detail, "store backend failure");
                ServiceError::internal("storage failure")
            }
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            if db.is_unique_violation() {
                return StoreError::UniqueViolation {
                    constraint: db.constraint().unwrap_or("unknown").to_owned(),
                };
            }
        }
        StoreError::Backend(err.to_string())
    }
}
