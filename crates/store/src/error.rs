//! Store error type and transient-failure classification.

use thiserror::Error;

use oncall_core::CoreError;

pub type StoreResult<T> = Result<T, StoreError>;

/// SQLSTATE codes worth an immediate retry: serialization failure,
/// deadlock detected, lock not available.
const TRANSIENT_SQLSTATES: &[&str] = &["40001", "40P01", "55P03"];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("write conflict: {0}")]
    Conflict(String),

    #[error("connection error: {0}")]
    Connection(String),
}

impl From<CoreError> for StoreError {
    fn from(e: CoreError) -> Self {
        StoreError::Corrupt(e.to_string())
    }
}

impl StoreError {
    /// Whether the failure is expected to go away on an immediate retry.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Conflict(_) | StoreError::Connection(_) => true,
            StoreError::Database(err) => match err {
                sqlx::Error::Database(db) => db
                    .code()
                    .map(|code| TRANSIENT_SQLSTATES.iter().any(|c| code == *c))
                    .unwrap_or(false),
                sqlx::Error::Io(_)
                | sqlx::Error::PoolTimedOut
                | sqlx::Error::PoolClosed
                | sqlx::Error::WorkerCrashed => true,
                _ => false,
            },
            StoreError::Migrate(_) | StoreError::NotFound(_) | StoreError::Corrupt(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflicts_and_pool_timeouts_are_transient() {
        assert!(StoreError::Conflict("40001".to_string()).is_transient());
        assert!(StoreError::Connection("reset".to_string()).is_transient());
        assert!(StoreError::Database(sqlx::Error::PoolTimedOut).is_transient());
    }

    #[test]
    fn missing_rows_and_bad_data_are_not_transient() {
        assert!(!StoreError::NotFound("incident".to_string()).is_transient());
        assert!(!StoreError::Corrupt("bad enum".to_string()).is_transient());
        assert!(!StoreError::Database(sqlx::Error::RowNotFound).is_transient());
    }

    #[test]
    fn core_errors_become_corrupt_rows() {
        let err: StoreError = "sideways".parse::<oncall_core::Channel>().unwrap_err().into();
        assert!(matches!(err, StoreError::Corrupt(_)));
    }
}
