use thiserror::Error;

use oncall_core::CoreError;
use oncall_store::StoreError;

#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid job payload: {0}")]
    Payload(#[from] CoreError),

    #[error("no handler registered for job type '{0}'")]
    UnknownType(String),

    #[error("handler error: {0}")]
    Handler(String),
}

impl JobError {
    pub fn is_transient(&self) -> bool {
        matches!(self, JobError::Store(e) if e.is_transient())
    }
}
