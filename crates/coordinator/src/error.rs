use thiserror::Error;

use oncall_escalation::EscalationError;
use oncall_jobs::JobError;
use oncall_store::StoreError;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("escalation sweep: {0}")]
    Escalation(#[from] EscalationError),

    #[error("job sweep: {0}")]
    Jobs(#[from] JobError),

    #[error("sweep {name} failed: {message}")]
    Sweep { name: String, message: String },
}
