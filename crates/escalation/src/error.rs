use thiserror::Error;
use uuid::Uuid;

use oncall_core::CoreError;
use oncall_store::StoreError;

#[derive(Debug, Error)]
pub enum EscalationError {
    #[error("incident {0} not found")]
    IncidentNotFound(Uuid),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid payload: {0}")]
    Payload(#[from] CoreError),
}

impl EscalationError {
    /// Transient failures leave the incident for the next sweep; anything
    /// else ends its escalation.
    pub fn is_transient(&self) -> bool {
        matches!(self, EscalationError::Store(e) if e.is_transient())
    }
}
