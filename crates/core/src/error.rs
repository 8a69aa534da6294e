use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Unknown {kind} value: {value}")]
    InvalidEnum { kind: &'static str, value: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid job payload: {0}")]
    InvalidPayload(String),

    #[error("{0}")]
    Other(String),
}
