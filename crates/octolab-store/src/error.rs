use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("lab not found: {0}")]
    LabNotFound(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("port {0} is already reserved")]
    PortConflict(u16),

    #[error("internal store error: {0}")]
    Internal(String),
}
