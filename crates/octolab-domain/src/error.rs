use thiserror::Error;

use crate::status::LabStatus;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    #[error("invalid lab id: {0}")]
    InvalidLabId(String),

    #[error("illegal status transition: {from} -> {to}")]
    IllegalTransition { from: LabStatus, to: LabStatus },

    #[error("lab is in status {status}, operation requires {expected}")]
    WrongState { status: LabStatus, expected: String },

    #[error("runtime_meta contains a forbidden value: {0}")]
    UnsafeRuntimeMeta(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
