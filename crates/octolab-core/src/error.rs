use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("lab not found: {0}")]
    NotFound(String),

    #[error("lab {lab_id} is in status {status}, which does not permit this operation")]
    WrongState { lab_id: String, status: String },

    #[error("recipe missing for lab {0}")]
    RecipeMissing(String),

    #[error("provisioning timed out after {0}s")]
    ProvisioningTimeout(u64),

    #[error("teardown left resources behind for lab {0}")]
    TeardownIncomplete(String),

    #[error("store error: {0}")]
    Store(#[from] octolab_store::StoreError),

    #[error("runtime error: {0}")]
    Runtime(#[from] octolab_runtime::RuntimeError),

    #[error("domain error: {0}")]
    Domain(#[from] octolab_domain::DomainError),

    #[error("hygiene error: {0}")]
    Hygiene(#[from] octolab_hygiene::HygieneError),

    #[error("internal error: {0}")]
    Internal(String),
}
