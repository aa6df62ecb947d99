use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("lab provisioning failed: {0}")]
    ProvisionFailed(String),

    #[error("lab teardown failed: {0}")]
    TeardownFailed(String),

    #[error("port pool exhausted ({port_min}-{port_max})")]
    PortPoolExhausted { port_min: u16, port_max: u16 },

    #[error("compose network pool exhausted ({octolab_networks} octolab networks of {total_networks} total)")]
    NetworkPoolExhausted {
        total_networks: u32,
        octolab_networks: u32,
    },

    #[error("port already in use: {0}")]
    PortAlreadyInUse(u16),

    #[error("compose command '{command}' exited with {exit_code}: {tail}")]
    ComposeCommandError {
        command: String,
        exit_code: i32,
        tail: String,
    },

    #[error("runtime doctor reports fatal condition: {0}")]
    DoctorFatal(String),

    #[error("store error: {0}")]
    Store(#[from] octolab_store::StoreError),

    #[error("hygiene error: {0}")]
    Hygiene(#[from] octolab_hygiene::HygieneError),

    #[error("internal runtime error: {0}")]
    Internal(String),
}
