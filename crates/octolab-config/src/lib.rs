pub mod error;
pub mod loader;
mod raw;

pub use error::ConfigError;
pub use loader::{OctolabConfig, ReadinessConfig, RuntimeSelector, TeardownWorkerConfig};
