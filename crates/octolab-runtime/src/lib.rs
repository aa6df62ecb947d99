pub mod compose;
pub mod doctor;
pub mod error;
pub mod lab_runtime;
pub mod microvm;
pub mod noop;
pub mod ports;
pub mod selector;

pub use compose::ComposeRuntime;
pub use doctor::{assert_ready, run_doctor, DoctorCheck, DoctorReport, Severity};
pub use error::RuntimeError;
pub use lab_runtime::{LabRuntime, LabSecrets, TeardownResult};
pub use microvm::MicrovmRuntime;
pub use noop::NoopRuntime;
pub use ports::PortAllocator;
pub use selector::RuntimeRegistry;
