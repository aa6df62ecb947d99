pub mod error;
pub mod fsops;
pub mod path;
pub mod secrets;

pub use error::HygieneError;
pub use fsops::{normalize_evidence_tree, rmtree_hardened, safe_mkdir};
pub use path::{
    is_safe_relative_path, redact_path, redact_path_under, resolve_under_base, validate_lab_id,
};
pub use secrets::{redact_secrets, truncate};
