pub mod error;
pub mod evidence;
pub mod gc;
pub mod ingest;
pub mod lifecycle;
pub mod provision;
pub mod teardown;
pub mod watchdog;

pub use error::CoreError;
pub use evidence::{finalize_evidence, RetentionJob, RetentionSummary};
pub use gc::{GcJob, GcSummary};
pub use ingest::{Clock, DedupCache, DedupOutcome, RateLimiter, SystemClock};
pub use lifecycle::{allocate_port, release_port, terminate_lab};
pub use provision::{Provisioner, RecipeSource};
pub use teardown::TeardownWorker;
pub use watchdog::{Watchdog, WatchdogAction, WatchdogReport};
