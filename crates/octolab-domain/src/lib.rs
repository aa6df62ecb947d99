pub mod error;
pub mod ids;
pub mod status;
pub mod types;

pub use error::DomainError;
pub use ids::{LabId, OwnerId, RecipeId};
pub use status::{EvidenceSealStatus, EvidenceState, LabStatus, RuntimeKind};
pub use types::{EvidenceEvent, Lab, PortReservation, RequestedIntent, RuntimeMeta, SubprocessRun};
