use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::ids::{LabId, OwnerId, RecipeId};
use crate::status::{EvidenceSealStatus, EvidenceState, LabStatus, RuntimeKind};

/// Opaque backend-specific runtime metadata. Invariant 7: only server-safe
/// values — short identifiers, basenames, integers. Never a full path,
/// token, password, or database URL.
pub type RuntimeMeta = HashMap<String, Value>;

/// Opaque client-supplied intent blob. Stored verbatim, never interpreted
/// by the core.
pub type RequestedIntent = Value;

/// The central entity. One row per provisioned lab.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lab {
    pub id: LabId,
    pub owner_id: OwnerId,
    pub recipe_id: RecipeId,
    pub status: LabStatus,
    pub runtime: RuntimeKind,
    pub runtime_meta: RuntimeMeta,
    pub requested_intent: RequestedIntent,
    pub novnc_host_port: Option<u16>,
    pub expires_at: Option<DateTime<Utc>>,
    pub connection_url: Option<String>,
    pub evidence_state: EvidenceState,
    pub evidence_finalized_at: Option<DateTime<Utc>>,
    pub evidence_purged_at: Option<DateTime<Utc>>,
    pub evidence_sealed_at: Option<DateTime<Utc>>,
    pub evidence_expires_at: Option<DateTime<Utc>>,
    pub evidence_manifest_sha256: Option<String>,
    pub evidence_seal_status: EvidenceSealStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Lab {
    /// Construct a freshly-requested lab row. `status` starts at
    /// `Requested`; the API admission path is responsible for the
    /// `Requested -> Provisioning` tick.
    pub fn new_requested(
        owner_id: OwnerId,
        recipe_id: RecipeId,
        runtime: RuntimeKind,
        requested_intent: RequestedIntent,
        now: DateTime<Utc>,
    ) -> Self {
        Lab {
            id: LabId::generate(),
            owner_id,
            recipe_id,
            status: LabStatus::Requested,
            runtime,
            runtime_meta: HashMap::new(),
            requested_intent,
            novnc_host_port: None,
            expires_at: None,
            connection_url: None,
            evidence_state: EvidenceState::Collecting,
            evidence_finalized_at: None,
            evidence_purged_at: None,
            evidence_sealed_at: None,
            evidence_expires_at: None,
            evidence_manifest_sha256: None,
            evidence_seal_status: EvidenceSealStatus::None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    /// Invariant 2: `finished_at` is null iff status is not terminal.
    pub fn finished_at_consistent(&self) -> bool {
        self.status.is_terminal() == self.finished_at.is_some()
    }
}

/// Logical ownership of a host port by a lab. Conceptually redundant with
/// `Lab::novnc_host_port`; the allocator treats `(lab_id, port)` as truth
/// and writes both representations in the same transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortReservation {
    pub lab_id: LabId,
    pub port: u16,
}

/// One append-only evidence event row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceEvent {
    pub event_hash: String,
    pub lab_id: LabId,
    pub event_type: String,
    pub container_name: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

impl EvidenceEvent {
    /// The event hash the caller should use for the idempotent
    /// upsert-ignore-on-conflict, derived the way the ingest endpoint's
    /// dedup cache keys are derived: sha256 of "kind + timestamp + subject +
    /// key fields". The core does not compute this itself for storage —
    /// see `octolab_core::ingest` — this accessor exists for tests and for
    /// display.
    pub fn hash_ref(&self) -> &str {
        &self.event_hash
    }
}

/// A single run of the provisioning/teardown subprocess pipeline: a
/// structured adapter record for a subprocess invocation, used by
/// diagnostics and status reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubprocessRun {
    pub id: Uuid,
    pub lab_id: LabId,
    pub operation: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub log: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_requested_lab_has_null_finished_at() {
        let lab = Lab::new_requested(
            OwnerId(Uuid::new_v4()),
            RecipeId(Uuid::new_v4()),
            RuntimeKind::Compose,
            Value::Null,
            Utc::now(),
        );
        assert_eq!(lab.status, LabStatus::Requested);
        assert!(lab.finished_at.is_none());
        assert!(lab.finished_at_consistent());
    }
}
