use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// The lifecycle state of a lab.
///
/// Transitions (see spec §4.F):
///   REQUESTED    → PROVISIONING  (admission / watchdog tick)
///   PROVISIONING → READY         (Provisioner, successful probe)
///   PROVISIONING → FAILED        (Provisioner, timeout/error/rollback)
///   READY        → ENDING        (API stop, TTL expiry, admin)
///   READY        → DEGRADED      (health observer, non-essential failure)
///   DEGRADED     → ENDING
///   ENDING       → FINISHED      (Teardown Worker, success)
///   ENDING       → FAILED        (Teardown Worker, timeout/incomplete)
///
/// No other edges exist. A write to the same value is a no-op (absorbed,
/// not rejected). A write attempted from a terminal state to any other
/// value is a programmer error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabStatus {
    Requested,
    Provisioning,
    Ready,
    Degraded,
    Ending,
    Finished,
    Failed,
}

impl LabStatus {
    /// Terminal states never accept another write (other than the
    /// idempotent same-value case, handled by the caller before this check).
    pub fn is_terminal(&self) -> bool {
        matches!(self, LabStatus::Finished | LabStatus::Failed)
    }

    /// Whether `self -> next` is a legal edge in the DAG above.
    fn is_allowed_transition(&self, next: LabStatus) -> bool {
        use LabStatus::*;
        matches!(
            (self, next),
            (Requested, Provisioning)
                | (Provisioning, Ready)
                | (Provisioning, Failed)
                | (Ready, Ending)
                | (Ready, Degraded)
                | (Degraded, Ending)
                | (Degraded, Failed)
                | (Ending, Finished)
                | (Ending, Failed)
        )
    }

    /// Validate a status write. Returns `Ok(true)` if the write should be
    /// persisted, `Ok(false)` if it's a same-value no-op to silently absorb,
    /// and `Err` if the edge itself is illegal (a programmer error — the
    /// caller should treat this as a bug, not a user-facing failure).
    pub fn validate_transition(&self, next: LabStatus) -> Result<bool, DomainError> {
        if *self == next {
            return Ok(false);
        }
        if self.is_terminal() {
            return Err(DomainError::IllegalTransition {
                from: *self,
                to: next,
            });
        }
        if !self.is_allowed_transition(next) {
            return Err(DomainError::IllegalTransition {
                from: *self,
                to: next,
            });
        }
        Ok(true)
    }
}

impl std::fmt::Display for LabStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LabStatus::Requested => "requested",
            LabStatus::Provisioning => "provisioning",
            LabStatus::Ready => "ready",
            LabStatus::Degraded => "degraded",
            LabStatus::Ending => "ending",
            LabStatus::Finished => "finished",
            LabStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Server-selected backend. Written exactly once at creation, never mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    Compose,
    Microvm,
}

impl std::fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeKind::Compose => write!(f, "compose"),
            RuntimeKind::Microvm => write!(f, "microvm"),
        }
    }
}

/// Server-managed evidence lifecycle state, exposed to clients in place of
/// raw file lists or paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceState {
    #[default]
    Collecting,
    Ready,
    Partial,
    Unavailable,
}

impl EvidenceState {
    /// Invariant 6: READY implies both terminal-log and pcap artifacts were
    /// present at finalization time.
    pub fn from_artifact_presence(has_terminal_logs: bool, has_pcap: bool) -> Self {
        match (has_terminal_logs, has_pcap) {
            (true, true) => EvidenceState::Ready,
            (true, false) | (false, true) => EvidenceState::Partial,
            (false, false) => EvidenceState::Unavailable,
        }
    }
}

impl std::fmt::Display for EvidenceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EvidenceState::Collecting => "collecting",
            EvidenceState::Ready => "ready",
            EvidenceState::Partial => "partial",
            EvidenceState::Unavailable => "unavailable",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceSealStatus {
    #[default]
    None,
    Sealed,
    Failed,
}

impl std::fmt::Display for EvidenceSealStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EvidenceSealStatus::None => "none",
            EvidenceSealStatus::Sealed => "sealed",
            EvidenceSealStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_value_write_is_absorbed_not_rejected() {
        assert_eq!(LabStatus::Ready.validate_transition(LabStatus::Ready), Ok(false));
    }

    #[test]
    fn happy_path_edges_are_allowed() {
        assert_eq!(
            LabStatus::Requested.validate_transition(LabStatus::Provisioning),
            Ok(true)
        );
        assert_eq!(
            LabStatus::Provisioning.validate_transition(LabStatus::Ready),
            Ok(true)
        );
        assert_eq!(LabStatus::Ready.validate_transition(LabStatus::Ending), Ok(true));
        assert_eq!(LabStatus::Ending.validate_transition(LabStatus::Finished), Ok(true));
    }

    #[test]
    fn terminal_state_rejects_further_writes() {
        assert!(LabStatus::Finished.validate_transition(LabStatus::Ending).is_err());
        assert!(LabStatus::Failed.validate_transition(LabStatus::Ready).is_err());
    }

    #[test]
    fn back_edges_other_than_documented_are_rejected() {
        assert!(LabStatus::Ready.validate_transition(LabStatus::Requested).is_err());
        assert!(LabStatus::Ending.validate_transition(LabStatus::Ready).is_err());
    }

    #[test]
    fn evidence_state_requires_both_artifacts_for_ready() {
        assert_eq!(
            EvidenceState::from_artifact_presence(true, true),
            EvidenceState::Ready
        );
        assert_eq!(
            EvidenceState::from_artifact_presence(true, false),
            EvidenceState::Partial
        );
        assert_eq!(
            EvidenceState::from_artifact_presence(false, false),
            EvidenceState::Unavailable
        );
    }
}
