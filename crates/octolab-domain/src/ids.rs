use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Server-generated opaque 128-bit lab identifier.
///
/// Never accepted from client input except as an opaque lookup key; the
/// canonical textual form is validated by `octolab_hygiene::validate_lab_id`
/// before it is ever used to build a filesystem path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LabId(pub Uuid);

impl LabId {
    pub fn new(id: Uuid) -> Self {
        LabId(id)
    }

    pub fn generate() -> Self {
        LabId(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl std::fmt::Display for LabId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Back-reference to the owning tenant/user. Never taken from client input
/// at mutation time — always resolved from the authenticated session by the
/// (neighbour) API layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerId(pub Uuid);

impl std::fmt::Display for OwnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque reference to a recipe (what to provision). Treated as an inert
/// identifier by the core — the recipe's content is a neighbour's concern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecipeId(pub Uuid);

impl std::fmt::Display for RecipeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
