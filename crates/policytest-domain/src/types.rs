use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;
use crate::policy::PolicyDocument;

// ── Identifiers ──────────────────────────────────────────────────────────────

/// Process-unique identifier for a test group or test context.
///
/// The same id names every remote object the owner creates (definition,
/// assignment, resource group), so concurrent runs never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    /// Allocate a fresh id (32 lowercase hex chars, v4 UUID without hyphens).
    pub fn generate() -> Self {
        RunId(Uuid::new_v4().simple().to_string())
    }

    /// Wrap an existing id, e.g. one read back from a resource tag.
    pub fn parse(s: impl Into<String>) -> Result<Self, DomainError> {
        let s = s.into();
        let valid = !s.is_empty()
            && s.len() <= 40
            && s.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
        if !valid {
            return Err(DomainError::InvalidRunId(s));
        }
        Ok(RunId(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `<prefix>-<id>`: the name used for every object owned by this run.
    pub fn resource_name(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.0)
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Handles ──────────────────────────────────────────────────────────────────

/// The disposable scope a test context owns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceGroup {
    pub subscription_id: String,
    pub name: String,
    pub location: String,
}

impl ResourceGroup {
    /// ARM resource id, which is also the policy scope string.
    pub fn id(&self) -> String {
        format!("/subscriptions/{}/resourceGroups/{}", self.subscription_id, self.name)
    }

    /// Id of a child resource, e.g. `("Microsoft.Network/routeTables", "rt-1")`.
    pub fn resource_id(&self, resource_type: &str, name: &str) -> String {
        format!("{}/providers/{}/{}", self.id(), resource_type, name)
    }
}

/// A policy definition registered at subscription scope for the lifetime of
/// a test group. Read-only once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyDefinitionHandle {
    pub name: String,
    pub id: String,
    pub document: PolicyDocument,
}

/// A definition bound to one context's resource group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyAssignmentHandle {
    pub name: String,
    pub id: String,
    /// Exact scope the assignment was created at (never a parent scope).
    pub scope: String,
    pub definition_id: String,
    /// Object id of the system-assigned identity, when the effect needs one.
    pub principal_id: Option<String>,
    /// Subscription-scoped role definition ids granted to `principal_id`.
    #[serde(default)]
    pub granted_roles: Vec<String>,
}

impl PolicyAssignmentHandle {
    pub fn has_identity(&self) -> bool {
        self.principal_id.is_some()
    }
}
