mod error;
mod outcome;
mod params;
mod policy;
mod types;

pub use error::DomainError;
pub use outcome::{ComplianceState, ProvisioningState, RemediationOutcome, RemediationVerdict};
pub use params::{ParameterBag, Region, RegionSettings, RegionalSettings};
pub use policy::{subscription_role_definition_id, EffectClass, PolicyDocument, PolicyEffect};
pub use types::{PolicyAssignmentHandle, PolicyDefinitionHandle, ResourceGroup, RunId};
