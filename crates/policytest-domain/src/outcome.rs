use serde::{Deserialize, Serialize};

/// Compliance of one resource as reported by the policy engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplianceState {
    /// Not evaluated yet, or the result has not propagated to the state index.
    Unknown,
    Compliant,
    NonCompliant,
}

impl ComplianceState {
    pub fn from_api(s: Option<&str>) -> Self {
        match s.map(|s| s.to_ascii_lowercase()) {
            Some(s) if s == "compliant" => ComplianceState::Compliant,
            Some(s) if s == "noncompliant" => ComplianceState::NonCompliant,
            _ => ComplianceState::Unknown,
        }
    }

    /// `Some(true)` when compliant, `None` while unresolved.
    pub fn resolved(&self) -> Option<bool> {
        match self {
            ComplianceState::Unknown => None,
            ComplianceState::Compliant => Some(true),
            ComplianceState::NonCompliant => Some(false),
        }
    }
}

/// `properties.provisioningState` of a remediation task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProvisioningState {
    Accepted,
    Evaluating,
    Running,
    Succeeded,
    Failed,
    Canceled,
    Other(String),
}

impl ProvisioningState {
    pub fn from_api(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "accepted" => ProvisioningState::Accepted,
            "evaluating" => ProvisioningState::Evaluating,
            "running" => ProvisioningState::Running,
            "succeeded" => ProvisioningState::Succeeded,
            "failed" => ProvisioningState::Failed,
            "canceled" | "cancelled" => ProvisioningState::Canceled,
            _ => ProvisioningState::Other(s.to_string()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProvisioningState::Succeeded | ProvisioningState::Failed | ProvisioningState::Canceled
        )
    }
}

impl std::fmt::Display for ProvisioningState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProvisioningState::Accepted => write!(f, "Accepted"),
            ProvisioningState::Evaluating => write!(f, "Evaluating"),
            ProvisioningState::Running => write!(f, "Running"),
            ProvisioningState::Succeeded => write!(f, "Succeeded"),
            ProvisioningState::Failed => write!(f, "Failed"),
            ProvisioningState::Canceled => write!(f, "Canceled"),
            ProvisioningState::Other(s) => write!(f, "{}", s),
        }
    }
}

/// Terminal result of one remediation task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemediationOutcome {
    pub provisioning_state: ProvisioningState,
    pub deployment_count: u32,
}

/// Per-attempt classification of a finished remediation task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemediationVerdict {
    SucceededWithDeployment,
    SucceededNoDeployment,
    Failed,
}

impl RemediationOutcome {
    pub fn verdict(&self) -> RemediationVerdict {
        match (&self.provisioning_state, self.deployment_count) {
            (ProvisioningState::Succeeded, 0) => RemediationVerdict::SucceededNoDeployment,
            (ProvisioningState::Succeeded, _) => RemediationVerdict::SucceededWithDeployment,
            _ => RemediationVerdict::Failed,
        }
    }

    /// Whether this outcome ends the remediation protocol successfully.
    pub fn is_success(&self, require_deployment: bool) -> bool {
        match self.verdict() {
            RemediationVerdict::SucceededWithDeployment => true,
            RemediationVerdict::SucceededNoDeployment => !require_deployment,
            RemediationVerdict::Failed => false,
        }
    }
}

impl std::fmt::Display for RemediationOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} with {} deployment(s)", self.provisioning_state, self.deployment_count)
    }
}
