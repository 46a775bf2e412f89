use thiserror::Error;

use crate::retry::RetryExhausted;

/// One teardown step that did not complete; the resource it names may have leaked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownFailure {
    pub step: &'static str,
    pub resource: String,
    pub message: String,
}

impl std::fmt::Display for TeardownFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}: {}", self.step, self.resource, self.message)
    }
}

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("policy definition not found for {reference}: {message}")]
    DefinitionNotFound { reference: String, message: String },

    #[error("policy definition '{name}' rejected (status {status}): {message}")]
    DefinitionDeployFailed { name: String, status: u16, message: String },

    #[error("policy definition '{name}' never became readable: {exhausted}")]
    DefinitionPropagationTimeout { name: String, exhausted: RetryExhausted },

    #[error("policy assignment '{assignment}' at {scope} failed: {message}")]
    AssignmentFailed { scope: String, assignment: String, message: String },

    #[error("granting role {role} to identity {principal} at {scope} failed: {message}")]
    RoleAssignmentFailed { scope: String, role: String, principal: String, message: String },

    #[error("identity {principal} never replicated for role {role} at {scope}: {exhausted}")]
    RolePropagationTimeout { scope: String, role: String, principal: String, exhausted: RetryExhausted },

    #[error("compliance scan of {scope} failed: {exhausted}")]
    ScanFailed { scope: String, exhausted: RetryExhausted },

    #[error("compliance state of {resource} under '{assignment}' never resolved: {exhausted}")]
    CompliancePropagationTimeout { resource: String, assignment: String, exhausted: RetryExhausted },

    #[error("remediation of {resource} under '{assignment}' failed after {attempts} attempt(s): {reason}")]
    RemediationFailed { resource: String, assignment: String, attempts: u32, reason: String },

    #[error("test context {context} is not usable while {phase}")]
    ContextNotReady { context: String, phase: String },

    #[error("teardown of {context} left resources behind: {}", list_failures(.failures))]
    Teardown { context: String, failures: Vec<TeardownFailure> },

    #[error("cancelled")]
    Cancelled,

    #[error("config error: {0}")]
    Config(#[from] policytest_config::ConfigError),

    #[error("policy error: {0}")]
    Domain(#[from] policytest_domain::DomainError),

    #[error("management API error: {0}")]
    Arm(#[from] policytest_arm::ArmError),
}

impl HarnessError {
    /// Teardown errors are reported apart from test failures.
    pub fn is_teardown(&self) -> bool {
        matches!(self, HarnessError::Teardown { .. })
    }
}

fn list_failures(failures: &[TeardownFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
