use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use policytest_arm::ArmClient;
use policytest_config::{HarnessConfig, RetryBudget, RetryConfig};
use policytest_domain::{
    ParameterBag, PolicyAssignmentHandle, PolicyDefinitionHandle, Region, RemediationOutcome, ResourceGroup, RunId,
};
use tokio::sync::Semaphore;
use tracing::{error, info};

use crate::assignment::{assign_policy, find_assignment, remove_assignment, AssignmentRequest};
use crate::compliance::{query_state, trigger_scan};
use crate::error::{HarnessError, TeardownFailure};
use crate::remediation::{remediate, RemediationRequest};
use crate::resources::{create_resource_group, delete_resource_group, run_tags};
use crate::retry::RetryPolicy;

/// Shared, read-only dependencies of every test group and context.
#[derive(Clone)]
pub struct Harness {
    pub client: Arc<ArmClient>,
    pub config: Arc<HarnessConfig>,
    /// Bounds how many scenarios are in flight across all groups.
    pub(crate) slots: Arc<Semaphore>,
}

impl Harness {
    pub fn new(client: Arc<ArmClient>, config: HarnessConfig) -> Self {
        let slots = Arc::new(Semaphore::new(config.concurrency));
        Self { client, config: Arc::new(config), slots }
    }

    /// Retry policy for one budget, capped by the configured ceiling.
    pub fn retry(&self, pick: fn(&RetryConfig) -> RetryBudget) -> RetryPolicy {
        RetryPolicy::new(pick(&self.config.retry), self.config.retry.ceiling)
    }

    pub fn subscription_id(&self) -> &str {
        self.client.subscription_id()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Created,
    SettingUp,
    Ready,
    TearingDown,
    TornDown,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Created => "created",
            Phase::SettingUp => "setting up",
            Phase::Ready => "ready",
            Phase::TearingDown => "tearing down",
            Phase::TornDown => "torn down",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug)]
struct State {
    phase: Phase,
    /// Set as soon as creation is requested, so a half-created group is still deleted.
    resource_group: Option<ResourceGroup>,
    assignment_requested: bool,
    assignment: Option<PolicyAssignmentHandle>,
}

/// One scenario's disposable environment: a resource group with the group's
/// definition assigned to it.
///
/// Usable between a successful [`TestContext::setup`] and the start of
/// [`TestContext::teardown`]; accessors return
/// [`HarnessError::ContextNotReady`] outside that window.
pub struct TestContext {
    harness: Harness,
    id: RunId,
    definition: Arc<PolicyDefinitionHandle>,
    parameters: ParameterBag,
    location: Region,
    state: Mutex<State>,
}

impl TestContext {
    pub fn new(harness: Harness, definition: Arc<PolicyDefinitionHandle>, parameters: ParameterBag) -> Self {
        let location = harness.config.location.clone();
        Self {
            harness,
            id: RunId::generate(),
            definition,
            parameters,
            location,
            state: Mutex::new(State {
                phase: Phase::Created,
                resource_group: None,
                assignment_requested: false,
                assignment: None,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // The lock is never held across an await or user code.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn id(&self) -> &RunId {
        &self.id
    }

    pub fn phase(&self) -> Phase {
        self.state().phase
    }

    /// Name shared by the resource group and the assignment.
    pub fn resource_name(&self) -> String {
        self.id.resource_name(&self.harness.config.name_prefix)
    }

    pub fn client(&self) -> &ArmClient {
        &self.harness.client
    }

    pub fn harness(&self) -> &Harness {
        &self.harness
    }

    pub fn definition(&self) -> &PolicyDefinitionHandle {
        &self.definition
    }

    pub fn parameters(&self) -> &ParameterBag {
        &self.parameters
    }

    pub fn location(&self) -> &Region {
        &self.location
    }

    fn ready<T>(&self, f: impl FnOnce(&State) -> Option<T>) -> Result<T, HarnessError> {
        let state = self.state();
        let not_ready = || HarnessError::ContextNotReady {
            context: self.id.to_string(),
            phase: state.phase.to_string(),
        };
        if state.phase != Phase::Ready {
            return Err(not_ready());
        }
        f(&state).ok_or_else(not_ready)
    }

    pub fn resource_group(&self) -> Result<ResourceGroup, HarnessError> {
        self.ready(|s| s.resource_group.clone())
    }

    pub fn assignment(&self) -> Result<PolicyAssignmentHandle, HarnessError> {
        self.ready(|s| s.assignment.clone())
    }

    /// Id of a resource inside this context's resource group.
    pub fn resource_id(&self, resource_type: &str, name: &str) -> Result<String, HarnessError> {
        Ok(self.resource_group()?.resource_id(resource_type, name))
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Create the resource group and assign the definition to it.
    ///
    /// On error the context may hold partially created resources;
    /// [`TestContext::teardown`] must still be called.
    pub async fn setup(&self) -> Result<(), HarnessError> {
        let rg = {
            let mut state = self.state();
            if state.phase != Phase::Created {
                return Err(HarnessError::ContextNotReady {
                    context: self.id.to_string(),
                    phase: state.phase.to_string(),
                });
            }
            state.phase = Phase::SettingUp;
            let rg = ResourceGroup {
                subscription_id: self.harness.subscription_id().to_string(),
                name: self.resource_name(),
                location: self.location.to_string(),
            };
            state.resource_group = Some(rg.clone());
            rg
        };

        info!(context = %self.id, resource_group = %rg.name, "Setting up test context");
        create_resource_group(self.client(), &rg, run_tags(&self.id, Utc::now()))
            .await?
            .require_success(&format!("create resource group {}", rg.name))?;

        let scope = rg.id();
        let name = self.resource_name();
        self.state().assignment_requested = true;
        let handle = assign_policy(
            self.client(),
            &AssignmentRequest {
                name: &name,
                scope: &scope,
                definition: &self.definition,
                parameters: &self.parameters,
                location: &self.location,
            },
            &self.harness.retry(|r| r.role_propagation),
        )
        .await?;

        let mut state = self.state();
        state.assignment = Some(handle);
        state.phase = Phase::Ready;
        info!(context = %self.id, "Test context ready");
        Ok(())
    }

    /// Remove the assignment, then request deletion of the resource group.
    ///
    /// Runs whatever setup got as far as creating. The group deletion is
    /// attempted even when removing the assignment failed; every failed step
    /// is reported in one [`HarnessError::Teardown`]. Calling it again after it
    /// finished is a no-op.
    pub async fn teardown(&self) -> Result<(), HarnessError> {
        let (rg, assignment_requested) = {
            let mut state = self.state();
            if matches!(state.phase, Phase::TearingDown | Phase::TornDown) {
                return Ok(());
            }
            state.phase = Phase::TearingDown;
            (state.resource_group.clone(), state.assignment_requested)
        };

        let mut failures = Vec::new();
        if let Some(rg) = &rg {
            info!(context = %self.id, resource_group = %rg.name, "Tearing down test context");
            if assignment_requested {
                let name = self.resource_name();
                if let Err(e) = remove_assignment(self.client(), &rg.id(), &name).await {
                    error!(context = %self.id, assignment = %name, error = %e, "Failed to remove policy assignment");
                    failures.push(TeardownFailure {
                        step: "remove policy assignment",
                        resource: name,
                        message: e.to_string(),
                    });
                }
            }
            if let Err(e) = delete_resource_group(self.client(), &rg.subscription_id, &rg.name).await {
                error!(context = %self.id, resource_group = %rg.name, error = %e, "Failed to delete resource group");
                failures.push(TeardownFailure {
                    step: "delete resource group",
                    resource: rg.name.clone(),
                    message: e.to_string(),
                });
            }
        }

        self.state().phase = Phase::TornDown;
        if failures.is_empty() {
            Ok(())
        } else {
            Err(HarnessError::Teardown { context: self.id.to_string(), failures })
        }
    }

    // ── Coordinators ──────────────────────────────────────────────────────────

    /// Trigger a compliance scan of this context's resource group.
    pub async fn trigger_scan(&self) -> Result<(), HarnessError> {
        let scope = self.resource_group()?.id();
        trigger_scan(self.client(), &scope, &self.harness.retry(|r| r.compliance_scan)).await
    }

    /// Whether `resource_id` is compliant with this context's assignment.
    pub async fn query_compliance(&self, resource_id: &str) -> Result<bool, HarnessError> {
        let assignment = self.assignment()?;
        query_state(self.client(), resource_id, &assignment, &self.harness.retry(|r| r.compliance_state)).await
    }

    pub async fn remediate(&self, resource_id: &str, require_deployment: bool) -> Result<RemediationOutcome, HarnessError> {
        let assignment = self.assignment()?;
        remediate(
            self.client(),
            &RemediationRequest { resource_id, assignment: &assignment, require_deployment },
            &self.harness.retry(|r| r.remediation),
            &self.harness.retry(|r| r.remediation_job),
        )
        .await
    }

    /// Read this context's assignment back from the service.
    pub async fn lookup_assignment(&self) -> Result<Option<PolicyAssignmentHandle>, HarnessError> {
        let scope = self.resource_group()?.id();
        find_assignment(self.client(), &scope, &self.definition.name).await
    }
}
