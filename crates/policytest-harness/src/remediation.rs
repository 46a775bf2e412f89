use policytest_arm::{ArmClient, ArmRequest};
use policytest_domain::{PolicyAssignmentHandle, ProvisioningState, RemediationOutcome, RemediationVerdict};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::error::HarnessError;
use crate::retry::{Attempt, RetryError, RetryPolicy};

pub const REMEDIATIONS_API: &str = "2021-10-01";

#[derive(Debug, Clone)]
pub struct RemediationRequest<'a> {
    pub resource_id: &'a str,
    pub assignment: &'a PolicyAssignmentHandle,
    /// Only count a remediation as successful if it deployed something.
    pub require_deployment: bool,
}

pub fn remediation_path(resource_id: &str, name: &str) -> String {
    format!("{}/providers/Microsoft.PolicyInsights/remediations/{}", resource_id, name)
}

fn outcome_of(body: &Value) -> RemediationOutcome {
    let props = &body["properties"];
    RemediationOutcome {
        provisioning_state: ProvisioningState::from_api(props["provisioningState"].as_str().unwrap_or_default()),
        deployment_count: props["deploymentStatus"]["totalDeployments"]
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(0),
    }
}

/// Remediate one resource and verify the outcome.
///
/// Each attempt submits a new remediation task and polls it on `job` until it
/// reaches a terminal state. An attempt that failed, or that succeeded with
/// no deployment when one is required, is retried on `attempts`; a remediation
/// can race writes to the resource that have not settled yet.
pub async fn remediate(
    client: &ArmClient,
    req: &RemediationRequest<'_>,
    attempts: &RetryPolicy,
    job: &RetryPolicy,
) -> Result<RemediationOutcome, HarnessError> {
    let failed = |attempts: u32, reason: String| HarnessError::RemediationFailed {
        resource: req.resource_id.to_string(),
        assignment: req.assignment.name.clone(),
        attempts,
        reason,
    };

    attempts
        .run("remediation", req.resource_id, |attempt| {
            let failed = &failed;
            async move {
                let name = format!("{}-r{}", req.assignment.name, attempt);
                let path = remediation_path(req.resource_id, &name);
                let body = json!({
                    "properties": {
                        "policyAssignmentId": req.assignment.id,
                        "resourceDiscoveryMode": "ExistingNonCompliant",
                    }
                });

                info!(resource = %req.resource_id, remediation = %name, attempt, "Remediation submitted");
                let resp = client.invoke(&ArmRequest::put(&path, REMEDIATIONS_API, body)).await?;
                if !resp.is_success() {
                    return Err(failed(attempt, format!("submission rejected: {}", resp.error_message())));
                }

                let Some(outcome) = await_job(client, &path, &name, job).await? else {
                    return Ok(Attempt::Pending(format!("remediation {} did not finish", name)));
                };

                let verdict = outcome.verdict();
                info!(remediation = %name, outcome = %outcome, verdict = ?verdict, "Remediation finished");
                if outcome.is_success(req.require_deployment) {
                    return Ok(Attempt::Ready(outcome));
                }
                let observed = match verdict {
                    RemediationVerdict::SucceededNoDeployment => "remediation succeeded but never deployed".to_string(),
                    _ => format!("remediation job failed ({})", outcome),
                };
                warn!(remediation = %name, attempt, "{}", observed);
                Ok(Attempt::Pending(observed))
            }
        })
        .await
        .map_err(|e| match e {
            RetryError::Exhausted(exhausted) => failed(exhausted.attempts, exhausted.last_outcome),
            RetryError::Fatal(e) => e,
        })
}

/// Poll a remediation task until terminal. `None` when it is still running
/// after the job budget.
async fn await_job(
    client: &ArmClient,
    path: &str,
    name: &str,
    job: &RetryPolicy,
) -> Result<Option<RemediationOutcome>, HarnessError> {
    let polled = job
        .run("remediation job", name, |attempt| async move {
            let resp = client.invoke(&ArmRequest::get(path, REMEDIATIONS_API)).await?;
            if resp.status == 404 {
                debug!(remediation = %name, attempt, "Remediation not readable yet");
                return Ok::<_, HarnessError>(Attempt::Pending("remediation not readable yet".to_string()));
            }
            let body = resp.require_success(&format!("read remediation {}", name))?;
            let outcome = outcome_of(&body);
            debug!(remediation = %name, attempt, state = %outcome.provisioning_state, "Remediation awaiting");
            Ok::<_, HarnessError>(if outcome.provisioning_state.is_terminal() {
                Attempt::Ready(outcome)
            } else {
                Attempt::Pending(outcome.provisioning_state.to_string())
            })
        })
        .await;
    match polled {
        Ok(outcome) => Ok(Some(outcome)),
        Err(RetryError::Exhausted(exhausted)) => {
            warn!(remediation = %name, polls = exhausted.attempts, state = %exhausted.last_outcome, "Remediation still running");
            Ok(None)
        }
        Err(RetryError::Fatal(e)) => Err(e),
    }
}
