use policytest_arm::{ArmClient, ArmError, ArmRequest};
use policytest_domain::{ComplianceState, PolicyAssignmentHandle};
use tracing::{debug, info};

use crate::error::HarnessError;
use crate::retry::{Attempt, RetryError, RetryPolicy};

pub const POLICY_INSIGHTS_API: &str = "2019-10-01";

/// Force a compliance evaluation of `scope` and wait for it to finish.
///
/// A scan that reports failure is retried on `retry`; exhaustion is
/// [`HarnessError::ScanFailed`].
pub async fn trigger_scan(client: &ArmClient, scope: &str, retry: &RetryPolicy) -> Result<(), HarnessError> {
    let req = ArmRequest::post(
        format!("{}/providers/Microsoft.PolicyInsights/policyStates/latest/triggerEvaluation", scope),
        POLICY_INSIGHTS_API,
    );
    info!(scope = %scope, "Triggering compliance scan");
    retry
        .run("compliance scan", scope, |attempt| {
            let req = &req;
            async move {
                match client.invoke(req).await {
                    Ok(resp) if resp.is_success() => Ok(Attempt::Ready(())),
                    Ok(resp) => {
                        debug!(scope = %scope, attempt, status = resp.status, "Compliance scan failed");
                        Ok(Attempt::Pending(format!("status {}: {}", resp.status, resp.error_message())))
                    }
                    // A scan that outlives the poll budget is another transient failure.
                    Err(e @ ArmError::OperationTimeout { .. }) => Ok(Attempt::Pending(e.to_string())),
                    Err(e) => Err(HarnessError::from(e)),
                }
            }
        })
        .await
        .map_err(|e| match e {
            RetryError::Exhausted(exhausted) => HarnessError::ScanFailed { scope: scope.to_string(), exhausted },
            RetryError::Fatal(e) => e,
        })?;
    info!(scope = %scope, "Compliance scan complete");
    Ok(())
}

/// One read of the latest compliance state of `resource_id` under `assignment`.
pub async fn latest_state(
    client: &ArmClient,
    resource_id: &str,
    assignment: &PolicyAssignmentHandle,
) -> Result<ComplianceState, HarnessError> {
    let filter = format!(
        "resourceId eq '{}' and policyAssignmentName eq '{}'",
        resource_id, assignment.name
    );
    let req = ArmRequest::post(
        format!("{}/providers/Microsoft.PolicyInsights/policyStates/latest/queryResults", assignment.scope),
        POLICY_INSIGHTS_API,
    )
    .query("$filter", filter);
    let body = client
        .invoke(&req)
        .await?
        .require_success(&format!("query compliance of {}", resource_id))?;

    // The index keys resources case-insensitively and may echo them back in a different case.
    let state = body["value"]
        .as_array()
        .and_then(|rows| {
            rows.iter().find(|r| {
                r["resourceId"]
                    .as_str()
                    .is_some_and(|id| id.eq_ignore_ascii_case(resource_id))
            })
        })
        .and_then(|r| r["complianceState"].as_str());
    Ok(ComplianceState::from_api(state))
}

/// Wait until the compliance state of `resource_id` resolves and return
/// whether it is compliant.
///
/// An unresolved state means the evaluation has not propagated yet and is
/// retried on `retry`; exhaustion is [`HarnessError::CompliancePropagationTimeout`].
pub async fn query_state(
    client: &ArmClient,
    resource_id: &str,
    assignment: &PolicyAssignmentHandle,
    retry: &RetryPolicy,
) -> Result<bool, HarnessError> {
    let compliant = retry
        .run("compliance state", resource_id, |attempt| async move {
            let state = latest_state(client, resource_id, assignment).await?;
            debug!(resource = %resource_id, attempt, state = ?state, "Compliance state");
            Ok::<_, HarnessError>(match state.resolved() {
                Some(compliant) => Attempt::Ready(compliant),
                None => Attempt::Pending("compliance state not yet available".into()),
            })
        })
        .await
        .map_err(|e| match e {
            RetryError::Exhausted(exhausted) => HarnessError::CompliancePropagationTimeout {
                resource: resource_id.to_string(),
                assignment: assignment.name.clone(),
                exhausted,
            },
            RetryError::Fatal(e) => e,
        })?;
    info!(resource = %resource_id, compliant, "Compliance state resolved");
    Ok(compliant)
}
