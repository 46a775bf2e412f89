use std::path::Path;

use policytest_arm::{ArmClient, ArmRequest};
use policytest_config::{load_policy, ConfigError, PolicySource};
use policytest_domain::{PolicyDefinitionHandle, PolicyDocument};
use tracing::{debug, info};

use crate::error::HarnessError;
use crate::retry::{Attempt, RetryError, RetryPolicy};

pub const POLICY_DEFINITIONS_API: &str = "2021-06-01";

pub fn definition_id(subscription_id: &str, name: &str) -> String {
    format!(
        "/subscriptions/{}/providers/Microsoft.Authorization/policyDefinitions/{}",
        subscription_id, name
    )
}

/// Load a group's policy document, reporting a missing template as
/// [`HarnessError::DefinitionNotFound`].
pub fn resolve_document(source: &PolicySource, policies_dir: &Path) -> Result<PolicyDocument, HarnessError> {
    load_policy(source, policies_dir).map_err(|e| match e {
        ConfigError::TemplateNotFound { caller, path } => HarnessError::DefinitionNotFound {
            reference: caller,
            message: format!("expected template at {}", path),
        },
        other => HarnessError::Config(other),
    })
}

/// Create `document` at subscription scope under `name`, then wait until it
/// can be read back.
pub async fn register_definition(
    client: &ArmClient,
    document: &PolicyDocument,
    name: &str,
    retry: &RetryPolicy,
) -> Result<PolicyDefinitionHandle, HarnessError> {
    let id = definition_id(client.subscription_id(), name);
    let document = document.renamed(name, &id);

    info!(definition = %name, "Creating policy definition");
    let resp = client
        .invoke(&ArmRequest::put(&id, POLICY_DEFINITIONS_API, document.as_value().clone()))
        .await?;
    if !resp.is_success() {
        return Err(HarnessError::DefinitionDeployFailed {
            name: name.to_string(),
            status: resp.status,
            message: resp.error_message(),
        });
    }

    // A successful PUT does not guarantee the definition is readable yet.
    retry
        .run("read policy definition", name, |attempt| {
            let id = &id;
            async move {
                let resp = client.invoke(&ArmRequest::get(id, POLICY_DEFINITIONS_API)).await?;
                if resp.is_success() {
                    return Ok(Attempt::Ready(()));
                }
                debug!(definition = %id, attempt, status = resp.status, "Policy definition not readable yet");
                Ok::<_, HarnessError>(Attempt::Pending(format!("status {}", resp.status)))
            }
        })
        .await
        .map_err(|e| match e {
            RetryError::Exhausted(exhausted) => HarnessError::DefinitionPropagationTimeout {
                name: name.to_string(),
                exhausted,
            },
            RetryError::Fatal(e) => e,
        })?;

    info!(definition = %name, "Policy definition registered");
    Ok(PolicyDefinitionHandle { name: name.to_string(), id, document })
}

/// Delete a subscription-scope definition by name. Absence counts as success.
pub async fn delete_definition(client: &ArmClient, name: &str) -> Result<(), HarnessError> {
    info!(definition = %name, "Deleting policy definition");
    let id = definition_id(client.subscription_id(), name);
    let resp = client.invoke(&ArmRequest::delete(id, POLICY_DEFINITIONS_API)).await?;
    if resp.is_not_found() {
        return Ok(());
    }
    resp.require_success(&format!("delete policy definition {}", name))?;
    Ok(())
}
