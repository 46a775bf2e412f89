use policytest_arm::{ArmClient, ArmRequest};
use policytest_domain::{
    subscription_role_definition_id, ParameterBag, PolicyAssignmentHandle, PolicyDefinitionHandle, Region,
};
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::HarnessError;
use crate::retry::{Attempt, RetryError, RetryPolicy};

pub const POLICY_ASSIGNMENTS_API: &str = "2022-06-01";
pub const ROLE_ASSIGNMENTS_API: &str = "2022-04-01";

/// Everything needed to bind a definition to one scope.
#[derive(Debug, Clone)]
pub struct AssignmentRequest<'a> {
    pub name: &'a str,
    pub scope: &'a str,
    pub definition: &'a PolicyDefinitionHandle,
    pub parameters: &'a ParameterBag,
    /// Location of the system-assigned identity, when one is needed.
    pub location: &'a Region,
}

pub fn assignment_path(scope: &str, name: &str) -> String {
    format!("{}/providers/Microsoft.Authorization/policyAssignments/{}", scope, name)
}

/// Assign a policy definition to a scope.
///
/// When the effect needs a managed identity, the assignment is created with a
/// system-assigned identity and every role the definition lists is granted to
/// it. New principals take a while to replicate, so `PrincipalNotFound` is
/// retried on `role_retry`; any other role failure is fatal.
///
/// The session is refreshed once everything is in place, so later calls see
/// the new assignment.
pub async fn assign_policy(
    client: &ArmClient,
    req: &AssignmentRequest<'_>,
    role_retry: &RetryPolicy,
) -> Result<PolicyAssignmentHandle, HarnessError> {
    let effect = req.definition.document.effect(req.parameters)?;
    let needs_identity = effect.requires_identity();
    info!(
        assignment = %req.name,
        scope = %req.scope,
        effect = %effect,
        identity = needs_identity,
        "Creating policy assignment"
    );

    let mut body = json!({
        "properties": {
            "displayName": req.name,
            "policyDefinitionId": req.definition.id,
            "parameters": req.parameters.to_arm(),
        }
    });
    if needs_identity {
        body["location"] = json!(req.location.as_str());
        body["identity"] = json!({ "type": "SystemAssigned" });
    }

    let resp = client
        .invoke(&ArmRequest::put(assignment_path(req.scope, req.name), POLICY_ASSIGNMENTS_API, body))
        .await?;
    if !resp.is_success() {
        return Err(assignment_failed(req, format!("status {}: {}", resp.status, resp.error_message())));
    }

    let created = resp.body;
    let principal_id = created["identity"]["principalId"].as_str().map(String::from);
    let mut handle = PolicyAssignmentHandle {
        name: req.name.to_string(),
        id: created["id"]
            .as_str()
            .map(String::from)
            .unwrap_or_else(|| assignment_path(req.scope, req.name)),
        scope: req.scope.to_string(),
        definition_id: req.definition.id.clone(),
        principal_id: principal_id.clone(),
        granted_roles: Vec::new(),
    };

    if needs_identity {
        let Some(principal) = principal_id else {
            return Err(assignment_failed(req, "no system-assigned identity in response".into()));
        };
        for role in req.definition.document.role_definition_ids() {
            let role = subscription_role_definition_id(client.subscription_id(), &role);
            grant_role(client, req.scope, &principal, &role, role_retry).await?;
            handle.granted_roles.push(role);
        }
    }

    client.session().refresh().await?;
    info!(assignment = %req.name, roles = handle.granted_roles.len(), "Policy assignment ready");
    Ok(handle)
}

fn assignment_failed(req: &AssignmentRequest<'_>, message: String) -> HarnessError {
    HarnessError::AssignmentFailed {
        scope: req.scope.to_string(),
        assignment: req.name.to_string(),
        message,
    }
}

/// Grant `role` at `scope` to `principal`.
pub async fn grant_role(
    client: &ArmClient,
    scope: &str,
    principal: &str,
    role: &str,
    retry: &RetryPolicy,
) -> Result<(), HarnessError> {
    let path = format!(
        "{}/providers/Microsoft.Authorization/roleAssignments/{}",
        scope,
        Uuid::new_v4()
    );
    let body = json!({
        "properties": {
            "roleDefinitionId": role,
            "principalId": principal,
            "principalType": "ServicePrincipal",
        }
    });
    let req = ArmRequest::put(path, ROLE_ASSIGNMENTS_API, body);
    let role_failed = |message: String| HarnessError::RoleAssignmentFailed {
        scope: scope.to_string(),
        role: role.to_string(),
        principal: principal.to_string(),
        message,
    };

    info!(scope = %scope, role = %role, principal = %principal, "Granting role to assignment identity");
    retry
        .run("grant role", role, |attempt| {
            let req = &req;
            let role_failed = &role_failed;
            async move {
                let resp = client.invoke(req).await?;
                if resp.is_success() {
                    return Ok(Attempt::Ready(()));
                }
                match resp.error_code() {
                    Some("RoleAssignmentExists") => {
                        debug!(role = %role, "Role already assigned");
                        Ok(Attempt::Ready(()))
                    }
                    Some("PrincipalNotFound") => {
                        debug!(principal = %principal, attempt, "Principal not replicated yet");
                        Ok(Attempt::Pending(resp.error_message()))
                    }
                    _ => Err(role_failed(format!("status {}: {}", resp.status, resp.error_message()))),
                }
            }
        })
        .await
        .map_err(|e| match e {
            RetryError::Exhausted(exhausted) => HarnessError::RolePropagationTimeout {
                scope: scope.to_string(),
                role: role.to_string(),
                principal: principal.to_string(),
                exhausted,
            },
            RetryError::Fatal(e) => e,
        })
}

/// Pick "the" assignment of a definition at a scope: the first whose
/// definition id ends with `definition_name` and whose scope is exactly
/// `scope`. Assignments inherited from parent scopes never match.
pub fn select_assignment<'a>(assignments: &'a [Value], definition_name: &str, scope: &str) -> Option<&'a Value> {
    let suffix = format!("/{}", definition_name.to_ascii_lowercase());
    assignments.iter().find(|a| {
        let props = &a["properties"];
        let definition_matches = props["policyDefinitionId"]
            .as_str()
            .is_some_and(|id| id.to_ascii_lowercase().ends_with(&suffix));
        let scope_matches = props["scope"]
            .as_str()
            .is_some_and(|s| s.eq_ignore_ascii_case(scope));
        definition_matches && scope_matches
    })
}

/// Look up the assignment of `definition_name` made directly at `scope`.
pub async fn find_assignment(
    client: &ArmClient,
    scope: &str,
    definition_name: &str,
) -> Result<Option<PolicyAssignmentHandle>, HarnessError> {
    let list = ArmRequest::get(
        format!("{}/providers/Microsoft.Authorization/policyAssignments", scope),
        POLICY_ASSIGNMENTS_API,
    );
    let assignments = client.list(&list).await?;
    Ok(select_assignment(&assignments, definition_name, scope).map(|a| PolicyAssignmentHandle {
        name: a["name"].as_str().unwrap_or_default().to_string(),
        id: a["id"].as_str().unwrap_or_default().to_string(),
        scope: a["properties"]["scope"].as_str().unwrap_or(scope).to_string(),
        definition_id: a["properties"]["policyDefinitionId"].as_str().unwrap_or_default().to_string(),
        principal_id: a["identity"]["principalId"].as_str().map(String::from),
        granted_roles: Vec::new(),
    }))
}

/// Delete an assignment by name. Absence counts as success.
pub async fn remove_assignment(client: &ArmClient, scope: &str, name: &str) -> Result<(), HarnessError> {
    info!(assignment = %name, scope = %scope, "Removing policy assignment");
    let resp = client
        .invoke(&ArmRequest::delete(assignment_path(scope, name), POLICY_ASSIGNMENTS_API))
        .await?;
    if resp.is_not_found() {
        warn!(assignment = %name, "Policy assignment was already gone");
        return Ok(());
    }
    resp.require_success(&format!("delete policy assignment {}", name))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use policytest_arm::{BaseUrls, LroPolicy, Session};
    use policytest_config::RetryBudget;
    use policytest_domain::PolicyDocument;
    use wiremock::matchers::{body_partial_json, method, path, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SCOPE: &str = "/subscriptions/sub-1/resourceGroups/policytest-c1";
    const ROLE_GUID: &str = "4d97b98b-1d4f-4787-a291-c67834d212e7";

    fn client(server: &MockServer) -> ArmClient {
        let session = Arc::new(Session::static_token("tenant", "sub-1", "tok"));
        ArmClient::with_base(session, BaseUrls { management: server.uri() }, LroPolicy { delays: vec![0], max_polls: 3 })
    }

    fn definition(effect: &str) -> PolicyDefinitionHandle {
        let document = PolicyDocument::from_value(json!({
            "name": "policytest-g1",
            "properties": {
                "parameters": { "effect": { "type": "String", "defaultValue": effect } },
                "policyRule": {
                    "if": { "field": "type", "equals": "Microsoft.Network/routeTables" },
                    "then": {
                        "effect": "[parameters('effect')]",
                        "details": {
                            "roleDefinitionIds": [
                                format!("/providers/Microsoft.Authorization/roleDefinitions/{}", ROLE_GUID)
                            ]
                        }
                    }
                }
            }
        }))
        .unwrap();
        PolicyDefinitionHandle {
            name: "policytest-g1".into(),
            id: "/subscriptions/sub-1/providers/Microsoft.Authorization/policyDefinitions/policytest-g1".into(),
            document,
        }
    }

    fn retry(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(RetryBudget::new(max_retries, 0), None)
    }

    async fn mount_assignment(server: &MockServer, with_identity: bool) {
        let mut body = json!({
            "id": format!("{}/providers/Microsoft.Authorization/policyAssignments/policytest-c1", SCOPE),
            "name": "policytest-c1",
        });
        if with_identity {
            body["identity"] = json!({ "type": "SystemAssigned", "principalId": "principal-1" });
        }
        Mock::given(method("PUT"))
            .and(path(format!("{}/providers/Microsoft.Authorization/policyAssignments/policytest-c1", SCOPE)))
            .respond_with(ResponseTemplate::new(201).set_body_json(body))
            .expect(1)
            .mount(server)
            .await;
    }

    fn role_error(code: &str, status: u16) -> ResponseTemplate {
        ResponseTemplate::new(status).set_body_json(json!({ "error": { "code": code, "message": format!("{} happened", code) } }))
    }

    async fn assign(server: &MockServer, effect: &str, role_retries: u32) -> (Result<PolicyAssignmentHandle, HarnessError>, u64) {
        let c = client(server);
        let def = definition(effect);
        let params = ParameterBag::default();
        let location = Region::parse("northeurope").unwrap();
        let req = AssignmentRequest { name: "policytest-c1", scope: SCOPE, definition: &def, parameters: &params, location: &location };
        let result = assign_policy(&c, &req, &retry(role_retries)).await;
        (result, c.session().refresh_count())
    }

    #[tokio::test]
    async fn plain_assignment_skips_identity_and_refreshes_session() {
        let server = MockServer::start().await;
        mount_assignment(&server, false).await;
        Mock::given(method("PUT"))
            .and(path_regex(".*/roleAssignments/.*"))
            .respond_with(ResponseTemplate::new(201))
            .expect(0)
            .mount(&server)
            .await;

        let (result, refreshes) = assign(&server, "deny", 3).await;
        let handle = result.unwrap();
        assert!(!handle.has_identity());
        assert_eq!(handle.scope, SCOPE);
        assert_eq!(refreshes, 1);
    }

    #[tokio::test]
    async fn remediable_effect_requests_identity_and_grants_scoped_role() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path(format!("{}/providers/Microsoft.Authorization/policyAssignments/policytest-c1", SCOPE)))
            .and(body_partial_json(json!({ "identity": { "type": "SystemAssigned" }, "location": "northeurope" })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "identity": { "principalId": "principal-1" }
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path_regex(".*/roleAssignments/.*"))
            .and(body_partial_json(json!({ "properties": {
                "principalId": "principal-1",
                "roleDefinitionId": format!("/subscriptions/sub-1/providers/Microsoft.Authorization/roleDefinitions/{}", ROLE_GUID)
            } })))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let (result, refreshes) = assign(&server, "deployIfNotExists", 3).await;
        let handle = result.unwrap();
        assert_eq!(handle.principal_id.as_deref(), Some("principal-1"));
        assert_eq!(handle.granted_roles.len(), 1);
        assert!(handle.id.ends_with("/policyAssignments/policytest-c1"));
        assert_eq!(refreshes, 1);
    }

    #[tokio::test]
    async fn principal_not_found_is_retried_until_replicated() {
        let server = MockServer::start().await;
        mount_assignment(&server, true).await;
        Mock::given(method("PUT"))
            .and(path_regex(".*/roleAssignments/.*"))
            .respond_with(role_error("PrincipalNotFound", 400))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path_regex(".*/roleAssignments/.*"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let (result, _) = assign(&server, "modify", 5).await;
        assert_eq!(result.unwrap().granted_roles.len(), 1);
    }

    #[tokio::test]
    async fn principal_never_replicating_is_propagation_timeout() {
        let server = MockServer::start().await;
        mount_assignment(&server, true).await;
        Mock::given(method("PUT"))
            .and(path_regex(".*/roleAssignments/.*"))
            .respond_with(role_error("PrincipalNotFound", 400))
            .expect(3)
            .mount(&server)
            .await;

        let (result, refreshes) = assign(&server, "deployIfNotExists", 2).await;
        match result.unwrap_err() {
            HarnessError::RolePropagationTimeout { principal, scope, exhausted, .. } => {
                assert_eq!(principal, "principal-1");
                assert_eq!(scope, SCOPE);
                assert_eq!(exhausted.attempts, 3);
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(refreshes, 0);
    }

    #[tokio::test]
    async fn other_role_failure_is_not_retried() {
        let server = MockServer::start().await;
        mount_assignment(&server, true).await;
        Mock::given(method("PUT"))
            .and(path_regex(".*/roleAssignments/.*"))
            .respond_with(role_error("AuthorizationFailed", 403))
            .expect(1)
            .mount(&server)
            .await;

        let (result, _) = assign(&server, "deployIfNotExists", 10).await;
        match result.unwrap_err() {
            HarnessError::RoleAssignmentFailed { message, principal, .. } => {
                assert!(message.contains("AuthorizationFailed"), "got: {}", message);
                assert_eq!(principal, "principal-1");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn existing_role_assignment_counts_as_granted() {
        let server = MockServer::start().await;
        mount_assignment(&server, true).await;
        Mock::given(method("PUT"))
            .and(path_regex(".*/roleAssignments/.*"))
            .respond_with(role_error("RoleAssignmentExists", 409))
            .expect(1)
            .mount(&server)
            .await;

        let (result, _) = assign(&server, "deployIfNotExists", 3).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn rejected_assignment_names_scope() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(role_error("InvalidPolicyParameters", 400))
            .mount(&server)
            .await;

        let (result, _) = assign(&server, "audit", 3).await;
        let err = result.unwrap_err();
        assert!(matches!(err, HarnessError::AssignmentFailed { .. }));
        assert!(err.to_string().contains(SCOPE), "got: {}", err);
    }

    #[test]
    fn selection_requires_exact_scope_and_definition_suffix() {
        let parent = "/subscriptions/sub-1";
        let assignments = vec![
            json!({ "name": "inherited", "properties": {
                "scope": parent,
                "policyDefinitionId": "/subscriptions/sub-1/providers/Microsoft.Authorization/policyDefinitions/policytest-g1"
            } }),
            json!({ "name": "other-definition", "properties": {
                "scope": SCOPE,
                "policyDefinitionId": "/subscriptions/sub-1/providers/Microsoft.Authorization/policyDefinitions/something-else"
            } }),
            json!({ "name": "first-match", "properties": {
                "scope": SCOPE.to_uppercase(),
                "policyDefinitionId": "/subscriptions/sub-1/providers/Microsoft.Authorization/policyDefinitions/POLICYTEST-G1"
            } }),
            json!({ "name": "second-match", "properties": {
                "scope": SCOPE,
                "policyDefinitionId": "/subscriptions/sub-1/providers/Microsoft.Authorization/policyDefinitions/policytest-g1"
            } }),
        ];
        let picked = select_assignment(&assignments, "policytest-g1", SCOPE).unwrap();
        assert_eq!(picked["name"], "first-match");
        assert!(select_assignment(&assignments[..2], "policytest-g1", SCOPE).is_none());
    }
}
