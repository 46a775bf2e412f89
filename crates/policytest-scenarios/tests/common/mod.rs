//! An in-memory stand-in for the ARM endpoints the harness talks to, with just
//! enough policy behaviour to exercise the built-in groups.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use policytest_arm::{ArmClient, BaseUrls, LroPolicy, Session};
use policytest_config::{HarnessConfig, RetryBudget, RetryConfig};
use policytest_domain::{ParameterBag, PolicyDocument, PolicyEffect};
use policytest_harness::Harness;
use serde_json::{json, Value};
use uuid::Uuid;
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

pub const SUBSCRIPTION: &str = "00000000-0000-0000-0000-000000000001";

#[derive(Debug)]
pub struct Table {
    pub id: String,
    pub name: String,
    pub location: String,
    pub routes: Vec<Value>,
    /// Reads left before the policy's deployment lands. `None` once deployed
    /// or when no policy applies.
    pub deploy_after_reads: Option<u32>,
}

#[derive(Debug)]
pub struct Remediation {
    pub body: Value,
    pub polls: u32,
}

#[derive(Debug)]
pub struct ArmState {
    /// deployIfNotExists assignments add the missing route to new tables.
    pub auto_deploy: bool,
    /// Deny assignments refuse routes with a `None` next hop.
    pub enforce_deny: bool,
    /// Table reads before an automatic deployment becomes visible.
    pub deploy_delay_reads: u32,
    /// Role grants rejected with `PrincipalNotFound` before one succeeds.
    pub principal_not_found: u32,
    /// Remediations that succeed without deploying anything.
    pub idle_remediations: u32,

    pub resource_groups: BTreeMap<String, Value>,
    pub definitions: BTreeMap<String, Value>,
    pub assignments: BTreeMap<String, Value>,
    pub role_assignments: Vec<Value>,
    pub tables: BTreeMap<String, Table>,
    pub scanned_scopes: BTreeSet<String>,
    pub remediations: BTreeMap<String, Remediation>,
    pub requests: Vec<String>,
}

impl Default for ArmState {
    fn default() -> Self {
        Self {
            auto_deploy: true,
            enforce_deny: true,
            deploy_delay_reads: 1,
            principal_not_found: 0,
            idle_remediations: 0,
            resource_groups: BTreeMap::new(),
            definitions: BTreeMap::new(),
            assignments: BTreeMap::new(),
            role_assignments: Vec::new(),
            tables: BTreeMap::new(),
            scanned_scopes: BTreeSet::new(),
            remediations: BTreeMap::new(),
            requests: Vec::new(),
        }
    }
}

pub struct FakeArm {
    pub server: MockServer,
    state: Arc<Mutex<ArmState>>,
}

impl FakeArm {
    pub async fn start() -> Self {
        let server = MockServer::start().await;
        let state = Arc::new(Mutex::new(ArmState::default()));
        Mock::given(wiremock::matchers::any())
            .respond_with(FakeArmResponder { state: state.clone(), base: server.uri() })
            .mount(&server)
            .await;
        Self { server, state }
    }

    pub fn state(&self) -> MutexGuard<'_, ArmState> {
        self.state.lock().unwrap()
    }

    /// A harness pointed at this fake with near-zero waits.
    pub fn harness(&self) -> Harness {
        let session = Arc::new(Session::static_token("tenant", SUBSCRIPTION, "token"));
        let client = ArmClient::with_base(
            session,
            BaseUrls { management: self.server.uri() },
            LroPolicy { delays: vec![0], max_polls: 5 },
        );
        let policies = Path::new(env!("CARGO_MANIFEST_DIR")).join("policies");
        let mut config = HarnessConfig::with_defaults(&policies).unwrap();
        config.retry = RetryConfig {
            ceiling: None,
            definition_propagation: RetryBudget::new(3, 0),
            role_propagation: RetryBudget::new(3, 0),
            compliance_scan: RetryBudget::new(2, 0),
            compliance_state: RetryBudget::new(4, 0),
            remediation: RetryBudget::new(2, 0),
            remediation_job: RetryBudget::new(4, 0),
        };
        Harness::new(Arc::new(client), config)
    }

    /// Nothing the harness created is left behind.
    pub fn assert_clean(&self) {
        let state = self.state();
        assert!(state.resource_groups.is_empty(), "leaked groups: {:?}", state.resource_groups.keys());
        assert!(state.definitions.is_empty(), "leaked definitions: {:?}", state.definitions.keys());
        assert!(state.assignments.is_empty(), "leaked assignments: {:?}", state.assignments.keys());
        assert!(state.tables.is_empty(), "leaked tables: {:?}", state.tables.keys());
    }
}

struct FakeArmResponder {
    state: Arc<Mutex<ArmState>>,
    base: String,
}

impl Respond for FakeArmResponder {
    fn respond(&self, req: &Request) -> ResponseTemplate {
        let mut state = self.state.lock().unwrap();
        let method = req.method.as_str().to_string();
        let path = req.url.path().to_string();
        state.requests.push(format!("{} {}", method, path));

        let body: Value = serde_json::from_slice(&req.body).unwrap_or(Value::Null);
        let filter = req
            .url
            .query_pairs()
            .find(|(k, _)| k == "$filter")
            .map(|(_, v)| v.into_owned());
        let call = Call { method: &method, path: &path, body: &body, filter: filter.as_deref(), base: &self.base };
        route(&mut state, &call)
    }
}

struct Call<'a> {
    method: &'a str,
    path: &'a str,
    body: &'a Value,
    filter: Option<&'a str>,
    base: &'a str,
}

impl Call<'_> {
    /// Original-case path prefix made of the first `n` segments.
    fn prefix(&self, n: usize) -> String {
        let segs: Vec<&str> = self.path.trim_start_matches('/').split('/').take(n).collect();
        format!("/{}", segs.join("/"))
    }

    fn segment(&self, i: usize) -> String {
        self.path.trim_start_matches('/').split('/').nth(i).unwrap_or_default().to_string()
    }
}

fn reply(status: u16, body: Value) -> ResponseTemplate {
    ResponseTemplate::new(status).set_body_json(body)
}

fn arm_error(status: u16, code: &str, message: &str) -> ResponseTemplate {
    reply(status, json!({ "error": { "code": code, "message": message } }))
}

fn not_found(what: &str) -> ResponseTemplate {
    arm_error(404, "ResourceNotFound", &format!("{} was not found", what))
}

fn route(state: &mut ArmState, call: &Call<'_>) -> ResponseTemplate {
    let lower = call.path.to_ascii_lowercase();
    let segs: Vec<&str> = lower.trim_start_matches('/').split('/').collect();

    match (call.method, segs.as_slice()) {
        ("GET", ["operations", _]) => reply(200, json!({ "status": "Succeeded" })),

        // Resource groups.
        ("GET", ["subscriptions", _, "resourcegroups"]) => {
            reply(200, json!({ "value": state.resource_groups.values().cloned().collect::<Vec<_>>() }))
        }
        (method, ["subscriptions", _, "resourcegroups", _]) => resource_group(state, call, method, &lower),

        // Policy definitions.
        ("GET", ["subscriptions", _, "providers", "microsoft.authorization", "policydefinitions"]) => {
            reply(200, json!({ "value": state.definitions.values().cloned().collect::<Vec<_>>() }))
        }
        (method, ["subscriptions", _, "providers", "microsoft.authorization", "policydefinitions", name]) => {
            definition(state, call, method, name)
        }

        // Assignments and role grants at resource group scope.
        ("GET", ["subscriptions", _, "resourcegroups", _, "providers", "microsoft.authorization", "policyassignments"]) => {
            let scope = scope_of(&lower);
            let value: Vec<Value> = state
                .assignments
                .values()
                .filter(|a| a["properties"]["scope"].as_str().is_some_and(|s| s.eq_ignore_ascii_case(&scope)))
                .cloned()
                .collect();
            reply(200, json!({ "value": value }))
        }
        (method, ["subscriptions", _, "resourcegroups", _, "providers", "microsoft.authorization", "policyassignments", _]) => {
            assignment(state, call, method, &lower)
        }
        ("PUT", ["subscriptions", _, "resourcegroups", _, "providers", "microsoft.authorization", "roleassignments", _]) => {
            if state.principal_not_found > 0 {
                state.principal_not_found -= 1;
                return arm_error(400, "PrincipalNotFound", "Principal does not exist in the directory.");
            }
            state.role_assignments.push(call.body.clone());
            reply(201, json!({ "id": call.path, "properties": call.body["properties"] }))
        }

        // Compliance.
        ("POST", ["subscriptions", _, "resourcegroups", _, "providers", "microsoft.policyinsights", "policystates", "latest", "triggerevaluation"]) => {
            state.scanned_scopes.insert(scope_of(&lower));
            ResponseTemplate::new(202)
                .insert_header("Location", format!("{}/operations/{}", call.base, Uuid::new_v4()).as_str())
                .insert_header("Retry-After", "0")
        }
        ("POST", ["subscriptions", _, "resourcegroups", _, "providers", "microsoft.policyinsights", "policystates", "latest", "queryresults"]) => {
            query_results(state, call, &lower)
        }

        // Route tables and routes.
        (method, ["subscriptions", _, "resourcegroups", _, "providers", "microsoft.network", "routetables", _]) => {
            route_table(state, call, method, &lower)
        }
        (method, ["subscriptions", _, "resourcegroups", _, "providers", "microsoft.network", "routetables", _, "routes", name]) => {
            table_route(state, call, method, &lower, name)
        }

        // Remediations on a route table.
        (method, ["subscriptions", _, "resourcegroups", _, "providers", "microsoft.network", "routetables", _, "providers", "microsoft.policyinsights", "remediations", _]) => {
            remediation(state, call, method, &lower)
        }

        _ => arm_error(400, "UnsupportedRequest", &format!("{} {}", call.method, call.path)),
    }
}

/// `/subscriptions/{s}/resourcegroups/{rg}` of a lowercased path.
fn scope_of(lower: &str) -> String {
    let segs: Vec<&str> = lower.trim_start_matches('/').split('/').take(4).collect();
    format!("/{}", segs.join("/"))
}

fn in_scope(assignment: &Value, scope: &str) -> bool {
    assignment["properties"]["scope"].as_str().is_some_and(|s| s.eq_ignore_ascii_case(scope))
}

fn definition_name(assignment: &Value) -> String {
    assignment["properties"]["policyDefinitionId"]
        .as_str()
        .and_then(|id| id.rsplit('/').next())
        .unwrap_or_default()
        .to_string()
}

fn effect_of(state: &ArmState, assignment: &Value) -> Option<PolicyEffect> {
    let doc = state.definitions.get(&definition_name(assignment).to_ascii_lowercase())?;
    let doc = PolicyDocument::from_value(doc.clone()).ok()?;
    let mut bag = ParameterBag::default();
    if let Some(params) = assignment["properties"]["parameters"].as_object() {
        for (name, p) in params {
            bag.insert(name.clone(), p["value"].clone());
        }
    }
    doc.effect(&bag).ok()
}

/// Assignments at `scope` whose effect is `effect`.
fn assignments_with(state: &ArmState, scope: &str, effect: PolicyEffect) -> Vec<Value> {
    state
        .assignments
        .values()
        .filter(|a| in_scope(a, scope) && effect_of(state, a) == Some(effect))
        .cloned()
        .collect()
}

fn appliance_for(assignment: &Value, location: &str) -> Option<String> {
    assignment["properties"]["parameters"]["routeTableSettings"]["value"][location]["virtualApplianceIpAddress"]
        .as_str()
        .map(String::from)
}

fn has_default_route(table: &Table, appliance: &str) -> bool {
    table.routes.iter().any(|r| {
        let p = &r["properties"];
        p["addressPrefix"] == "0.0.0.0/0" && p["nextHopType"] == "VirtualAppliance" && p["nextHopIpAddress"] == appliance
    })
}

fn appliance_route(table_id: &str, appliance: &str) -> Value {
    json!({
        "id": format!("{}/routes/default-via-appliance", table_id),
        "name": "default-via-appliance",
        "properties": {
            "addressPrefix": "0.0.0.0/0",
            "nextHopType": "VirtualAppliance",
            "nextHopIpAddress": appliance,
            "provisioningState": "Succeeded",
        }
    })
}

/// The 403 ARM returns when a deny assignment refuses a request.
fn disallowed(resource: &str, assignment: &Value) -> ResponseTemplate {
    let identifiers = json!([{
        "policyAssignment": { "name": assignment["name"], "id": assignment["id"] },
        "policyDefinition": {
            "name": definition_name(assignment),
            "id": assignment["properties"]["policyDefinitionId"],
        },
    }]);
    arm_error(
        403,
        "RequestDisallowedByPolicy",
        &format!("Resource '{}' was disallowed by policy. Policy identifiers: '{}'.", resource, identifiers),
    )
}

fn resource_group(state: &mut ArmState, call: &Call<'_>, method: &str, lower: &str) -> ResponseTemplate {
    match method {
        "PUT" => {
            let group = json!({
                "id": call.path,
                "name": call.segment(3),
                "location": call.body["location"],
                "tags": call.body["tags"],
                "properties": { "provisioningState": "Succeeded" },
            });
            state.resource_groups.insert(lower.to_string(), group.clone());
            reply(201, group)
        }
        "GET" => match state.resource_groups.get(lower) {
            Some(group) => reply(200, group.clone()),
            None => not_found("resource group"),
        },
        "DELETE" => {
            if state.resource_groups.remove(lower).is_none() {
                return not_found("resource group");
            }
            let prefix = format!("{}/", lower);
            state.tables.retain(|id, _| !id.starts_with(&prefix));
            state.assignments.retain(|_, a| !in_scope(a, lower));
            ResponseTemplate::new(202)
        }
        _ => arm_error(405, "MethodNotAllowed", method),
    }
}

fn definition(state: &mut ArmState, call: &Call<'_>, method: &str, name: &str) -> ResponseTemplate {
    match method {
        "PUT" => {
            let mut doc = call.body.clone();
            doc["id"] = json!(call.path);
            state.definitions.insert(name.to_string(), doc.clone());
            reply(201, doc)
        }
        "GET" => match state.definitions.get(name) {
            Some(doc) => reply(200, doc.clone()),
            None => not_found("policy definition"),
        },
        "DELETE" => {
            let in_use = state.assignments.values().any(|a| definition_name(a).eq_ignore_ascii_case(name));
            if in_use {
                return arm_error(400, "PolicyDefinitionInUse", "The policy definition is referenced by an assignment.");
            }
            match state.definitions.remove(name) {
                Some(_) => reply(200, json!({})),
                None => ResponseTemplate::new(204),
            }
        }
        _ => arm_error(405, "MethodNotAllowed", method),
    }
}

fn assignment(state: &mut ArmState, call: &Call<'_>, method: &str, lower: &str) -> ResponseTemplate {
    match method {
        "PUT" => {
            let props = &call.body["properties"];
            let def = props["policyDefinitionId"].as_str().unwrap_or_default();
            let def_name = def.rsplit('/').next().unwrap_or_default().to_ascii_lowercase();
            if !state.definitions.contains_key(&def_name) {
                return arm_error(404, "PolicyDefinitionNotFound", &format!("definition {} not found", def));
            }
            let mut created = json!({
                "id": call.path,
                "name": call.segment(7),
                "properties": {
                    "scope": call.prefix(4),
                    "policyDefinitionId": def,
                    "parameters": props["parameters"],
                    "displayName": props["displayName"],
                },
            });
            if call.body.get("identity").is_some() {
                created["location"] = call.body["location"].clone();
                created["identity"] = json!({ "type": "SystemAssigned", "principalId": Uuid::new_v4().to_string() });
            }
            state.assignments.insert(lower.to_string(), created.clone());
            reply(201, created)
        }
        "DELETE" => match state.assignments.remove(lower) {
            Some(removed) => reply(200, removed),
            None => ResponseTemplate::new(204),
        },
        _ => arm_error(405, "MethodNotAllowed", method),
    }
}

fn table_body(table: &Table) -> Value {
    json!({
        "id": table.id,
        "name": table.name,
        "location": table.location,
        "properties": { "routes": table.routes, "provisioningState": "Succeeded" },
    })
}

fn route_table(state: &mut ArmState, call: &Call<'_>, method: &str, lower: &str) -> ResponseTemplate {
    let scope = scope_of(lower);
    match method {
        "PUT" => {
            let routes: Vec<Value> = call.body["properties"]["routes"].as_array().cloned().unwrap_or_default();
            if state.enforce_deny {
                let blackhole = routes.iter().any(|r| r["properties"]["nextHopType"] == "None");
                if let Some(deny) = assignments_with(state, &scope, PolicyEffect::Deny).first().filter(|_| blackhole) {
                    return disallowed(&call.segment(7), deny);
                }
            }
            let location = call.body["location"].as_str().unwrap_or_default().to_string();
            let deploys = state.auto_deploy
                && assignments_with(state, &scope, PolicyEffect::DeployIfNotExists)
                    .iter()
                    .any(|a| appliance_for(a, &location).is_some());
            let table = Table {
                id: call.path.to_string(),
                name: call.segment(7),
                location,
                routes,
                deploy_after_reads: deploys.then_some(state.deploy_delay_reads),
            };
            let body = table_body(&table);
            state.tables.insert(lower.to_string(), table);
            reply(201, body)
        }
        "GET" => {
            let deploy: Vec<Value> = assignments_with(state, &scope, PolicyEffect::DeployIfNotExists);
            let Some(table) = state.tables.get_mut(lower) else {
                return not_found("route table");
            };
            match table.deploy_after_reads {
                Some(0) => {
                    table.deploy_after_reads = None;
                    if let Some(appliance) = deploy.iter().find_map(|a| appliance_for(a, &table.location)) {
                        if !has_default_route(table, &appliance) {
                            let route = appliance_route(&table.id, &appliance);
                            table.routes.push(route);
                        }
                    }
                }
                Some(n) => table.deploy_after_reads = Some(n - 1),
                None => {}
            }
            reply(200, table_body(table))
        }
        _ => arm_error(405, "MethodNotAllowed", method),
    }
}

fn table_route(state: &mut ArmState, call: &Call<'_>, method: &str, lower: &str, name: &str) -> ResponseTemplate {
    let scope = scope_of(lower);
    let table_key = lower.rsplitn(3, '/').nth(2).unwrap_or_default().to_string();
    let deny = if state.enforce_deny { assignments_with(state, &scope, PolicyEffect::Deny) } else { Vec::new() };
    let Some(table) = state.tables.get_mut(&table_key) else {
        return not_found("route table");
    };
    let position = table.routes.iter().position(|r| r["name"].as_str().is_some_and(|n| n.eq_ignore_ascii_case(name)));

    match method {
        "PUT" => {
            if call.body["properties"]["nextHopType"] == "None" {
                if let Some(assignment) = deny.first() {
                    return disallowed(&call.segment(9), assignment);
                }
            }
            let mut props = call.body["properties"].clone();
            props["provisioningState"] = json!("Succeeded");
            let created = json!({ "id": call.path, "name": call.segment(9), "properties": props });
            match position {
                Some(i) => table.routes[i] = created.clone(),
                None => table.routes.push(created.clone()),
            }
            reply(201, created)
        }
        "GET" => match position {
            Some(i) => reply(200, table.routes[i].clone()),
            None => not_found("route"),
        },
        "DELETE" => match position {
            Some(i) => {
                table.routes.remove(i);
                reply(200, json!({}))
            }
            None => ResponseTemplate::new(204),
        },
        _ => arm_error(405, "MethodNotAllowed", method),
    }
}

/// Pull `<field> eq '<value>'` out of an OData filter.
fn filter_value(filter: &str, field: &str) -> Option<String> {
    let marker = format!("{} eq '", field);
    let start = filter.find(&marker)? + marker.len();
    let end = filter[start..].find('\'')? + start;
    Some(filter[start..end].to_string())
}

fn query_results(state: &mut ArmState, call: &Call<'_>, lower: &str) -> ResponseTemplate {
    let scope = scope_of(lower);
    let filter = call.filter.unwrap_or_default();
    let (Some(resource_id), Some(assignment_name)) =
        (filter_value(filter, "resourceId"), filter_value(filter, "policyAssignmentName"))
    else {
        return arm_error(400, "InvalidFilter", filter);
    };
    if !state.scanned_scopes.contains(&scope) {
        return reply(200, json!({ "value": [] }));
    }
    let Some(table) = state.tables.get(&resource_id.to_ascii_lowercase()) else {
        return reply(200, json!({ "value": [] }));
    };
    let Some(assignment) = state
        .assignments
        .values()
        .find(|a| in_scope(a, &scope) && a["name"].as_str().is_some_and(|n| n.eq_ignore_ascii_case(&assignment_name)))
    else {
        return reply(200, json!({ "value": [] }));
    };
    let compliant = appliance_for(assignment, &table.location).is_some_and(|ip| has_default_route(table, &ip));
    reply(
        200,
        json!({ "value": [{
            "resourceId": table.id.to_ascii_lowercase(),
            "policyAssignmentName": assignment_name,
            "complianceState": if compliant { "Compliant" } else { "NonCompliant" },
        }] }),
    )
}

fn remediation(state: &mut ArmState, call: &Call<'_>, method: &str, lower: &str) -> ResponseTemplate {
    match method {
        "PUT" => {
            let assignment_id = call.body["properties"]["policyAssignmentId"].as_str().unwrap_or_default().to_ascii_lowercase();
            let Some(assignment) = state.assignments.get(&assignment_id).cloned() else {
                return arm_error(404, "PolicyAssignmentNotFound", &assignment_id);
            };
            let table_key = lower.splitn(2, "/providers/microsoft.policyinsights").next().unwrap_or_default().to_string();
            let idle = state.idle_remediations > 0;
            if idle {
                state.idle_remediations -= 1;
            }
            let Some(table) = state.tables.get_mut(&table_key) else {
                return not_found("route table");
            };

            let mut deployments = 0;
            if !idle {
                if let Some(appliance) = appliance_for(&assignment, &table.location) {
                    if !has_default_route(table, &appliance) {
                        let route = appliance_route(&table.id, &appliance);
                        table.routes.push(route);
                        deployments = 1;
                    }
                }
            }
            let body = json!({
                "id": call.path,
                "name": call.segment(11),
                "properties": {
                    "policyAssignmentId": assignment["id"],
                    "provisioningState": "Succeeded",
                    "deploymentStatus": {
                        "totalDeployments": deployments,
                        "successfulDeployments": deployments,
                        "failedDeployments": 0,
                    },
                },
            });
            let mut accepted = body.clone();
            accepted["properties"]["provisioningState"] = json!("Accepted");
            state.remediations.insert(lower.to_string(), Remediation { body, polls: 0 });
            reply(201, accepted)
        }
        "GET" => {
            let Some(job) = state.remediations.get_mut(lower) else {
                return not_found("remediation");
            };
            job.polls += 1;
            if job.polls == 1 {
                let mut running = job.body.clone();
                running["properties"]["provisioningState"] = json!("Evaluating");
                return reply(200, running);
            }
            reply(200, job.body.clone())
        }
        _ => arm_error(405, "MethodNotAllowed", method),
    }
}
