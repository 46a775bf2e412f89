//! Single-call wrappers over the resources scenarios create.
//!
//! Each returns the raw [`ArmResponse`] so callers can assert on status codes
//! and on the text of denial messages.

use chrono::{DateTime, Utc};
use policytest_arm::{ArmClient, ArmError, ArmRequest, ArmResponse};
use policytest_domain::{ResourceGroup, RunId};
use serde_json::{json, Value};
use tracing::{debug, info};

pub const RESOURCE_GROUPS_API: &str = "2021-04-01";
pub const NETWORK_API: &str = "2023-11-01";

pub const ROUTE_TABLES: &str = "Microsoft.Network/routeTables";

/// Tag marking a resource group as harness-owned.
pub const TAG_MANAGED: &str = "policytest-managed";
/// Tag carrying the owning context's [`RunId`].
pub const TAG_RUN: &str = "policytest-run";
/// RFC 3339 creation time, read by `sweep`.
pub const TAG_CREATED: &str = "policytest-created";

pub fn run_tags(id: &RunId, created: DateTime<Utc>) -> Value {
    json!({
        TAG_MANAGED: "true",
        TAG_RUN: id.as_str(),
        TAG_CREATED: created.to_rfc3339(),
    })
}

fn group_path(subscription_id: &str, name: &str) -> String {
    format!("/subscriptions/{}/resourcegroups/{}", subscription_id, name)
}

// ── Resource groups ──────────────────────────────────────────────────────────

pub async fn create_resource_group(
    client: &ArmClient,
    rg: &ResourceGroup,
    tags: Value,
) -> Result<ArmResponse, ArmError> {
    info!(resource_group = %rg.name, location = %rg.location, "Creating resource group");
    let body = json!({ "location": rg.location, "tags": tags });
    client
        .invoke(&ArmRequest::put(group_path(&rg.subscription_id, &rg.name), RESOURCE_GROUPS_API, body))
        .await
}

/// Request deletion without waiting for it to finish. A group that is
/// already gone counts as deleted.
pub async fn delete_resource_group(client: &ArmClient, subscription_id: &str, name: &str) -> Result<(), ArmError> {
    info!(resource_group = %name, "Requesting resource group deletion");
    let resp = client
        .submit(&ArmRequest::delete(group_path(subscription_id, name), RESOURCE_GROUPS_API))
        .await?;
    group_deleted(resp, name)
}

/// Delete a resource group and wait until the deletion has finished.
pub async fn delete_resource_group_and_wait(client: &ArmClient, subscription_id: &str, name: &str) -> Result<(), ArmError> {
    info!(resource_group = %name, "Deleting resource group");
    let resp = client
        .invoke(&ArmRequest::delete(group_path(subscription_id, name), RESOURCE_GROUPS_API))
        .await?;
    group_deleted(resp, name)
}

fn group_deleted(resp: ArmResponse, name: &str) -> Result<(), ArmError> {
    if resp.is_not_found() {
        debug!(resource_group = %name, "Resource group already gone");
        return Ok(());
    }
    resp.require_success(&format!("delete resource group {}", name)).map(|_| ())
}

pub async fn list_resource_groups(client: &ArmClient) -> Result<Vec<Value>, ArmError> {
    let path = format!("/subscriptions/{}/resourcegroups", client.subscription_id());
    client.list(&ArmRequest::get(path, RESOURCE_GROUPS_API)).await
}

// ── Route tables ─────────────────────────────────────────────────────────────

/// One user-defined route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteSpec {
    pub name: String,
    pub address_prefix: String,
    pub next_hop_type: String,
    pub next_hop_ip_address: Option<String>,
}

impl RouteSpec {
    pub fn new(name: &str, address_prefix: &str, next_hop_type: &str) -> Self {
        Self {
            name: name.to_string(),
            address_prefix: address_prefix.to_string(),
            next_hop_type: next_hop_type.to_string(),
            next_hop_ip_address: None,
        }
    }

    pub fn via(mut self, next_hop_ip_address: &str) -> Self {
        self.next_hop_ip_address = Some(next_hop_ip_address.to_string());
        self
    }

    fn properties(&self) -> Value {
        let mut props = json!({
            "addressPrefix": self.address_prefix,
            "nextHopType": self.next_hop_type,
        });
        if let Some(ip) = &self.next_hop_ip_address {
            props["nextHopIpAddress"] = json!(ip);
        }
        props
    }

    pub fn to_body(&self) -> Value {
        json!({ "name": self.name, "properties": self.properties() })
    }
}

/// A route read back from a route table body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedRoute {
    pub name: String,
    pub address_prefix: String,
    pub next_hop_type: String,
    pub next_hop_ip_address: Option<String>,
}

/// Routes listed in a route table resource.
pub fn routes_of(route_table: &Value) -> Vec<ObservedRoute> {
    route_table["properties"]["routes"]
        .as_array()
        .map(|routes| {
            routes
                .iter()
                .map(|r| ObservedRoute {
                    name: r["name"].as_str().unwrap_or_default().to_string(),
                    address_prefix: r["properties"]["addressPrefix"].as_str().unwrap_or_default().to_string(),
                    next_hop_type: r["properties"]["nextHopType"].as_str().unwrap_or_default().to_string(),
                    next_hop_ip_address: r["properties"]["nextHopIpAddress"].as_str().map(String::from),
                })
                .collect()
        })
        .unwrap_or_default()
}

pub async fn create_route_table(
    client: &ArmClient,
    rg: &ResourceGroup,
    name: &str,
    routes: &[RouteSpec],
) -> Result<ArmResponse, ArmError> {
    info!(resource_group = %rg.name, route_table = %name, routes = routes.len(), "Creating route table");
    let body = json!({
        "location": rg.location,
        "properties": { "routes": routes.iter().map(RouteSpec::to_body).collect::<Vec<_>>() },
    });
    client
        .invoke(&ArmRequest::put(rg.resource_id(ROUTE_TABLES, name), NETWORK_API, body))
        .await
}

pub async fn get_route_table(client: &ArmClient, rg: &ResourceGroup, name: &str) -> Result<ArmResponse, ArmError> {
    client.invoke(&ArmRequest::get(rg.resource_id(ROUTE_TABLES, name), NETWORK_API)).await
}

fn route_path(rg: &ResourceGroup, table: &str, route: &str) -> String {
    format!("{}/routes/{}", rg.resource_id(ROUTE_TABLES, table), route)
}

pub async fn create_route(
    client: &ArmClient,
    rg: &ResourceGroup,
    table: &str,
    route: &RouteSpec,
) -> Result<ArmResponse, ArmError> {
    info!(route_table = %table, route = %route.name, next_hop = %route.next_hop_type, "Creating route");
    let body = json!({ "properties": route.properties() });
    client
        .invoke(&ArmRequest::put(route_path(rg, table, &route.name), NETWORK_API, body))
        .await
}

pub async fn get_route(client: &ArmClient, rg: &ResourceGroup, table: &str, route: &str) -> Result<ArmResponse, ArmError> {
    client.invoke(&ArmRequest::get(route_path(rg, table, route), NETWORK_API)).await
}

pub async fn delete_route(client: &ArmClient, rg: &ResourceGroup, table: &str, route: &str) -> Result<ArmResponse, ArmError> {
    info!(route_table = %table, route = %route, "Deleting route");
    client.invoke(&ArmRequest::delete(route_path(rg, table, route), NETWORK_API)).await
}
