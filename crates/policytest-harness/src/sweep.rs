use chrono::{DateTime, Duration, Utc};
use policytest_arm::{ArmClient, ArmRequest};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::error::HarnessError;
use crate::registrar::{delete_definition, POLICY_DEFINITIONS_API};
use crate::resources::{delete_resource_group_and_wait, list_resource_groups, TAG_CREATED, TAG_MANAGED, TAG_RUN};

#[derive(Debug, Clone)]
pub struct SweepRequest {
    pub older_than: Duration,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SweptResource {
    pub kind: &'static str,
    pub name: String,
    pub created: Option<DateTime<Utc>>,
    pub run: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepReport {
    pub dry_run: bool,
    pub stale: Vec<SweptResource>,
    pub errors: Vec<String>,
}

fn parse_time(value: &Value) -> Option<DateTime<Utc>> {
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

/// Harness-tagged resource groups created before `cutoff`.
pub fn stale_resource_groups(groups: &[Value], cutoff: DateTime<Utc>) -> Vec<SweptResource> {
    groups
        .iter()
        .filter(|g| g["tags"][TAG_MANAGED].as_str() == Some("true"))
        .filter_map(|g| {
            let name = g["name"].as_str()?.to_string();
            let Some(created) = parse_time(&g["tags"][TAG_CREATED]) else {
                warn!(resource_group = %name, "Managed resource group has no readable creation tag; skipping");
                return None;
            };
            (created < cutoff).then(|| SweptResource {
                kind: "resource_group",
                name,
                created: Some(created),
                run: g["tags"][TAG_RUN].as_str().map(String::from),
            })
        })
        .collect()
}

/// Custom definitions named `<prefix>-…` created before `cutoff`.
pub fn stale_definitions(definitions: &[Value], prefix: &str, cutoff: DateTime<Utc>) -> Vec<SweptResource> {
    let name_prefix = format!("{}-", prefix);
    definitions
        .iter()
        .filter_map(|d| {
            let name = d["name"].as_str()?;
            if !name.starts_with(&name_prefix) {
                return None;
            }
            let created = parse_time(&d["properties"]["metadata"]["createdOn"])?;
            (created < cutoff).then(|| SweptResource {
                kind: "policy_definition",
                name: name.to_string(),
                created: Some(created),
                run: name.strip_prefix(&name_prefix).map(String::from),
            })
        })
        .collect()
}

/// Find (and unless `dry_run`, delete) leftovers of earlier runs.
///
/// Resource group deletions are awaited before any definition is deleted:
/// a definition cannot be deleted while an assignment in a group still
/// references it.
pub async fn sweep(client: &ArmClient, prefix: &str, req: &SweepRequest) -> Result<SweepReport, HarnessError> {
    let cutoff = Utc::now() - req.older_than;
    info!(cutoff = %cutoff.to_rfc3339(), dry_run = req.dry_run, "Sweeping stale harness resources");

    let groups = stale_resource_groups(&list_resource_groups(client).await?, cutoff);
    let list = ArmRequest::get(
        format!("/subscriptions/{}/providers/Microsoft.Authorization/policyDefinitions", client.subscription_id()),
        POLICY_DEFINITIONS_API,
    )
    .query("$filter", "policyType eq 'Custom'");
    let definitions = stale_definitions(&client.list(&list).await?, prefix, cutoff);

    let mut report = SweepReport { dry_run: req.dry_run, stale: Vec::new(), errors: Vec::new() };
    for rg in groups {
        if !req.dry_run {
            if let Err(e) = delete_resource_group_and_wait(client, client.subscription_id(), &rg.name).await {
                report.errors.push(e.to_string());
            }
        }
        report.stale.push(rg);
    }
    for def in definitions {
        if !req.dry_run {
            if let Err(e) = delete_definition(client, &def.name).await {
                report.errors.push(e.to_string());
            }
        }
        report.stale.push(def);
    }
    info!(stale = report.stale.len(), errors = report.errors.len(), "Sweep finished");
    Ok(report)
}
