//! Route tables must carry a default route to their region's network virtual
//! appliance. The policy deploys the route when it is missing.

use std::sync::Arc;

use anyhow::{bail, ensure, Context};
use async_trait::async_trait;
use policytest_config::{HarnessConfig, PolicySource};
use policytest_domain::{ParameterBag, Region, RegionSettings, RegionalSettings};
use policytest_harness::resources::{
    create_route_table, delete_route, get_route, get_route_table, routes_of, ObservedRoute, ROUTE_TABLES,
};
use policytest_harness::{Attempt, RetryError, Scenario, TestContext, TestGroup};
use tracing::info;

use crate::registry::ScenarioError;

pub const GROUP: &str = "route_table";
pub const SETTINGS_PARAMETER: &str = "routeTableSettings";
pub const DEFAULT_PREFIX: &str = "0.0.0.0/0";
pub const APPLIANCE_HOP: &str = "VirtualAppliance";

const TABLE_NAME: &str = "rt-policytest";

/// Settings used when the config has none for [`SETTINGS_PARAMETER`].
pub fn default_settings() -> Result<RegionalSettings, policytest_domain::DomainError> {
    let region = Region::parse("northeurope")?;
    let settings = RegionSettings::new(&region, "10.0.0.23")?;
    let mut regional = RegionalSettings::default();
    regional.insert(region, settings);
    Ok(regional)
}

pub fn group(config: &HarnessConfig) -> Result<TestGroup, ScenarioError> {
    let settings = match config.parameters.get(SETTINGS_PARAMETER) {
        Some(s) => s.clone(),
        None => default_settings().map_err(|source| ScenarioError::Parameters { group: GROUP, source })?,
    };
    let mut parameters = ParameterBag::default();
    parameters.insert_regional(SETTINGS_PARAMETER, &settings);
    let settings = Arc::new(settings);

    Ok(TestGroup {
        name: GROUP.to_string(),
        policy: PolicySource::for_caller(file!()),
        parameters,
        scenarios: vec![
            Arc::new(RouteAddedOnCreate(settings.clone())),
            Arc::new(CompliantTableIsCompliant(settings.clone())),
            Arc::new(RemovedRouteIsNonCompliant(settings.clone())),
            Arc::new(RemediationRestoresRoute(settings)),
        ],
    })
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn appliance_address(ctx: &TestContext, settings: &RegionalSettings) -> anyhow::Result<String> {
    let region = ctx.location();
    let s = settings
        .get(region)
        .with_context(|| format!("no {} entry for region {}", SETTINGS_PARAMETER, region))?;
    Ok(s.virtual_appliance_ip_address.to_string())
}

fn is_default_route(route: &ObservedRoute, appliance: &str) -> bool {
    route.address_prefix == DEFAULT_PREFIX
        && route.next_hop_type.eq_ignore_ascii_case(APPLIANCE_HOP)
        && route.next_hop_ip_address.as_deref() == Some(appliance)
}

/// Create an empty route table and return its resource id.
async fn create_empty_table(ctx: &TestContext) -> anyhow::Result<String> {
    let rg = ctx.resource_group()?;
    let resp = create_route_table(ctx.client(), &rg, TABLE_NAME, &[]).await?;
    ensure!(
        resp.is_success(),
        "creating route table {} failed: status {}: {}",
        TABLE_NAME,
        resp.status,
        resp.error_message()
    );
    Ok(ctx.resource_id(ROUTE_TABLES, TABLE_NAME)?)
}

/// Wait until the policy has deployed the default route into the table.
async fn wait_for_default_route(ctx: &TestContext, appliance: &str) -> anyhow::Result<ObservedRoute> {
    let rg = ctx.resource_group()?;
    let retry = ctx.harness().retry(|r| r.compliance_state);
    let found = retry
        .run("default route deployment", TABLE_NAME, |_| {
            let rg = &rg;
            async move {
                let table = get_route_table(ctx.client(), rg, TABLE_NAME)
                    .await?
                    .require_success(&format!("read route table {}", TABLE_NAME))?;
                let routes = routes_of(&table);
                Ok::<_, anyhow::Error>(match routes.into_iter().find(|r| is_default_route(r, appliance)) {
                    Some(route) => Attempt::Ready(route),
                    None => Attempt::Pending(format!("no {} route via {} yet", DEFAULT_PREFIX, appliance)),
                })
            }
        })
        .await;
    match found {
        Ok(route) => Ok(route),
        Err(RetryError::Exhausted(exhausted)) => Err(exhausted.into()),
        Err(RetryError::Fatal(e)) => Err(e),
    }
}

/// Create a table, let the policy add its route, then delete that route
/// behind the policy's back. Returns the table id.
async fn break_compliance(ctx: &TestContext, appliance: &str) -> anyhow::Result<String> {
    let table_id = create_empty_table(ctx).await?;
    let route = wait_for_default_route(ctx, appliance).await?;
    let rg = ctx.resource_group()?;

    info!(route = %route.name, "Deleting policy-deployed route");
    let resp = delete_route(ctx.client(), &rg, TABLE_NAME, &route.name).await?;
    ensure!(resp.is_success(), "deleting route {} failed: {}", route.name, resp.error_message());
    let gone = get_route(ctx.client(), &rg, TABLE_NAME, &route.name).await?;
    ensure!(gone.is_not_found(), "route {} still present after delete (status {})", route.name, gone.status);
    Ok(table_id)
}

// ── Scenarios ────────────────────────────────────────────────────────────────

/// A new table without a default route gets one via the appliance.
pub struct RouteAddedOnCreate(Arc<RegionalSettings>);

#[async_trait]
impl Scenario for RouteAddedOnCreate {
    fn name(&self) -> &str {
        "route_added_on_create"
    }

    async fn run(&self, ctx: &TestContext) -> anyhow::Result<()> {
        let appliance = appliance_address(ctx, &self.0)?;
        create_empty_table(ctx).await?;
        let route = wait_for_default_route(ctx, &appliance).await?;
        ensure!(route.next_hop_type == APPLIANCE_HOP, "unexpected next hop type {}", route.next_hop_type);
        Ok(())
    }
}

/// A table carrying the route is reported compliant.
pub struct CompliantTableIsCompliant(Arc<RegionalSettings>);

#[async_trait]
impl Scenario for CompliantTableIsCompliant {
    fn name(&self) -> &str {
        "compliant_table_is_compliant"
    }

    async fn run(&self, ctx: &TestContext) -> anyhow::Result<()> {
        let appliance = appliance_address(ctx, &self.0)?;
        let assignment = ctx.lookup_assignment().await?.context("assignment not visible at its own scope")?;
        ensure!(
            assignment.name == ctx.assignment()?.name,
            "found assignment {} instead of {}",
            assignment.name,
            ctx.assignment()?.name
        );

        let table_id = create_empty_table(ctx).await?;
        wait_for_default_route(ctx, &appliance).await?;
        ctx.trigger_scan().await?;
        ensure!(ctx.query_compliance(&table_id).await?, "route table {} reported non-compliant", table_id);
        Ok(())
    }
}

/// Removing the route directly makes the table non-compliant.
pub struct RemovedRouteIsNonCompliant(Arc<RegionalSettings>);

#[async_trait]
impl Scenario for RemovedRouteIsNonCompliant {
    fn name(&self) -> &str {
        "removed_route_is_non_compliant"
    }

    async fn run(&self, ctx: &TestContext) -> anyhow::Result<()> {
        let appliance = appliance_address(ctx, &self.0)?;
        let table_id = break_compliance(ctx, &appliance).await?;
        ctx.trigger_scan().await?;
        ensure!(!ctx.query_compliance(&table_id).await?, "route table {} reported compliant", table_id);
        Ok(())
    }
}

/// Remediating the non-compliant table deploys the route again.
pub struct RemediationRestoresRoute(Arc<RegionalSettings>);

#[async_trait]
impl Scenario for RemediationRestoresRoute {
    fn name(&self) -> &str {
        "remediation_restores_route"
    }

    async fn run(&self, ctx: &TestContext) -> anyhow::Result<()> {
        let appliance = appliance_address(ctx, &self.0)?;
        let table_id = break_compliance(ctx, &appliance).await?;
        ctx.trigger_scan().await?;
        if ctx.query_compliance(&table_id).await? {
            bail!("route table {} compliant before remediation", table_id);
        }

        let outcome = ctx.remediate(&table_id, true).await?;
        info!(outcome = %outcome, "Remediation finished");
        wait_for_default_route(ctx, &appliance)
            .await
            .context("route not restored by remediation")?;
        Ok(())
    }
}
