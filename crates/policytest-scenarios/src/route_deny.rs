use std::sync::Arc;

use anyhow::{ensure, Context};
use async_trait::async_trait;
use policytest_config::{HarnessConfig, PolicySource};
use policytest_domain::ParameterBag;
use policytest_harness::resources::{create_route, create_route_table, get_route, RouteSpec};
use policytest_harness::{Scenario, TestContext, TestGroup};
use tracing::info;

use crate::registry::ScenarioError;

pub const GROUP: &str = "route_deny";

const TABLE_NAME: &str = "rt-deny";
const DENIED_CODE: &str = "RequestDisallowedByPolicy";

pub fn group(_config: &HarnessConfig) -> Result<TestGroup, ScenarioError> {
    Ok(TestGroup {
        name: GROUP.to_string(),
        policy: PolicySource::for_caller(file!()),
        parameters: ParameterBag::default(),
        scenarios: vec![Arc::new(BlackholeRouteDenied), Arc::new(ApplianceRouteAllowed)],
    })
}

async fn create_table(ctx: &TestContext) -> anyhow::Result<()> {
    let rg = ctx.resource_group()?;
    let resp = create_route_table(ctx.client(), &rg, TABLE_NAME, &[]).await?;
    ensure!(resp.is_success(), "creating route table {} failed: {}", TABLE_NAME, resp.error_message());
    Ok(())
}

/// A route that drops traffic is refused, and the refusal names the policy.
pub struct BlackholeRouteDenied;

#[async_trait]
impl Scenario for BlackholeRouteDenied {
    fn name(&self) -> &str {
        "blackhole_route_denied"
    }

    async fn run(&self, ctx: &TestContext) -> anyhow::Result<()> {
        create_table(ctx).await?;
        let rg = ctx.resource_group()?;
        let route = RouteSpec::new("blackhole", "10.99.0.0/16", "None");

        let resp = create_route(ctx.client(), &rg, TABLE_NAME, &route)
            .await
            .context("creating blackhole route")?;
        ensure!(!resp.is_success(), "blackhole route was accepted (status {})", resp.status);
        ensure!(
            resp.error_code() == Some(DENIED_CODE),
            "expected {}, got {:?}: {}",
            DENIED_CODE,
            resp.error_code(),
            resp.error_message()
        );
        let definition = &ctx.definition().name;
        ensure!(resp.mentions(definition), "denial does not name definition {}: {}", definition, resp.error_message());
        info!(definition = %definition, "Route denied by policy");

        let after = get_route(ctx.client(), &rg, TABLE_NAME, &route.name).await?;
        ensure!(after.is_not_found(), "denied route exists anyway (status {})", after.status);
        Ok(())
    }
}

/// Routes with a real next hop are unaffected by the deny policy.
pub struct ApplianceRouteAllowed;

#[async_trait]
impl Scenario for ApplianceRouteAllowed {
    fn name(&self) -> &str {
        "appliance_route_allowed"
    }

    async fn run(&self, ctx: &TestContext) -> anyhow::Result<()> {
        create_table(ctx).await?;
        let rg = ctx.resource_group()?;
        let route = RouteSpec::new("to-appliance", "10.98.0.0/16", "VirtualAppliance").via("10.0.0.23");

        let resp = create_route(ctx.client(), &rg, TABLE_NAME, &route).await?;
        ensure!(resp.is_success(), "route rejected: {}", resp.error_message());
        let after = get_route(ctx.client(), &rg, TABLE_NAME, &route.name).await?;
        ensure!(after.is_success(), "route missing after create (status {})", after.status);
        Ok(())
    }
}
