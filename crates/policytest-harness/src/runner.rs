use std::any::Any;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use policytest_config::PolicySource;
use policytest_domain::{ParameterBag, PolicyDefinitionHandle, RunId};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tracing::{error, info, info_span, warn, Instrument};

use crate::context::{Harness, TestContext};
use crate::error::HarnessError;
use crate::registrar::{delete_definition, register_definition, resolve_document};
use crate::report::{GroupReport, RunReport, ScenarioOutcome, ScenarioReport};

/// Test logic run against one provisioned [`TestContext`].
#[async_trait]
pub trait Scenario: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn run(&self, ctx: &TestContext) -> anyhow::Result<()>;
}

/// Scenarios sharing one policy definition.
pub struct TestGroup {
    pub name: String,
    pub policy: PolicySource,
    /// Assignment parameters given to every context in the group.
    pub parameters: ParameterBag,
    pub scenarios: Vec<Arc<dyn Scenario>>,
}

/// Resolves once `true` has been sent on the cancellation channel. Never
/// resolves if the sender is dropped without cancelling.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Run every group concurrently. Scenario concurrency across all groups is
/// bounded by the harness's configured limit.
pub async fn run_groups(harness: &Harness, groups: Vec<TestGroup>, cancel: watch::Receiver<bool>) -> RunReport {
    let started_at = Utc::now();
    let names: Vec<String> = groups.iter().map(|g| g.name.clone()).collect();

    let mut set = JoinSet::new();
    for (idx, group) in groups.into_iter().enumerate() {
        let harness = harness.clone();
        let cancel = cancel.clone();
        set.spawn(async move { (idx, run_group(&harness, &group, cancel).await) });
    }

    let mut results: Vec<Option<GroupReport>> = vec![None; names.len()];
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((idx, report)) => results[idx] = Some(report),
            Err(e) => error!(error = %e, "Test group task did not complete"),
        }
    }

    let groups = results
        .into_iter()
        .zip(names)
        .map(|(report, name)| {
            report.unwrap_or_else(|| {
                let mut g = GroupReport::new(&name);
                g.setup_error = Some("group task did not complete".into());
                g
            })
        })
        .collect();

    RunReport {
        started_at,
        finished_at: Utc::now(),
        cancelled: *cancel.borrow(),
        groups,
    }
}

/// Register the group's definition, run its scenarios, then delete the
/// definition once every scenario has been torn down.
pub async fn run_group(harness: &Harness, group: &TestGroup, mut cancel: watch::Receiver<bool>) -> GroupReport {
    let mut report = GroupReport::new(&group.name);
    let group_id = RunId::generate();
    let definition_name = group_id.resource_name(&harness.config.name_prefix);
    let span = info_span!("group", group = %group.name, definition = %definition_name);

    async {
        info!(scenarios = group.scenarios.len(), policy = %group.policy.describe(), "Starting test group");
        report.definition = Some(definition_name.clone());

        let registered = tokio::select! {
            r = register(harness, group, &definition_name) => r,
            _ = cancelled(&mut cancel) => Err(HarnessError::Cancelled),
        };
        let definition = match registered {
            Ok(definition) => Arc::new(definition),
            Err(e) => {
                error!(error = %e, "Test group setup failed");
                for scenario in &group.scenarios {
                    report.scenarios.push(ScenarioReport {
                        scenario: scenario.name().to_string(),
                        context: None,
                        outcome: ScenarioOutcome::SetupFailed { error: format!("group setup failed: {}", e) },
                        teardown_error: None,
                        duration_ms: 0,
                    });
                }
                if created_anything(&e) {
                    if let Err(e) = delete_definition(&harness.client, &definition_name).await {
                        report.teardown_errors.push(e.to_string());
                    }
                }
                report.setup_error = Some(e.to_string());
                return;
            }
        };

        let mut set = JoinSet::new();
        for (idx, scenario) in group.scenarios.iter().enumerate() {
            let fut = run_scenario(
                harness.clone(),
                definition.clone(),
                group.parameters.clone(),
                scenario.clone(),
                cancel.clone(),
            );
            set.spawn(async move { (idx, fut.await) }.in_current_span());
        }

        let mut results: Vec<Option<ScenarioReport>> = vec![None; group.scenarios.len()];
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((idx, r)) => results[idx] = Some(r),
                Err(e) => error!(error = %e, "Scenario task did not complete"),
            }
        }
        report.scenarios = results
            .into_iter()
            .zip(&group.scenarios)
            .map(|(r, s)| {
                r.unwrap_or_else(|| ScenarioReport {
                    scenario: s.name().to_string(),
                    context: None,
                    outcome: ScenarioOutcome::Failed { error: "scenario task did not complete".into() },
                    teardown_error: None,
                    duration_ms: 0,
                })
            })
            .collect();

        if let Err(e) = delete_definition(&harness.client, &definition.name).await {
            error!(error = %e, "Failed to delete policy definition");
            report.teardown_errors.push(e.to_string());
        }
        let passed = report.scenarios.iter().filter(|s| s.outcome.is_passed()).count();
        info!(passed, total = report.scenarios.len(), "Test group finished");
    }
    .instrument(span)
    .await;

    report
}

async fn register(harness: &Harness, group: &TestGroup, name: &str) -> Result<PolicyDefinitionHandle, HarnessError> {
    let document = resolve_document(&group.policy, &harness.config.policies_dir)?;
    register_definition(&harness.client, &document, name, &harness.retry(|r| r.definition_propagation)).await
}

/// Whether a failed group setup may have left a definition behind.
fn created_anything(e: &HarnessError) -> bool {
    !matches!(
        e,
        HarnessError::DefinitionNotFound { .. }
            | HarnessError::DefinitionDeployFailed { .. }
            | HarnessError::Config(_)
            | HarnessError::Domain(_)
    )
}

async fn run_scenario(
    harness: Harness,
    definition: Arc<PolicyDefinitionHandle>,
    parameters: ParameterBag,
    scenario: Arc<dyn Scenario>,
    mut cancel: watch::Receiver<bool>,
) -> ScenarioReport {
    let name = scenario.name().to_string();
    let started = Instant::now();

    let slots = harness.slots.clone();
    let permit = tokio::select! {
        p = slots.acquire_owned() => p.ok(),
        _ = cancelled(&mut cancel) => None,
    };
    let Some(_permit) = permit else {
        warn!(scenario = %name, "Scenario cancelled before it started");
        return ScenarioReport {
            scenario: name,
            context: None,
            outcome: ScenarioOutcome::Failed { error: HarnessError::Cancelled.to_string() },
            teardown_error: None,
            duration_ms: 0,
        };
    };

    let ctx = Arc::new(TestContext::new(harness, definition, parameters));
    let span = info_span!("scenario", scenario = %name, context = %ctx.id());

    async {
        let setup = tokio::select! {
            r = ctx.setup() => r,
            _ = cancelled(&mut cancel) => Err(HarnessError::Cancelled),
        };
        let outcome = match setup {
            Ok(()) => {
                info!("Running scenario");
                run_body(ctx.clone(), scenario, &mut cancel).await
            }
            Err(e) => {
                error!(error = %e, "Scenario setup failed");
                ScenarioOutcome::SetupFailed { error: e.to_string() }
            }
        };
        match &outcome {
            ScenarioOutcome::Passed => info!("Scenario passed"),
            ScenarioOutcome::Failed { error } => error!(%error, "Scenario failed"),
            ScenarioOutcome::SetupFailed { .. } => {}
        }

        // Teardown runs on every path, including cancellation.
        let teardown_error = match ctx.teardown().await {
            Ok(()) => None,
            Err(e) => {
                error!(error = %e, "Scenario teardown failed; resources may have leaked");
                Some(e.to_string())
            }
        };

        ScenarioReport {
            scenario: name,
            context: Some(ctx.id().to_string()),
            outcome,
            teardown_error,
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        }
    }
    .instrument(span)
    .await
}

/// Run the scenario body on its own task so a panic fails only this scenario.
async fn run_body(
    ctx: Arc<TestContext>,
    scenario: Arc<dyn Scenario>,
    cancel: &mut watch::Receiver<bool>,
) -> ScenarioOutcome {
    let mut body = tokio::spawn(async move { scenario.run(&ctx).await }.in_current_span());
    tokio::select! {
        joined = &mut body => body_outcome(joined),
        _ = cancelled(cancel) => {
            warn!("Cancelling scenario body");
            body.abort();
            let _ = body.await;
            ScenarioOutcome::Failed { error: HarnessError::Cancelled.to_string() }
        }
    }
}

fn body_outcome(joined: Result<anyhow::Result<()>, JoinError>) -> ScenarioOutcome {
    match joined {
        Ok(Ok(())) => ScenarioOutcome::Passed,
        Ok(Err(e)) => ScenarioOutcome::Failed { error: format!("{:#}", e) },
        Err(e) if e.is_panic() => ScenarioOutcome::Failed {
            error: format!("scenario panicked: {}", panic_message(e.into_panic())),
        },
        Err(_) => ScenarioOutcome::Failed { error: HarnessError::Cancelled.to_string() },
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        return (*s).to_string();
    }
    if let Some(s) = payload.downcast_ref::<String>() {
        return s.clone();
    }
    "non-string panic payload".to_string()
}
