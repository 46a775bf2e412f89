use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use policytest_arm::{ArmClient, Credentials, Session};
use policytest_config::{load_config, read_template, HarnessConfig};
use policytest_domain::ParameterBag;
use policytest_harness::{run_groups, sweep as sweep_resources, Harness, SweepRequest};
use policytest_scenarios::ScenarioRegistry;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::cli::{Cli, OutputFormat};
use crate::output;

/// Templates are looked up here when no config file is given.
const DEFAULT_POLICIES_DIR: &str = "crates/policytest-scenarios/policies";

/// Config file values with command-line and environment overrides applied.
pub fn resolve_config(cli: &Cli) -> Result<HarnessConfig> {
    let mut config = match &cli.config {
        Some(path) => load_config(path).with_context(|| format!("Failed to load config {}", path.display()))?,
        None => HarnessConfig::with_defaults(Path::new(DEFAULT_POLICIES_DIR))?,
    };
    if let Some(tenant) = &cli.tenant_id {
        config.tenant_id = Some(tenant.clone());
    }
    if let Some(sub) = &cli.subscription_id {
        config.subscription_id = Some(sub.clone());
    }
    Ok(config)
}

fn connect(cli: &Cli, config: &HarnessConfig) -> Result<ArmClient> {
    let credentials = Credentials {
        tenant_id: config
            .tenant_id
            .clone()
            .context("--tenant-id (or AZURE_TENANT_ID, or tenant_id in the config) is required")?,
        subscription_id: config
            .subscription_id
            .clone()
            .context("--subscription-id (or AZURE_SUBSCRIPTION_ID, or subscription_id in the config) is required")?,
        client_id: cli.client_id.clone(),
        client_secret: cli.client_secret.clone(),
    };
    let session = Session::new(credentials).context("Failed to create Azure session")?;
    Ok(ArmClient::new(Arc::new(session)))
}

fn exit_status(ok: bool) -> ExitCode {
    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

// ── Run ───────────────────────────────────────────────────────────────────────

pub async fn run(cli: &Cli, groups: &[String], format: OutputFormat) -> Result<ExitCode> {
    let config = resolve_config(cli)?;
    let groups = ScenarioRegistry::builtin().build_selected(&config, groups)?;
    let client = connect(cli, &config)?;
    let harness = Harness::new(Arc::new(client), config);

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; cancelling scenarios, teardown still runs");
            let _ = cancel_tx.send(true);
        }
    });

    info!(groups = groups.len(), "Starting test run");
    let report = run_groups(&harness, groups, cancel_rx).await;
    match format {
        OutputFormat::Text => print!("{}", output::render_run(&report)),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
    }
    Ok(exit_status(report.is_success()))
}

// ── List ──────────────────────────────────────────────────────────────────────

pub fn list(cli: &Cli) -> Result<ExitCode> {
    let config = resolve_config(cli)?;
    let groups = ScenarioRegistry::builtin().build_selected(&config, &[])?;
    print!("{}", output::render_groups(&groups));
    Ok(ExitCode::SUCCESS)
}

// ── Sweep ─────────────────────────────────────────────────────────────────────

pub async fn sweep(cli: &Cli, older_than: u32, dry_run: bool, format: OutputFormat) -> Result<ExitCode> {
    let config = resolve_config(cli)?;
    let client = connect(cli, &config)?;
    let req = SweepRequest { older_than: chrono::Duration::minutes(i64::from(older_than)), dry_run };
    let report = sweep_resources(&client, &config.name_prefix, &req)
        .await
        .context("Sweep failed")?;
    match format {
        OutputFormat::Text => print!("{}", output::render_sweep(&report)),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
    }
    Ok(exit_status(report.errors.is_empty()))
}

// ── Validate ──────────────────────────────────────────────────────────────────

pub fn validate(files: &[PathBuf]) -> Result<ExitCode> {
    Ok(exit_status(validate_all(files)))
}

/// Print a summary of every file; `false` if any failed to parse.
fn validate_all(files: &[PathBuf]) -> bool {
    let mut ok = true;
    for path in files {
        match describe_template(path) {
            Ok(summary) => print!("{}", summary),
            Err(e) => {
                ok = false;
                println!("{}: invalid: {:#}", path.display(), e);
            }
        }
    }
    ok
}

fn describe_template(path: &Path) -> Result<String> {
    let doc = read_template(path)?;
    // Effects behind a parameter resolve to the definition's default here.
    let effect = doc.effect(&ParameterBag::default())?;
    Ok(output::render_template(path, &doc, effect))
}
