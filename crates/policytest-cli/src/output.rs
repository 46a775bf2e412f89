use std::fmt::Write;
use std::path::Path;

use policytest_domain::{PolicyDocument, PolicyEffect};
use policytest_harness::{RunReport, ScenarioOutcome, SweepReport, TestGroup};

/// Render a run report as human-readable text.
pub fn render_run(report: &RunReport) -> String {
    let mut out = String::new();
    for group in &report.groups {
        let _ = writeln!(out, "group {}", group.group);
        if let Some(def) = &group.definition {
            let _ = writeln!(out, "  definition: {}", def);
        }
        if let Some(err) = &group.setup_error {
            let _ = writeln!(out, "  SETUP FAILED: {}", err);
        }
        for s in &group.scenarios {
            let (mark, detail) = match &s.outcome {
                ScenarioOutcome::Passed => ("ok  ", None),
                ScenarioOutcome::Failed { error } => ("FAIL", Some(error)),
                ScenarioOutcome::SetupFailed { error } => ("SKIP", Some(error)),
            };
            let _ = writeln!(out, "  {} {} ({} ms)", mark, s.scenario, s.duration_ms);
            if let Some(detail) = detail {
                let _ = writeln!(out, "       {}", detail);
            }
            if let Some(leak) = &s.teardown_error {
                let _ = writeln!(out, "       LEAK: {}", leak);
            }
        }
        for err in &group.teardown_errors {
            let _ = writeln!(out, "  LEAK: {}", err);
        }
    }

    let _ = writeln!(
        out,
        "\n{} passed, {} failed, {} leaked{}",
        report.passed(),
        report.failed(),
        report.leaks(),
        if report.cancelled { " (cancelled)" } else { "" }
    );
    if report.leaks() > 0 {
        out.push_str("Run `policytest sweep` to remove leftover resources.\n");
    }
    out
}

pub fn render_groups(groups: &[TestGroup]) -> String {
    let mut out = String::new();
    for group in groups {
        let _ = writeln!(out, "{} ({})", group.name, group.policy.describe());
        for s in &group.scenarios {
            let _ = writeln!(out, "  {}", s.name());
        }
    }
    out
}

pub fn render_sweep(report: &SweepReport) -> String {
    if report.stale.is_empty() && report.errors.is_empty() {
        return "Nothing to sweep.\n".to_string();
    }
    let verb = if report.dry_run { "would delete" } else { "deleted" };
    let mut out = String::new();
    for r in &report.stale {
        let created = r.created.map(|t| t.to_rfc3339()).unwrap_or_else(|| "unknown".into());
        let _ = writeln!(out, "{} {} {} (created {})", verb, r.kind, r.name, created);
    }
    for err in &report.errors {
        let _ = writeln!(out, "error: {}", err);
    }
    out
}

pub fn render_template(path: &Path, doc: &PolicyDocument, effect: PolicyEffect) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", path.display());
    let _ = writeln!(out, "  name: {}", doc.name().unwrap_or("<unnamed>"));
    if let Some(display) = doc.display_name() {
        let _ = writeln!(out, "  display name: {}", display);
    }
    let _ = writeln!(out, "  effect: {} ({})", effect, effect.class());
    let identity = if effect.requires_identity() { "required" } else { "none" };
    let _ = writeln!(out, "  identity: {}", identity);
    for role in doc.role_definition_ids() {
        let _ = writeln!(out, "  role: {}", role);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use policytest_harness::{GroupReport, ScenarioReport};

    fn scenario(name: &str, outcome: ScenarioOutcome, leak: Option<&str>) -> ScenarioReport {
        ScenarioReport {
            scenario: name.into(),
            context: Some("ctx".into()),
            outcome,
            teardown_error: leak.map(String::from),
            duration_ms: 12,
        }
    }

    #[test]
    fn run_summary_counts_failures_and_leaks() {
        let mut group = GroupReport::new("route_table");
        group.scenarios = vec![
            scenario("a", ScenarioOutcome::Passed, None),
            scenario("b", ScenarioOutcome::Failed { error: "boom".into() }, Some("rg still there")),
        ];
        let report = RunReport { started_at: Utc::now(), finished_at: Utc::now(), cancelled: false, groups: vec![group] };

        let text = render_run(&report);
        assert!(text.contains("ok   a"), "got: {}", text);
        assert!(text.contains("FAIL b"), "got: {}", text);
        assert!(text.contains("LEAK: rg still there"), "got: {}", text);
        assert!(text.contains("1 passed, 1 failed, 1 leaked"), "got: {}", text);
        assert!(text.contains("policytest sweep"));
    }

    #[test]
    fn empty_sweep_says_so() {
        let report = SweepReport { dry_run: true, stale: vec![], errors: vec![] };
        assert_eq!(render_sweep(&report), "Nothing to sweep.\n");
    }
}
