use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ScenarioOutcome {
    Passed,
    Failed { error: String },
    /// The context could not be provisioned; the scenario body never ran.
    SetupFailed { error: String },
}

impl ScenarioOutcome {
    pub fn is_passed(&self) -> bool {
        matches!(self, ScenarioOutcome::Passed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioReport {
    pub scenario: String,
    /// Context id; `None` when the scenario never got a context.
    pub context: Option<String>,
    pub outcome: ScenarioOutcome,
    /// Set when teardown left resources behind, whatever the outcome.
    pub teardown_error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupReport {
    pub group: String,
    pub definition: Option<String>,
    /// Group setup failure (template or definition); no scenario ran.
    pub setup_error: Option<String>,
    pub scenarios: Vec<ScenarioReport>,
    /// Group-level cleanup failures, e.g. the definition could not be deleted.
    pub teardown_errors: Vec<String>,
}

impl GroupReport {
    pub fn new(group: &str) -> Self {
        Self {
            group: group.to_string(),
            definition: None,
            setup_error: None,
            scenarios: Vec::new(),
            teardown_errors: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cancelled: bool,
    pub groups: Vec<GroupReport>,
}

impl RunReport {
    fn scenarios(&self) -> impl Iterator<Item = &ScenarioReport> {
        self.groups.iter().flat_map(|g| g.scenarios.iter())
    }

    pub fn passed(&self) -> usize {
        self.scenarios().filter(|s| s.outcome.is_passed()).count()
    }

    pub fn failed(&self) -> usize {
        self.scenarios().filter(|s| !s.outcome.is_passed()).count()
    }

    /// Teardown failures at scenario or group level: possible leaked resources.
    pub fn leaks(&self) -> usize {
        self.scenarios().filter(|s| s.teardown_error.is_some()).count()
            + self.groups.iter().map(|g| g.teardown_errors.len()).sum::<usize>()
    }

    pub fn group_setup_failures(&self) -> usize {
        self.groups.iter().filter(|g| g.setup_error.is_some()).count()
    }

    pub fn is_success(&self) -> bool {
        !self.cancelled && self.failed() == 0 && self.leaks() == 0 && self.group_setup_failures() == 0
    }
}
