use std::collections::BTreeMap;

use policytest_config::HarnessConfig;
use policytest_harness::TestGroup;
use thiserror::Error;

use crate::{route_deny, route_table};

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("unknown test group '{name}' (known: {known})")]
    UnknownGroup { name: String, known: String },

    #[error("invalid parameters for group '{group}': {source}")]
    Parameters {
        group: &'static str,
        #[source]
        source: policytest_domain::DomainError,
    },
}

/// Builds a group from the harness config (parameters come from there).
pub type GroupFactory = fn(&HarnessConfig) -> Result<TestGroup, ScenarioError>;

/// Named test groups the CLI can run.
#[derive(Default)]
pub struct ScenarioRegistry {
    groups: BTreeMap<&'static str, GroupFactory>,
}

impl ScenarioRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every group shipped with the harness.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry
            .register(route_table::GROUP, route_table::group)
            .register(route_deny::GROUP, route_deny::group);
        registry
    }

    /// Register a group factory. Returns `&mut self` for chaining.
    pub fn register(&mut self, name: &'static str, factory: GroupFactory) -> &mut Self {
        self.groups.insert(name, factory);
        self
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.groups.keys().copied().collect()
    }

    pub fn build(&self, name: &str, config: &HarnessConfig) -> Result<TestGroup, ScenarioError> {
        let factory = self.groups.get(name).ok_or_else(|| ScenarioError::UnknownGroup {
            name: name.to_string(),
            known: self.names().join(", "),
        })?;
        factory(config)
    }

    /// Build the selected groups, or all of them when `selected` is empty.
    pub fn build_selected(&self, config: &HarnessConfig, selected: &[String]) -> Result<Vec<TestGroup>, ScenarioError> {
        if selected.is_empty() {
            return self.groups.values().map(|factory| factory(config)).collect();
        }
        selected.iter().map(|name| self.build(name, config)).collect()
    }
}
