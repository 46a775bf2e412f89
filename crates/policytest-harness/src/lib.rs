pub mod assignment;
pub mod compliance;
pub mod context;
pub mod error;
pub mod registrar;
pub mod remediation;
pub mod report;
pub mod resources;
pub mod retry;
pub mod runner;
pub mod sweep;

pub use context::{Harness, Phase, TestContext};
pub use error::{HarnessError, TeardownFailure};
pub use report::{GroupReport, RunReport, ScenarioOutcome, ScenarioReport};
pub use retry::{Attempt, RetryError, RetryExhausted, RetryPolicy};
pub use runner::{run_group, run_groups, Scenario, TestGroup};
pub use sweep::{sweep, SweepReport, SweepRequest};
