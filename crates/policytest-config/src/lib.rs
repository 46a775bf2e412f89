mod raw;
mod loader;
mod template;
pub mod error;

pub use error::ConfigError;
pub use loader::{load_config, HarnessConfig, RetryBudget, RetryConfig, DEFAULT_LOCATION, DEFAULT_NAME_PREFIX};
pub use template::{load_policy, read_template, template_for_caller, PolicySource};
