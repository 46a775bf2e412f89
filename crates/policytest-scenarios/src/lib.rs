//! Built-in policy test groups.

pub mod registry;
pub mod route_deny;
pub mod route_table;

pub use registry::{GroupFactory, ScenarioError, ScenarioRegistry};
