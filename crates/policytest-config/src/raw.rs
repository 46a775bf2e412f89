use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Raw YAML representation of the harness config file (policytest.yml).
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RawHarnessConfig {
    pub tenant_id: Option<String>,
    pub subscription_id: Option<String>,
    /// Region test resource groups are created in.
    pub location: Option<String>,
    /// Directory holding policy templates, relative to the config file.
    pub policies_dir: Option<String>,
    pub name_prefix: Option<String>,
    pub concurrency: Option<usize>,
    /// Parameter name → region → settings.
    #[serde(default)]
    pub parameters: BTreeMap<String, BTreeMap<String, RawRegionSettings>>,
    #[serde(default)]
    pub retry: RawRetry,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RawRegionSettings {
    pub virtual_appliance_ip_address: String,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RawRetry {
    pub ceiling_secs: Option<u64>,
    pub definition_propagation: Option<RawBudget>,
    pub role_propagation: Option<RawBudget>,
    pub compliance_scan: Option<RawBudget>,
    pub compliance_state: Option<RawBudget>,
    pub remediation: Option<RawBudget>,
    pub remediation_job: Option<RawBudget>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RawBudget {
    pub max_retries: u32,
    #[serde(default)]
    pub wait_secs: u64,
}
