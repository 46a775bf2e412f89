use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use policytest_domain::{Region, RegionSettings, RegionalSettings};
use tracing::debug;

use crate::error::ConfigError;
use crate::raw::{RawBudget, RawHarnessConfig, RawRetry};

pub const DEFAULT_LOCATION: &str = "northeurope";
pub const DEFAULT_NAME_PREFIX: &str = "policytest";
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Bounded retry budget for one eventually-consistent protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    /// Retries after the first attempt; the operation runs at most `max_retries + 1` times.
    pub max_retries: u32,
    /// Pause between attempts.
    pub wait: Duration,
}

impl RetryBudget {
    pub const fn new(max_retries: u32, wait_secs: u64) -> Self {
        Self { max_retries, wait: Duration::from_secs(wait_secs) }
    }

    /// Longest time the budget can spend waiting.
    pub fn worst_case(&self) -> Duration {
        self.wait * self.max_retries
    }
}

impl From<RawBudget> for RetryBudget {
    fn from(raw: RawBudget) -> Self {
        RetryBudget::new(raw.max_retries, raw.wait_secs)
    }
}

/// Retry budgets for every protocol the harness polls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Upper bound on the wall-clock time of any single retry loop.
    pub ceiling: Option<Duration>,
    pub definition_propagation: RetryBudget,
    pub role_propagation: RetryBudget,
    pub compliance_scan: RetryBudget,
    pub compliance_state: RetryBudget,
    pub remediation: RetryBudget,
    pub remediation_job: RetryBudget,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            ceiling:                None,
            definition_propagation: RetryBudget::new(10, 30),
            role_propagation:       RetryBudget::new(10, 30),
            compliance_scan:        RetryBudget::new(3, 0),
            compliance_state:       RetryBudget::new(30, 60),
            remediation:            RetryBudget::new(3, 30),
            remediation_job:        RetryBudget::new(40, 30),
        }
    }
}

impl RetryConfig {
    fn from_raw(raw: RawRetry) -> Self {
        let d = RetryConfig::default();
        Self {
            ceiling:                raw.ceiling_secs.map(Duration::from_secs),
            definition_propagation: raw.definition_propagation.map_or(d.definition_propagation, Into::into),
            role_propagation:       raw.role_propagation.map_or(d.role_propagation, Into::into),
            compliance_scan:        raw.compliance_scan.map_or(d.compliance_scan, Into::into),
            compliance_state:       raw.compliance_state.map_or(d.compliance_state, Into::into),
            remediation:            raw.remediation.map_or(d.remediation, Into::into),
            remediation_job:        raw.remediation_job.map_or(d.remediation_job, Into::into),
        }
    }
}

/// Validated harness configuration.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub tenant_id: Option<String>,
    pub subscription_id: Option<String>,
    pub location: Region,
    pub policies_dir: PathBuf,
    /// Prefix of every remote object name the harness creates.
    pub name_prefix: String,
    pub concurrency: usize,
    /// Region-aware assignment parameters, by parameter name.
    pub parameters: BTreeMap<String, RegionalSettings>,
    pub retry: RetryConfig,
}

impl HarnessConfig {
    /// Built-in defaults, with templates looked up under `policies_dir`.
    pub fn with_defaults(policies_dir: &Path) -> Result<Self, ConfigError> {
        let raw = RawHarnessConfig {
            policies_dir: Some(policies_dir.display().to_string()),
            ..Default::default()
        };
        convert_config(raw, Path::new(""), Path::new("<defaults>"))
    }
}

/// Load and validate a harness config file.
///
/// Relative `policies_dir` values resolve against the config file's directory.
pub fn load_config(path: &Path) -> Result<HarnessConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    let raw: RawHarnessConfig = serde_yaml::from_str(&content).map_err(|e| ConfigError::YamlParse {
        path: path.display().to_string(),
        source: e,
    })?;
    debug!("Loaded harness config from {}", path.display());
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    convert_config(raw, base, path)
}

pub(crate) fn convert_config(
    raw: RawHarnessConfig,
    base: &Path,
    path: &Path,
) -> Result<HarnessConfig, ConfigError> {
    let location = Region::parse(raw.location.as_deref().unwrap_or(DEFAULT_LOCATION))?;

    let name_prefix = raw.name_prefix.unwrap_or_else(|| DEFAULT_NAME_PREFIX.to_string());
    validate_prefix(&name_prefix, path)?;

    let concurrency = raw.concurrency.unwrap_or(DEFAULT_CONCURRENCY);
    if concurrency == 0 {
        return Err(ConfigError::Conversion {
            path: path.display().to_string(),
            message: "concurrency must be at least 1".into(),
        });
    }

    let policies_dir = base.join(raw.policies_dir.as_deref().unwrap_or("policies"));

    let mut parameters = BTreeMap::new();
    for (param, regions) in raw.parameters {
        let mut settings = RegionalSettings::default();
        for (region, raw_settings) in regions {
            let region = Region::parse(region)?;
            let s = RegionSettings::new(&region, &raw_settings.virtual_appliance_ip_address)?;
            settings.insert(region, s);
        }
        parameters.insert(param, settings);
    }

    Ok(HarnessConfig {
        tenant_id: raw.tenant_id.filter(|s| !s.is_empty()),
        subscription_id: raw.subscription_id.filter(|s| !s.is_empty()),
        location,
        policies_dir,
        name_prefix,
        concurrency,
        parameters,
        retry: RetryConfig::from_raw(raw.retry),
    })
}

/// Prefixes end up in resource group, assignment and definition names; keep
/// them short enough that `<prefix>-<32 hex>` stays within the 64-char limit.
fn validate_prefix(prefix: &str, path: &Path) -> Result<(), ConfigError> {
    let valid = !prefix.is_empty()
        && prefix.len() <= 24
        && prefix.starts_with(|c: char| c.is_ascii_lowercase())
        && prefix.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if !valid {
        return Err(ConfigError::Conversion {
            path: path.display().to_string(),
            message: format!(
                "name_prefix '{}' must be 1-24 chars of lowercase letters, digits or '-', starting with a letter",
                prefix
            ),
        });
    }
    Ok(())
}
