use std::path::{Path, PathBuf};

use policytest_domain::PolicyDocument;
use serde_json::Value;
use tracing::debug;

use crate::error::ConfigError;

/// Where a test group's policy document comes from.
#[derive(Debug, Clone)]
pub enum PolicySource {
    /// Document supplied in code.
    Inline(Value),
    /// Explicit template path; relative paths resolve against the policies dir.
    Template(PathBuf),
    /// Template named after the calling test file: `route_table.rs` →
    /// `<policies_dir>/route_table.json`. Pass `file!()`.
    Convention { caller_file: String },
}

impl PolicySource {
    pub fn for_caller(caller_file: &str) -> Self {
        PolicySource::Convention { caller_file: caller_file.to_string() }
    }

    /// Human-readable origin, used in logs and error messages.
    pub fn describe(&self) -> String {
        match self {
            PolicySource::Inline(_) => "<inline>".to_string(),
            PolicySource::Template(p) => p.display().to_string(),
            PolicySource::Convention { caller_file } => format!("convention:{}", caller_file),
        }
    }
}

/// Suffixes stripped from a test file stem before looking up its template.
const TEST_SUFFIXES: &[&str] = &[".tests", ".test", "_tests", "_test"];

/// Template path for a calling test file.
pub fn template_for_caller(policies_dir: &Path, caller_file: &str) -> PathBuf {
    let stem = Path::new(caller_file)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(caller_file);
    let stem = TEST_SUFFIXES
        .iter()
        .find_map(|suffix| stem.strip_suffix(suffix))
        .unwrap_or(stem);
    policies_dir.join(format!("{}.json", stem))
}

/// Resolve a policy source to a validated document.
pub fn load_policy(source: &PolicySource, policies_dir: &Path) -> Result<PolicyDocument, ConfigError> {
    match source {
        PolicySource::Inline(v) => Ok(PolicyDocument::from_value(v.clone())?),
        PolicySource::Template(p) => {
            let path = if p.is_absolute() { p.clone() } else { policies_dir.join(p) };
            if !path.exists() {
                return Err(ConfigError::TemplateNotFound {
                    caller: p.display().to_string(),
                    path: path.display().to_string(),
                });
            }
            read_template(&path)
        }
        PolicySource::Convention { caller_file } => {
            let path = template_for_caller(policies_dir, caller_file);
            if !path.exists() {
                return Err(ConfigError::TemplateNotFound {
                    caller: caller_file.clone(),
                    path: path.display().to_string(),
                });
            }
            read_template(&path)
        }
    }
}

/// Read and validate a single template file.
pub fn read_template(path: &Path) -> Result<PolicyDocument, ConfigError> {
    debug!("Loading policy template {}", path.display());
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    let value: Value = serde_json::from_str(&content).map_err(|e| ConfigError::JsonParse {
        path: path.display().to_string(),
        source: e,
    })?;
    PolicyDocument::from_value(value).map_err(|e| ConfigError::InvalidTemplate {
        path: path.display().to_string(),
        source: e,
    })
}
