use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::DomainError;

// ── Region ───────────────────────────────────────────────────────────────────

/// An Azure region name in its canonical form, e.g. `northeurope`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Region(String);

impl Region {
    pub fn parse(s: impl Into<String>) -> Result<Self, DomainError> {
        let s = s.into();
        let valid = !s.is_empty()
            && s.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
        if !valid {
            return Err(DomainError::InvalidRegion(s));
        }
        Ok(Region(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Region {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Region::parse(s)
    }
}

impl From<Region> for String {
    fn from(r: Region) -> String {
        r.0
    }
}

impl std::fmt::Display for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Per-region settings ──────────────────────────────────────────────────────

/// Settings a region-aware policy needs for one region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegionSettings {
    /// Next-hop address of the network virtual appliance for the region.
    pub virtual_appliance_ip_address: Ipv4Addr,
}

impl RegionSettings {
    pub fn new(region: &Region, appliance_address: &str) -> Result<Self, DomainError> {
        let addr = appliance_address.trim().parse::<Ipv4Addr>().map_err(|e| {
            DomainError::InvalidRegionSettings {
                region: region.to_string(),
                message: format!("virtual appliance address '{}': {}", appliance_address, e),
            }
        })?;
        if addr.is_unspecified() || addr.is_broadcast() {
            return Err(DomainError::InvalidRegionSettings {
                region: region.to_string(),
                message: format!("virtual appliance address '{}' is not routable", addr),
            });
        }
        Ok(Self { virtual_appliance_ip_address: addr })
    }
}

/// Region → settings, serialized as the object the policy parameter expects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegionalSettings(BTreeMap<Region, RegionSettings>);

impl RegionalSettings {
    pub fn insert(&mut self, region: Region, settings: RegionSettings) -> &mut Self {
        self.0.insert(region, settings);
        self
    }

    pub fn get(&self, region: &Region) -> Option<&RegionSettings> {
        self.0.get(region)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ── Assignment parameters ────────────────────────────────────────────────────

/// Parameter values passed to a policy assignment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterBag(BTreeMap<String, Value>);

impl ParameterBag {
    pub fn insert(&mut self, name: impl Into<String>, value: Value) -> &mut Self {
        self.0.insert(name.into(), value);
        self
    }

    pub fn insert_regional(&mut self, name: impl Into<String>, settings: &RegionalSettings) -> &mut Self {
        self.0.insert(name.into(), json!(settings));
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// ARM wire form: `{ "<name>": { "value": <v> }, … }`.
    pub fn to_arm(&self) -> Value {
        let map: serde_json::Map<String, Value> = self
            .0
            .iter()
            .map(|(k, v)| (k.clone(), json!({ "value": v })))
            .collect();
        Value::Object(map)
    }
}
