use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::DomainError;
use crate::params::ParameterBag;

// ── Effects ──────────────────────────────────────────────────────────────────

/// The `then.effect` of a policy rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PolicyEffect {
    Append,
    Modify,
    Deny,
    DenyAction,
    Audit,
    AuditIfNotExists,
    DeployIfNotExists,
    Disabled,
}

/// How the engine applies an effect, and therefore how a test observes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectClass {
    /// Request is rewritten in flight (`append`, `modify`).
    SyncMutating,
    /// Request is rejected in flight (`deny`, `denyAction`).
    SyncDenying,
    /// Only reported through compliance state (`audit`, `auditIfNotExists`).
    AsyncAuditing,
    /// Reported through compliance state and fixable by remediation.
    AsyncRemediable,
    Disabled,
}

impl PolicyEffect {
    /// Parse an effect name. The engine matches effect names case-insensitively.
    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s.trim().to_ascii_lowercase().as_str() {
            "append"            => Ok(PolicyEffect::Append),
            "modify"            => Ok(PolicyEffect::Modify),
            "deny"              => Ok(PolicyEffect::Deny),
            "denyaction"        => Ok(PolicyEffect::DenyAction),
            "audit"             => Ok(PolicyEffect::Audit),
            "auditifnotexists"  => Ok(PolicyEffect::AuditIfNotExists),
            "deployifnotexists" => Ok(PolicyEffect::DeployIfNotExists),
            "disabled"          => Ok(PolicyEffect::Disabled),
            _                   => Err(DomainError::UnknownEffect(s.to_string())),
        }
    }

    pub fn class(&self) -> EffectClass {
        match self {
            PolicyEffect::Append | PolicyEffect::Modify => EffectClass::SyncMutating,
            PolicyEffect::Deny | PolicyEffect::DenyAction => EffectClass::SyncDenying,
            PolicyEffect::Audit | PolicyEffect::AuditIfNotExists => EffectClass::AsyncAuditing,
            PolicyEffect::DeployIfNotExists => EffectClass::AsyncRemediable,
            PolicyEffect::Disabled => EffectClass::Disabled,
        }
    }

    /// Effects whose remediation runs as the assignment's managed identity.
    pub fn requires_identity(&self) -> bool {
        matches!(self, PolicyEffect::Modify | PolicyEffect::DeployIfNotExists)
    }
}

impl std::fmt::Display for PolicyEffect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PolicyEffect::Append => "append",
            PolicyEffect::Modify => "modify",
            PolicyEffect::Deny => "deny",
            PolicyEffect::DenyAction => "denyAction",
            PolicyEffect::Audit => "audit",
            PolicyEffect::AuditIfNotExists => "auditIfNotExists",
            PolicyEffect::DeployIfNotExists => "deployIfNotExists",
            PolicyEffect::Disabled => "disabled",
        };
        write!(f, "{}", s)
    }
}

impl std::fmt::Display for EffectClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EffectClass::SyncMutating => "synchronous-mutating",
            EffectClass::SyncDenying => "synchronous-denying",
            EffectClass::AsyncAuditing => "asynchronous-auditing",
            EffectClass::AsyncRemediable => "asynchronous-remediable",
            EffectClass::Disabled => "disabled",
        };
        write!(f, "{}", s)
    }
}

// ── Document ─────────────────────────────────────────────────────────────────

/// A policy definition document as submitted to the management API.
///
/// The rule body is opaque to the harness. Only the top-level `name` and `id`
/// fields are ever rewritten; everything else is read, never modified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PolicyDocument(Value);

impl PolicyDocument {
    /// Validate the shape of a document. Bare documents (`{"policyRule": …}`)
    /// are wrapped into `{"properties": …}` so both layouts are accepted.
    pub fn from_value(value: Value) -> Result<Self, DomainError> {
        let mut value = value;
        if !value.is_object() {
            return Err(DomainError::MalformedPolicy("document is not a JSON object".into()));
        }
        if value.get("properties").is_none() && value.get("policyRule").is_some() {
            value = json!({ "properties": value });
        }
        let rule = &value["properties"]["policyRule"];
        if !rule.is_object() {
            return Err(DomainError::MalformedPolicy("missing properties.policyRule".into()));
        }
        if !rule["if"].is_object() {
            return Err(DomainError::MalformedPolicy("policyRule has no 'if' condition".into()));
        }
        if rule["then"]["effect"].as_str().is_none() {
            return Err(DomainError::MalformedPolicy("policyRule.then.effect is not a string".into()));
        }
        Ok(PolicyDocument(value))
    }

    pub fn name(&self) -> Option<&str> {
        self.0["name"].as_str()
    }

    pub fn display_name(&self) -> Option<&str> {
        self.0["properties"]["displayName"].as_str()
    }

    pub fn properties(&self) -> &Value {
        &self.0["properties"]
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// A copy with `name` and `id` replaced; the rule body is untouched.
    pub fn renamed(&self, name: &str, id: &str) -> PolicyDocument {
        let mut value = self.0.clone();
        value["name"] = json!(name);
        value["id"] = json!(id);
        PolicyDocument(value)
    }

    /// The effect exactly as written, possibly a parameter expression.
    pub fn raw_effect(&self) -> &str {
        self.0["properties"]["policyRule"]["then"]["effect"]
            .as_str()
            .unwrap_or_default()
    }

    /// Resolve the effect, following a `[parameters('x')]` reference into the
    /// assignment parameters and then the definition's `defaultValue`.
    pub fn effect(&self, assignment: &ParameterBag) -> Result<PolicyEffect, DomainError> {
        let raw = self.raw_effect();
        let Some(param) = parameter_reference(raw) else {
            return PolicyEffect::parse(raw);
        };
        if let Some(v) = assignment.get(param).and_then(|v| v.as_str()) {
            return PolicyEffect::parse(v);
        }
        let default = self.0["properties"]["parameters"][param]["defaultValue"].as_str();
        match default {
            Some(v) => PolicyEffect::parse(v),
            None => Err(DomainError::UnresolvedEffect {
                policy: self.name().unwrap_or("<unnamed>").to_string(),
                parameter: param.to_string(),
            }),
        }
    }

    /// Role definitions the remediation identity needs, from
    /// `then.details.roleDefinitionIds`.
    pub fn role_definition_ids(&self) -> Vec<String> {
        self.0["properties"]["policyRule"]["then"]["details"]["roleDefinitionIds"]
            .as_array()
            .map(|ids| {
                ids.iter()
                    .filter_map(|v| v.as_str())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// `"[parameters('effect')]"` → `Some("effect")`.
fn parameter_reference(expr: &str) -> Option<&str> {
    let inner = expr.trim().strip_prefix("[parameters(")?.strip_suffix(")]")?;
    let inner = inner.trim();
    inner
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
}

/// Re-scope a role definition id to a subscription.
///
/// Policy documents list roles tenant-relative
/// (`/providers/Microsoft.Authorization/roleDefinitions/<guid>`); role
/// assignments require the subscription-scoped form.
pub fn subscription_role_definition_id(subscription_id: &str, role_definition_id: &str) -> String {
    let guid = role_definition_id
        .rsplit('/')
        .next()
        .unwrap_or(role_definition_id);
    format!(
        "/subscriptions/{}/providers/Microsoft.Authorization/roleDefinitions/{}",
        subscription_id, guid
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dine_doc() -> Value {
        json!({
            "name": "route-table-nva",
            "properties": {
                "displayName": "Route tables must route 0.0.0.0/0 to the regional appliance",
                "mode": "All",
                "parameters": {
                    "effect": { "type": "String", "defaultValue": "DeployIfNotExists" }
                },
                "policyRule": {
                    "if": { "field": "type", "equals": "Microsoft.Network/routeTables" },
                    "then": {
                        "effect": "[parameters('effect')]",
                        "details": {
                            "roleDefinitionIds": [
                                "/providers/Microsoft.Authorization/roleDefinitions/4d97b98b-1d4f-4787-a291-c67834d212e7"
                            ]
                        }
                    }
                }
            }
        })
    }

    #[test]
    fn parameter_reference_extracts_name() {
        assert_eq!(parameter_reference("[parameters('effect')]"), Some("effect"));
        assert_eq!(parameter_reference(" [parameters( 'x' )] "), Some("x"));
        assert_eq!(parameter_reference("deny"), None);
    }

    #[test]
    fn effect_falls_back_to_default_value() {
        let doc = PolicyDocument::from_value(dine_doc()).unwrap();
        let effect = doc.effect(&ParameterBag::default()).unwrap();
        assert_eq!(effect, PolicyEffect::DeployIfNotExists);
        assert!(effect.requires_identity());
    }

    #[test]
    fn assignment_parameter_overrides_default() {
        let doc = PolicyDocument::from_value(dine_doc()).unwrap();
        let mut params = ParameterBag::default();
        params.insert("effect", json!("AuditIfNotExists"));
        let effect = doc.effect(&params).unwrap();
        assert_eq!(effect.class(), EffectClass::AsyncAuditing);
        assert!(!effect.requires_identity());
    }

    #[test]
    fn unresolved_effect_parameter_is_an_error() {
        let mut raw = dine_doc();
        raw["properties"]["parameters"] = json!({});
        let doc = PolicyDocument::from_value(raw).unwrap();
        let err = doc.effect(&ParameterBag::default()).unwrap_err();
        assert!(matches!(err, DomainError::UnresolvedEffect { .. }), "got: {}", err);
    }

    #[test]
    fn bare_document_is_wrapped() {
        let bare = dine_doc()["properties"].clone();
        let doc = PolicyDocument::from_value(bare).unwrap();
        assert!(doc.properties()["policyRule"].is_object());
    }

    #[test]
    fn missing_rule_is_malformed() {
        let err = PolicyDocument::from_value(json!({ "properties": {} })).unwrap_err();
        assert!(err.to_string().contains("policyRule"), "got: {}", err);
    }

    #[test]
    fn renamed_only_touches_name_and_id() {
        let doc = PolicyDocument::from_value(dine_doc()).unwrap();
        let renamed = doc.renamed("policytest-abc", "/subscriptions/s/providers/x/policytest-abc");
        assert_eq!(renamed.name(), Some("policytest-abc"));
        assert_eq!(renamed.as_value()["id"], "/subscriptions/s/providers/x/policytest-abc");
        assert_eq!(renamed.properties(), doc.properties());
    }

    #[test]
    fn role_ids_are_rescoped_to_subscription() {
        let doc = PolicyDocument::from_value(dine_doc()).unwrap();
        let roles = doc.role_definition_ids();
        assert_eq!(roles.len(), 1);
        assert_eq!(
            subscription_role_definition_id("sub-1", &roles[0]),
            "/subscriptions/sub-1/providers/Microsoft.Authorization/roleDefinitions/4d97b98b-1d4f-4787-a291-c67834d212e7"
        );
    }
}
