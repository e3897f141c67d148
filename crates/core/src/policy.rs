//! Policy data model and structural validation.
//!
//! Validation here is purely structural: nothing is looked up in the cluster.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::GenerationError;

static DNS1123_SUBDOMAIN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$").expect("static regex")
});
static DNS1123_LABEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("static regex"));

fn check_subdomain(what: &str, value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err(format!("{} is empty", what));
    }
    if value.len() > 253 || !DNS1123_SUBDOMAIN.is_match(value) {
        return Err(format!("{} '{}' is not a valid DNS-1123 subdomain", what, value));
    }
    Ok(())
}

fn check_label(what: &str, value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err(format!("{} is empty", what));
    }
    if value.len() > 63 || !DNS1123_LABEL.is_match(value) {
        return Err(format!("{} '{}' is not a valid DNS-1123 label", what, value));
    }
    Ok(())
}

/// A named, ordered set of rules. Rule order is generation order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub name: String,
    pub rules: Vec<Rule>,
}

/// CRD-shaped policy document as written by operators.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyManifest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: PolicySpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicySpec {
    #[serde(default)]
    pub rules: Vec<Rule>,
}

impl From<PolicyManifest> for Policy {
    fn from(m: PolicyManifest) -> Self {
        Policy { name: m.metadata.name.unwrap_or_default(), rules: m.spec.rules }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub resource: ResourceDescription,
    #[serde(default, rename = "mutate", skip_serializing_if = "Option::is_none")]
    pub mutation: Option<Mutation>,
    #[serde(default, rename = "validate", skip_serializing_if = "Option::is_none")]
    pub validation: Option<Validation>,
    #[serde(default, rename = "generate", skip_serializing_if = "Option::is_none")]
    pub generation: Option<Generation>,
}

/// Predicate over kind, name, namespace and labels. Unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceDescription {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Name pattern; `*` and `?` wildcards.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Namespace pattern; `*` and `?` wildcards.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,
}

impl ResourceDescription {
    pub fn is_empty(&self) -> bool {
        self.kind.as_deref().map_or(true, str::is_empty)
            && self.name.as_deref().map_or(true, str::is_empty)
            && self.namespace.as_deref().map_or(true, str::is_empty)
            && self.selector.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub patches: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overlay: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Validation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub pattern: serde_json::Value,
}

/// Declares a dependent ConfigMap or Secret to create in a matching namespace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Generation {
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copy_from: Option<CopyFrom>,
}

/// Existing object whose data seeds the generated one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyFrom {
    pub namespace: String,
    pub name: String,
}

/// Generator kinds this engine knows how to create.
///
/// The declarative schema keeps `kind` a free string; anything outside this set
/// fails to parse with [`GenerationError::UnsupportedGeneratorKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GeneratorKind {
    ConfigMap,
    Secret,
}

impl GeneratorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GeneratorKind::ConfigMap => "ConfigMap",
            GeneratorKind::Secret => "Secret",
        }
    }
}

impl fmt::Display for GeneratorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GeneratorKind {
    type Err = GenerationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ConfigMap" => Ok(GeneratorKind::ConfigMap),
            "Secret" => Ok(GeneratorKind::Secret),
            other => Err(GenerationError::UnsupportedGeneratorKind(other.to_string())),
        }
    }
}

impl Rule {
    /// Structural check of the rule itself. The generator is checked separately by
    /// [`Generation::validate`].
    ///
    /// A rule without a generator is normally a silent no-op for generation. The one
    /// exception is a rule declaring no action at all: it has no generator either, yet
    /// it fails here and is reported as a rule-structure error.
    pub fn validate(&self) -> Result<(), String> {
        if self.mutation.is_none() && self.validation.is_none() && self.generation.is_none() {
            return Err("the rule declares no mutate, validate or generate action".into());
        }
        if let Some(m) = &self.mutation {
            if m.patches.is_empty() && m.overlay.is_none() {
                return Err("mutate declares neither patches nor overlay".into());
            }
        }
        if let Some(v) = &self.validation {
            if v.pattern.is_null() {
                return Err("validate declares no pattern".into());
            }
        }
        if self.generation.is_some() && self.resource.is_empty() {
            return Err("generate requires a resource description (kind, name, namespace or selector)".into());
        }
        Ok(())
    }
}

/// [`Rule::validate`] with enough context to attribute the failure.
pub fn validate_rule(policy: &str, index: usize, rule: &Rule) -> Result<(), GenerationError> {
    rule.validate().map_err(|reason| GenerationError::RuleStructure {
        policy: policy.to_string(),
        index,
        rule: rule.name.clone(),
        reason,
    })
}

impl Generation {
    pub fn validate(&self) -> Result<(), GenerationError> {
        self.check().map_err(|reason| GenerationError::GeneratorStructure {
            kind: self.kind.clone(),
            name: self.name.clone(),
            reason,
        })
    }

    fn check(&self) -> Result<(), String> {
        if self.kind.trim().is_empty() {
            return Err("kind is empty".into());
        }
        check_subdomain("name", &self.name)?;
        if let Some(src) = &self.copy_from {
            check_label("copyFrom.namespace", &src.namespace)?;
            check_subdomain("copyFrom.name", &src.name)?;
        }
        Ok(())
    }
}
