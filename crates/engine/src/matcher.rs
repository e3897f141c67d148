//! Resource matcher: evaluates a rule's resource description against a raw object.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
use kpolicy_core::{GenerationError, ResourceDescription};
use kube::core::GroupVersionKind;
use regex::Regex;
use serde_json::Value as Json;

/// The slice of object metadata the matcher looks at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct ObjectFacts {
    name: String,
    namespace: Option<String>,
    labels: BTreeMap<String, String>,
}

fn parse_facts(raw: &[u8]) -> Result<ObjectFacts, GenerationError> {
    let json: Json = serde_json::from_slice(raw).map_err(|e| GenerationError::malformed(format!("invalid JSON: {}", e)))?;
    let meta = json
        .get("metadata")
        .and_then(Json::as_object)
        .ok_or_else(|| GenerationError::malformed("object missing metadata"))?;
    let name = meta
        .get("name")
        .and_then(Json::as_str)
        .ok_or_else(|| GenerationError::malformed("object missing metadata.name"))?
        .to_string();
    let namespace = meta.get("namespace").and_then(Json::as_str).map(str::to_string);
    let mut labels = BTreeMap::new();
    match meta.get("labels") {
        None | Some(Json::Null) => {}
        Some(Json::Object(map)) => {
            for (k, v) in map {
                let v = v
                    .as_str()
                    .ok_or_else(|| GenerationError::malformed(format!("label '{}' is not a string", k)))?;
                labels.insert(k.clone(), v.to_string());
            }
        }
        Some(_) => return Err(GenerationError::malformed("metadata.labels is not an object")),
    }
    Ok(ObjectFacts { name, namespace, labels })
}

/// Extract `metadata.name` from a raw object. For a Namespace this is the target
/// namespace of generation.
pub fn parse_name(raw: &[u8]) -> Result<String, GenerationError> {
    parse_facts(raw).map(|f| f.name)
}

/// `true` iff the object satisfies every constraint set in `description`.
///
/// An unset constraint matches anything. Errors mean the pair could not be
/// evaluated at all, which callers must not confuse with a non-match.
pub fn matches(raw: &[u8], description: &ResourceDescription, gvk: &GroupVersionKind) -> Result<bool, GenerationError> {
    if let Some(kind) = description.kind.as_deref().filter(|k| !k.is_empty()) {
        if kind != gvk.kind {
            return Ok(false);
        }
    }
    let facts = parse_facts(raw)?;

    if let Some(pattern) = description.name.as_deref().filter(|p| !p.is_empty()) {
        if !wildcard_match(pattern, &facts.name)? {
            return Ok(false);
        }
    }
    if let Some(pattern) = description.namespace.as_deref().filter(|p| !p.is_empty()) {
        match facts.namespace.as_deref() {
            Some(ns) if wildcard_match(pattern, ns)? => {}
            _ => return Ok(false),
        }
    }
    if let Some(selector) = &description.selector {
        if !selector_matches(selector, &facts.labels)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Shell-style match: `*` is any run of characters, `?` exactly one.
fn wildcard_match(pattern: &str, value: &str) -> Result<bool, GenerationError> {
    if !pattern.contains(['*', '?']) {
        return Ok(pattern == value);
    }
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    let mut buf = [0u8; 4];
    for c in pattern.chars() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => re.push_str(&regex::escape(c.encode_utf8(&mut buf))),
        }
    }
    re.push('$');
    let re = Regex::new(&re).map_err(|e| GenerationError::malformed(format!("pattern '{}': {}", pattern, e)))?;
    Ok(re.is_match(value))
}

fn selector_matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> Result<bool, GenerationError> {
    let exprs = selector.match_expressions.as_deref().unwrap_or_default();
    // Reject a malformed selector even when an earlier term already fails.
    for req in exprs {
        check_requirement(req)?;
    }
    if let Some(wanted) = &selector.match_labels {
        for (k, v) in wanted {
            if labels.get(k) != Some(v) {
                return Ok(false);
            }
        }
    }
    Ok(exprs.iter().all(|req| requirement_matches(req, labels)))
}

fn check_requirement(req: &LabelSelectorRequirement) -> Result<(), GenerationError> {
    if req.key.is_empty() {
        return Err(GenerationError::malformed("selector requirement has an empty key"));
    }
    let has_values = req.values.as_ref().map_or(false, |v| !v.is_empty());
    match req.operator.as_str() {
        "In" | "NotIn" if !has_values => Err(GenerationError::malformed(format!(
            "selector requirement '{}' {} needs at least one value",
            req.key, req.operator
        ))),
        "Exists" | "DoesNotExist" if has_values => Err(GenerationError::malformed(format!(
            "selector requirement '{}' {} must not have values",
            req.key, req.operator
        ))),
        "In" | "NotIn" | "Exists" | "DoesNotExist" => Ok(()),
        other => Err(GenerationError::malformed(format!("unknown selector operator '{}'", other))),
    }
}

fn requirement_matches(req: &LabelSelectorRequirement, labels: &BTreeMap<String, String>) -> bool {
    let values = req.values.as_deref().unwrap_or_default();
    let current = labels.get(&req.key);
    match req.operator.as_str() {
        "In" => current.map_or(false, |v| values.contains(v)),
        "NotIn" => current.map_or(true, |v| !values.contains(v)),
        "Exists" => current.is_some(),
        "DoesNotExist" => current.is_none(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ns_gvk() -> GroupVersionKind {
        GroupVersionKind::gvk("", "v1", "Namespace")
    }

    fn namespace(name: &str, labels: Json) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": { "name": name, "labels": labels }
        }))
        .unwrap()
    }

    fn by_kind(kind: &str) -> ResourceDescription {
        ResourceDescription { kind: Some(kind.into()), ..Default::default() }
    }

    fn requirement(key: &str, op: &str, values: &[&str]) -> LabelSelectorRequirement {
        LabelSelectorRequirement {
            key: key.into(),
            operator: op.into(),
            values: if values.is_empty() { None } else { Some(values.iter().map(|s| s.to_string()).collect()) },
        }
    }

    #[test]
    fn empty_description_matches_anything() {
        let raw = namespace("team-a", serde_json::json!({}));
        assert!(matches(&raw, &ResourceDescription::default(), &ns_gvk()).unwrap());
    }

    #[test]
    fn kind_is_compared_with_gvk() {
        let raw = namespace("team-a", serde_json::json!({}));
        assert!(matches(&raw, &by_kind("Namespace"), &ns_gvk()).unwrap());
        assert!(!matches(&raw, &by_kind("ConfigMap"), &ns_gvk()).unwrap());
    }

    #[test]
    fn name_supports_wildcards() {
        let raw = namespace("team-a", serde_json::json!({}));
        let mut d = by_kind("Namespace");
        for (pattern, expected) in [("team-*", true), ("team-?", true), ("team-a", true), ("ops", false), ("team.a", false), ("*-b", false)] {
            d.name = Some(pattern.into());
            assert_eq!(matches(&raw, &d, &ns_gvk()).unwrap(), expected, "pattern {}", pattern);
        }
    }

    #[test]
    fn namespace_constraint_requires_a_namespace() {
        let raw = namespace("team-a", serde_json::json!({}));
        let d = ResourceDescription { namespace: Some("*".into()), ..Default::default() };
        assert!(!matches(&raw, &d, &ns_gvk()).unwrap());

        let cm = serde_json::to_vec(&serde_json::json!({"metadata": {"name": "cm", "namespace": "prod-eu"}})).unwrap();
        let gvk = GroupVersionKind::gvk("", "v1", "ConfigMap");
        assert!(matches(&cm, &ResourceDescription { namespace: Some("prod-*".into()), ..Default::default() }, &gvk).unwrap());
    }

    #[test]
    fn match_labels_must_be_a_subset() {
        let raw = namespace("team-a", serde_json::json!({"tier": "dev", "owner": "a"}));
        let mut d = by_kind("Namespace");
        d.selector = Some(LabelSelector {
            match_labels: Some([("tier".to_string(), "dev".to_string())].into_iter().collect()),
            match_expressions: None,
        });
        assert!(matches(&raw, &d, &ns_gvk()).unwrap());

        d.selector = Some(LabelSelector {
            match_labels: Some([("tier".to_string(), "prod".to_string())].into_iter().collect()),
            match_expressions: None,
        });
        assert!(!matches(&raw, &d, &ns_gvk()).unwrap());
    }

    #[test]
    fn match_expressions_follow_kubernetes_semantics() {
        let labels: BTreeMap<String, String> = [("tier".to_string(), "dev".to_string())].into_iter().collect();
        assert!(requirement_matches(&requirement("tier", "In", &["dev", "qa"]), &labels));
        assert!(!requirement_matches(&requirement("tier", "NotIn", &["dev"]), &labels));
        assert!(requirement_matches(&requirement("zone", "NotIn", &["eu"]), &labels));
        assert!(requirement_matches(&requirement("tier", "Exists", &[]), &labels));
        assert!(requirement_matches(&requirement("zone", "DoesNotExist", &[]), &labels));
        assert!(!requirement_matches(&requirement("zone", "In", &["eu"]), &labels));
    }

    #[test]
    fn malformed_selector_is_an_error_not_a_mismatch() {
        let raw = namespace("team-a", serde_json::json!({}));
        let mut d = by_kind("Namespace");
        for req in [requirement("tier", "In", &[]), requirement("tier", "Exists", &["x"]), requirement("tier", "Near", &["x"])] {
            d.selector = Some(LabelSelector { match_labels: None, match_expressions: Some(vec![req]) });
            let err = matches(&raw, &d, &ns_gvk()).unwrap_err();
            assert!(matches!(err, GenerationError::MalformedResource(_)), "err={}", err);
        }
    }

    #[test]
    fn unparseable_payloads_are_errors() {
        let d = by_kind("Namespace");
        let payloads: [&[u8]; 4] = [
            b"not json",
            br#"{"kind":"Namespace"}"#,
            br#"{"metadata":{"labels":{}}}"#,
            br#"{"metadata":{"name":"a","labels":{"x":1}}}"#,
        ];
        for raw in payloads {
            assert!(matches!(matches(raw, &d, &ns_gvk()), Err(GenerationError::MalformedResource(_))));
        }
    }

    #[test]
    fn name_is_extracted_from_metadata() {
        assert_eq!(parse_name(&namespace("team-a", Json::Null)).unwrap(), "team-a");
        assert!(parse_name(b"{}").is_err());
    }
}
