//! Generator dispatch and the per-policy generation loop.

use std::time::Instant;

use kpolicy_core::{validate_rule, ClusterClient, Generation, GenerationError, GeneratorKind, Policy, Rule};
use kube::core::GroupVersionKind;
use metrics::histogram;
use serde::Serialize;
use tracing::debug;

use crate::matcher::{matches, parse_name};
use crate::observer::{GenerationObserver, Outcome, RuleEvent};

/// The only trigger kind generation runs for.
pub const TRIGGER_KIND: &str = "Namespace";

/// Record of an applied generator. Informational only.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationResponse {
    pub generator: Generation,
    pub namespace: String,
}

enum Step {
    NotApplicable,
    NoGenerator,
    Applied(GenerationResponse),
}

/// Create the resource declared by `generator` inside `namespace`.
///
/// `generator` must already have passed [`Generation::validate`]. Kinds outside
/// [`GeneratorKind`] fail without touching the client.
pub async fn dispatch(generator: &Generation, namespace: &str, client: &dyn ClusterClient) -> Result<(), GenerationError> {
    let kind: GeneratorKind = generator.kind.parse()?;
    let t0 = Instant::now();
    let res = match kind {
        GeneratorKind::ConfigMap => client.create_config_map(generator, namespace).await,
        GeneratorKind::Secret => client.create_secret(generator, namespace).await,
    };
    histogram!("generation_dispatch_ms", t0.elapsed().as_secs_f64() * 1000.0, "kind" => kind.as_str());
    res.map_err(|e| GenerationError::Dispatch {
        kind,
        namespace: namespace.to_string(),
        name: generator.name.clone(),
        cause: format!("{:#}", e),
        source: e.into(),
    })
}

async fn process_rule(
    policy: &str,
    index: usize,
    rule: &Rule,
    raw: &[u8],
    gvk: &GroupVersionKind,
    client: &dyn ClusterClient,
) -> Result<Step, GenerationError> {
    validate_rule(policy, index, rule)?;
    if !matches(raw, &rule.resource, gvk)? {
        return Ok(Step::NotApplicable);
    }
    let Some(generator) = rule.generation.as_ref() else {
        return Ok(Step::NoGenerator);
    };
    generator.validate()?;
    let namespace = parse_name(raw)?;
    dispatch(generator, &namespace, client).await?;
    Ok(Step::Applied(GenerationResponse { generator: generator.clone(), namespace }))
}

/// Apply the generate rules of `policy` to a newly created Namespace.
///
/// Rules run one after another in declaration order. A failing rule is reported to
/// `observer` and never stops the rules after it; nothing already created is rolled
/// back. Triggers of any kind other than [`TRIGGER_KIND`] are ignored outright.
pub async fn generate(
    policy: &Policy,
    raw: &[u8],
    gvk: &GroupVersionKind,
    client: &dyn ClusterClient,
    observer: &dyn GenerationObserver,
) -> Vec<GenerationResponse> {
    if gvk.kind != TRIGGER_KIND {
        debug!(policy = %policy.name, kind = %gvk.kind, "generation only runs for Namespace triggers");
        return Vec::new();
    }

    let mut applied = Vec::new();
    for (index, rule) in policy.rules.iter().enumerate() {
        let step = process_rule(&policy.name, index, rule, raw, gvk, client).await;
        let report = |outcome: Outcome<'_>| {
            observer.on_rule(&RuleEvent { policy: &policy.name, index, rule: &rule.name, outcome })
        };
        match step {
            Ok(Step::NotApplicable) => report(Outcome::NotApplicable),
            Ok(Step::NoGenerator) => report(Outcome::NoGenerator),
            Ok(Step::Applied(resp)) => {
                report(Outcome::Applied(&resp));
                applied.push(resp);
            }
            Err(err) => report(Outcome::Failed(&err)),
        }
    }
    applied
}
