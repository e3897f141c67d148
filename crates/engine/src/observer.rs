//! Per-rule diagnostics sink injected into the orchestrator.

use kpolicy_core::GenerationError;
use metrics::counter;
use tracing::{debug, info, trace, warn};

use crate::GenerationResponse;

/// How processing of one rule ended.
#[derive(Debug)]
pub enum Outcome<'a> {
    /// The resource does not satisfy the rule's resource description.
    NotApplicable,
    /// The rule matched but carries no generator.
    NoGenerator,
    Applied(&'a GenerationResponse),
    Failed(&'a GenerationError),
}

#[derive(Debug)]
pub struct RuleEvent<'a> {
    pub policy: &'a str,
    /// Position of the rule in its policy.
    pub index: usize,
    pub rule: &'a str,
    pub outcome: Outcome<'a>,
}

pub trait GenerationObserver: Send + Sync {
    fn on_rule(&self, event: &RuleEvent<'_>);
}

/// Default observer: structured `tracing` events plus `metrics` counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl GenerationObserver for TracingObserver {
    fn on_rule(&self, ev: &RuleEvent<'_>) {
        match &ev.outcome {
            Outcome::NotApplicable => {
                debug!(policy = ev.policy, rule_index = ev.index, rule = ev.rule, "rule is not applicable to the resource");
                counter!("generation_skipped_total", 1u64);
            }
            Outcome::NoGenerator => {
                trace!(policy = ev.policy, rule_index = ev.index, rule = ev.rule, "rule has nothing to generate");
            }
            Outcome::Applied(resp) => {
                info!(
                    policy = ev.policy,
                    rule_index = ev.index,
                    rule = ev.rule,
                    kind = %resp.generator.kind,
                    name = %resp.generator.name,
                    namespace = %resp.namespace,
                    "generator applied"
                );
                counter!("generation_applied_total", 1u64, "kind" => resp.generator.kind.clone());
            }
            Outcome::Failed(err) => {
                warn!(
                    policy = ev.policy,
                    rule_index = ev.index,
                    rule = ev.rule,
                    class = err.class(),
                    error = %err,
                    "rule failed"
                );
                counter!("generation_failed_total", 1u64, "class" => err.class());
            }
        }
    }
}
