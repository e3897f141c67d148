use thiserror::Error;

use crate::policy::GeneratorKind;

/// Everything that can go wrong while processing one rule.
///
/// None of these abort a policy run; the engine reports them per rule and moves on.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("rule #{index} '{rule}' in policy '{policy}' has invalid structure: {reason}")]
    RuleStructure { policy: String, index: usize, rule: String, reason: String },

    #[error("resource cannot be evaluated: {0}")]
    MalformedResource(String),

    #[error("generator for '{kind}/{name}' is invalid: {reason}")]
    GeneratorStructure { kind: String, name: String, reason: String },

    #[error("unsupported generator kind '{0}'")]
    UnsupportedGeneratorKind(String),

    /// `cause` is the client error rendered with its whole context chain.
    #[error("unable to apply generator for {kind} '{namespace}/{name}': {cause}")]
    Dispatch {
        kind: GeneratorKind,
        namespace: String,
        name: String,
        cause: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl GenerationError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedResource(msg.into())
    }

    /// Short stable label, used for metrics and log fields.
    pub fn class(&self) -> &'static str {
        match self {
            Self::RuleStructure { .. } => "rule_structure",
            Self::MalformedResource(_) => "malformed_resource",
            Self::GeneratorStructure { .. } => "generator_structure",
            Self::UnsupportedGeneratorKind(_) => "unsupported_generator_kind",
            Self::Dispatch { .. } => "dispatch",
        }
    }
}
