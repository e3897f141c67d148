//! kpolicy core: policy data model, structural validation and the error taxonomy
//! shared by the generation engine and the cluster client.

#![forbid(unsafe_code)]

pub mod error;
pub mod policy;

pub use error::GenerationError;
pub use policy::{
    validate_rule, CopyFrom, Generation, GeneratorKind, Mutation, Policy, PolicyManifest, PolicySpec,
    ResourceDescription, Rule, Validation,
};

/// Creation operations the generation engine delegates to.
///
/// Implementations are expected to leave no side effect behind when they return an error.
#[async_trait::async_trait]
pub trait ClusterClient: Send + Sync {
    /// Create a ConfigMap named after `generation` inside `namespace`.
    async fn create_config_map(&self, generation: &Generation, namespace: &str) -> anyhow::Result<()>;

    /// Create a Secret named after `generation` inside `namespace`.
    async fn create_secret(&self, generation: &Generation, namespace: &str) -> anyhow::Result<()>;
}

pub mod prelude {
    pub use super::{ClusterClient, Generation, GenerationError, GeneratorKind, Policy, ResourceDescription, Rule};
}
