//! kpolicy kubehub – kube-rs backed creation of generated ConfigMaps and Secrets

#![forbid(unsafe_code)]

use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kpolicy_core::{ClusterClient, Generation};
use kube::{
    api::{Api, PostParams},
    core::GroupVersionKind,
    Client,
};
use metrics::histogram;
use tracing::{debug, info};

fn ns_wait_attempts() -> u32 {
    std::env::var("KPOLICY_NS_WAIT_ATTEMPTS")
        .ok()
        .and_then(|s| s.parse::<u32>().ok())
        .unwrap_or(20)
}

fn ns_wait_interval() -> Duration {
    std::env::var("KPOLICY_NS_WAIT_INTERVAL_MS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(Duration::from_millis(250))
}

fn field_manager() -> String {
    std::env::var("KPOLICY_FIELD_MANAGER").unwrap_or_else(|_| "kpolicy".to_string())
}

pub async fn get_kube_client() -> Result<Client> {
    Client::try_default().await.context("building kube client from default config")
}

/// Parse `v1/Kind` or `group/v1/Kind`.
pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] if !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind::gvk("", version, kind)),
        [group, version, kind] if !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind::gvk(group, version, kind)),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// How many times to look for the target namespace before giving up.
    pub ns_wait_attempts: u32,
    pub ns_wait_interval: Duration,
    pub field_manager: String,
}

impl ClientSettings {
    pub fn from_env() -> Self {
        Self { ns_wait_attempts: ns_wait_attempts(), ns_wait_interval: ns_wait_interval(), field_manager: field_manager() }
    }

    /// Lookups actually made; the namespace is always looked up at least once.
    pub fn effective_attempts(&self) -> u32 {
        self.ns_wait_attempts.max(1)
    }
}

/// [`ClusterClient`] talking to the API server.
///
/// Generation is triggered while the Namespace is still being admitted, so each
/// create first waits (bounded) for the namespace to show up. Callers sitting on an
/// admission path should run generation off the request path.
pub struct KubeClient {
    client: Client,
    settings: ClientSettings,
}

impl KubeClient {
    pub fn new(client: Client, settings: ClientSettings) -> Self {
        Self { client, settings }
    }

    pub async fn try_default() -> Result<Self> {
        Ok(Self::new(get_kube_client().await?, ClientSettings::from_env()))
    }

    fn post_params(&self) -> PostParams {
        PostParams { dry_run: false, field_manager: Some(self.settings.field_manager.clone()) }
    }

    async fn wait_for_namespace(&self, namespace: &str) -> Result<()> {
        let t0 = Instant::now();
        let api: Api<Namespace> = Api::all(self.client.clone());
        let attempts = self.settings.effective_attempts();
        for attempt in 1..=attempts {
            match api.get_opt(namespace).await.with_context(|| format!("looking up namespace {}", namespace))? {
                Some(ns) if is_terminating(&ns) => return Err(anyhow!("namespace {} is terminating", namespace)),
                Some(_) => {
                    histogram!("kubehub_namespace_wait_ms", t0.elapsed().as_secs_f64() * 1000.0);
                    return Ok(());
                }
                None => {
                    debug!(namespace, attempt, "namespace not created yet");
                    tokio::time::sleep(self.settings.ns_wait_interval).await;
                }
            }
        }
        Err(anyhow!("namespace {} did not appear after {} attempts", namespace, attempts))
    }
}

fn is_terminating(ns: &Namespace) -> bool {
    ns.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Terminating")
}

fn target_meta(generation: &Generation, namespace: &str) -> ObjectMeta {
    ObjectMeta { name: Some(generation.name.clone()), namespace: Some(namespace.to_string()), ..Default::default() }
}

/// Build the ConfigMap to create: data of `source` (copyFrom) with the generator's
/// own entries layered on top.
pub fn config_map_from(source: Option<ConfigMap>, generation: &Generation, namespace: &str) -> ConfigMap {
    let (mut data, binary_data) = match source {
        Some(cm) => (cm.data.unwrap_or_default(), cm.binary_data),
        None => (Default::default(), None),
    };
    if let Some(extra) = &generation.data {
        data.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    ConfigMap { metadata: target_meta(generation, namespace), data: Some(data), binary_data, ..Default::default() }
}

/// Secret counterpart of [`config_map_from`]; generator values are stored as raw bytes.
pub fn secret_from(source: Option<Secret>, generation: &Generation, namespace: &str) -> Secret {
    let (mut data, type_) = match source {
        Some(s) => (s.data.unwrap_or_default(), s.type_),
        None => (Default::default(), None),
    };
    if let Some(extra) = &generation.data {
        data.extend(extra.iter().map(|(k, v)| (k.clone(), ByteString(v.clone().into_bytes()))));
    }
    Secret { metadata: target_meta(generation, namespace), data: Some(data), type_, ..Default::default() }
}

#[async_trait::async_trait]
impl ClusterClient for KubeClient {
    async fn create_config_map(&self, generation: &Generation, namespace: &str) -> Result<()> {
        let source = match &generation.copy_from {
            Some(src) => {
                debug!(from_ns = %src.namespace, from = %src.name, "copying configmap data");
                let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &src.namespace);
                let cm = api
                    .get(&src.name)
                    .await
                    .with_context(|| format!("reading source configmap {}/{}", src.namespace, src.name))?;
                Some(cm)
            }
            None => None,
        };
        let cm = config_map_from(source, generation, namespace);
        self.wait_for_namespace(namespace).await?;
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        api.create(&self.post_params(), &cm)
            .await
            .with_context(|| format!("creating configmap {}/{}", namespace, generation.name))?;
        info!(namespace, name = %generation.name, "configmap created");
        Ok(())
    }

    async fn create_secret(&self, generation: &Generation, namespace: &str) -> Result<()> {
        let source = match &generation.copy_from {
            Some(src) => {
                debug!(from_ns = %src.namespace, from = %src.name, "copying secret data");
                let api: Api<Secret> = Api::namespaced(self.client.clone(), &src.namespace);
                let s = api
                    .get(&src.name)
                    .await
                    .with_context(|| format!("reading source secret {}/{}", src.namespace, src.name))?;
                Some(s)
            }
            None => None,
        };
        let secret = secret_from(source, generation, namespace);
        self.wait_for_namespace(namespace).await?;
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        api.create(&self.post_params(), &secret)
            .await
            .with_context(|| format!("creating secret {}/{}", namespace, generation.name))?;
        info!(namespace, name = %generation.name, "secret created");
        Ok(())
    }
}
