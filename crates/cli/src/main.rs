use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use kpolicy_core::{validate_rule, ClusterClient, Generation, GeneratorKind, Policy, PolicyManifest};
use kpolicy_engine::{generate, GenerationResponse, TracingObserver};
use kube::core::GroupVersionKind;
use serde::Serialize;
use serde_json::Value as Json;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "kpolicyctl", version, about = "kpolicy CLI: run and check generate policies")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Apply a policy's generate rules to a Namespace manifest
    Generate {
        /// Policy manifest (YAML or JSON)
        #[arg(long)]
        policy: PathBuf,
        /// Triggering resource manifest, e.g. a Namespace
        #[arg(long)]
        resource: PathBuf,
        /// GVK key overriding the resource's apiVersion/kind, e.g. "v1/Namespace"
        #[arg(long)]
        gvk: Option<String>,
        /// Log what would be created instead of calling the cluster
        #[arg(long = "dry-run", action = ArgAction::SetTrue)]
        dry_run: bool,
    },
    /// Check rule and generator structure of a policy without touching the cluster
    Check {
        #[arg(long)]
        policy: PathBuf,
    },
}

fn init_tracing() {
    let env = std::env::var("KPOLICY_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KPOLICY_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KPOLICY_METRICS_ADDR; expected host:port");
        }
    }
}

fn max_manifest_bytes() -> usize {
    std::env::var("KPOLICY_MAX_MANIFEST_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1_000_000)
}

/// YAML is a superset of JSON, so both formats go through the YAML parser.
fn manifest_to_json(text: &str) -> Result<Json> {
    if text.len() > max_manifest_bytes() {
        return Err(anyhow!("manifest too large (>{} bytes)", max_manifest_bytes()));
    }
    let val: serde_yaml::Value = serde_yaml::from_str(text).context("parsing manifest")?;
    serde_json::to_value(val).context("converting manifest to JSON")
}

fn read_manifest(path: &Path) -> Result<Json> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    manifest_to_json(&text).with_context(|| format!("in {}", path.display()))
}

fn policy_from_json(json: Json) -> Result<Policy> {
    let manifest: PolicyManifest = serde_json::from_value(json).context("decoding policy manifest")?;
    let policy = Policy::from(manifest);
    if policy.name.is_empty() {
        return Err(anyhow!("policy manifest missing metadata.name"));
    }
    Ok(policy)
}

fn gvk_of(json: &Json) -> Result<GroupVersionKind> {
    let api_version = json.get("apiVersion").and_then(Json::as_str).ok_or_else(|| anyhow!("resource missing apiVersion"))?;
    let kind = json.get("kind").and_then(Json::as_str).ok_or_else(|| anyhow!("resource missing kind"))?;
    let (group, version) = api_version.split_once('/').unwrap_or(("", api_version));
    Ok(GroupVersionKind::gvk(group, version, kind))
}

/// Client that only reports what it would create.
struct DryRunClient;

#[async_trait::async_trait]
impl ClusterClient for DryRunClient {
    async fn create_config_map(&self, generation: &Generation, namespace: &str) -> Result<()> {
        info!(namespace, name = %generation.name, keys = generation.data.as_ref().map_or(0, |d| d.len()), "dry-run: would create configmap");
        Ok(())
    }

    async fn create_secret(&self, generation: &Generation, namespace: &str) -> Result<()> {
        info!(namespace, name = %generation.name, keys = generation.data.as_ref().map_or(0, |d| d.len()), "dry-run: would create secret");
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct Issue {
    index: usize,
    rule: String,
    error: String,
}

fn check_policy(policy: &Policy) -> Vec<Issue> {
    let mut issues = Vec::new();
    for (index, rule) in policy.rules.iter().enumerate() {
        let mut push = |e: kpolicy_core::GenerationError| issues.push(Issue { index, rule: rule.name.clone(), error: e.to_string() });
        if let Err(e) = validate_rule(&policy.name, index, rule) {
            push(e);
            continue;
        }
        if let Some(g) = &rule.generation {
            if let Err(e) = g.validate() {
                push(e);
            } else if let Err(e) = g.kind.parse::<GeneratorKind>() {
                push(e);
            }
        }
    }
    issues
}

fn print_applied(output: Output, applied: &[GenerationResponse]) -> Result<()> {
    match output {
        Output::Human => {
            if applied.is_empty() {
                println!("nothing generated");
            }
            for r in applied {
                println!("{} • {}/{}", r.generator.kind, r.namespace, r.generator.name);
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(applied)?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Generate { policy, resource, gvk, dry_run } => {
            let policy = policy_from_json(read_manifest(&policy)?)?;
            let resource_json = read_manifest(&resource)?;
            let gvk = match gvk {
                Some(key) => kpolicy_kubehub::parse_gvk_key(&key)?,
                None => gvk_of(&resource_json)?,
            };
            let raw = serde_json::to_vec(&resource_json)?;
            info!(policy = %policy.name, rules = policy.rules.len(), kind = %gvk.kind, dry_run, "generate invoked");
            let client: Box<dyn ClusterClient> = if dry_run {
                Box::new(DryRunClient)
            } else {
                Box::new(kpolicy_kubehub::KubeClient::try_default().await?)
            };
            let applied = generate(&policy, &raw, &gvk, client.as_ref(), &TracingObserver).await;
            print_applied(cli.output, &applied)?;
        }
        Commands::Check { policy } => {
            let policy = policy_from_json(read_manifest(&policy)?)?;
            let issues = check_policy(&policy);
            match cli.output {
                Output::Human => {
                    for i in &issues {
                        println!("rule #{} '{}': {}", i.index, i.rule, i.error);
                    }
                    if issues.is_empty() {
                        println!("policy '{}': {} rule(s) ok", policy.name, policy.rules.len());
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&issues)?),
            }
            if !issues.is_empty() {
                std::process::exit(1);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const POLICY: &str = r#"
apiVersion: policy.kpolicy.io/v1alpha1
kind: Policy
metadata:
  name: namespace-defaults
spec:
  rules:
    - name: ok
      resource: { kind: Namespace }
      generate: { kind: ConfigMap, name: defaults }
    - name: widget
      resource: { kind: Namespace }
      generate: { kind: Widget, name: w1 }
    - name: empty
      resource: { kind: Namespace }
"#;

    #[test]
    fn check_reports_each_broken_rule() {
        let policy = policy_from_json(manifest_to_json(POLICY).unwrap()).unwrap();
        let issues = check_policy(&policy);
        assert_eq!(issues.iter().map(|i| i.index).collect::<Vec<_>>(), vec![1, 2]);
        assert!(issues[0].error.contains("unsupported generator kind 'Widget'"), "{}", issues[0].error);
        assert!(issues[1].error.contains("no mutate, validate or generate"), "{}", issues[1].error);
    }

    #[test]
    fn policy_requires_a_name() {
        let err = policy_from_json(manifest_to_json("spec: { rules: [] }").unwrap()).unwrap_err();
        assert!(err.to_string().contains("metadata.name"));
    }

    #[test]
    fn gvk_is_derived_from_manifest() {
        let ns = manifest_to_json("apiVersion: v1\nkind: Namespace\nmetadata:\n  name: team-a\n").unwrap();
        let gvk = gvk_of(&ns).unwrap();
        assert_eq!((gvk.group.as_str(), gvk.version.as_str(), gvk.kind.as_str()), ("", "v1", "Namespace"));

        let dep = manifest_to_json(r#"{"apiVersion": "apps/v1", "kind": "Deployment"}"#).unwrap();
        assert_eq!(gvk_of(&dep).unwrap().group, "apps");

        let err = gvk_of(&manifest_to_json("kind: Namespace").unwrap()).unwrap_err();
        assert!(err.to_string().contains("missing apiVersion"));
    }
}
