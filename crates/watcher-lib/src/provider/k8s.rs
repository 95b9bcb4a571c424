//! Adapter for the Kubernetes metrics server
//!
//! Reads node usage from `metrics.k8s.io` and node capacity from the core
//! API, and reports utilisation as a percentage of capacity. Credentials
//! come from the provider options, a kubeconfig named by `KUBE_CONFIG`,
//! or the in-cluster service account.

use std::collections::HashMap;
use std::env;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::warn;

use super::{
    build_http_client, ensure_name, MetricsProvider, HTTP_CLIENT_TIMEOUT,
    KUBERNETES_METRICS_SERVER_NAME,
};
use crate::config::MetricsProviderOpts;
use crate::models::{Metric, MetricType, Window};
use async_trait::async_trait;

const KUBE_CONFIG_KEY: &str = "KUBE_CONFIG";
const IN_CLUSTER_ADDRESS: &str = "https://kubernetes.default.svc";
const SERVICE_ACCOUNT_TOKEN_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

pub struct MetricsServerProvider {
    client: reqwest::Client,
    server: String,
    bearer_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ObjectMeta {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct ResourceQuantities {
    #[serde(default)]
    cpu: String,
    #[serde(default)]
    memory: String,
}

#[derive(Debug, Deserialize)]
struct NodeMetricsItem {
    metadata: ObjectMeta,
    usage: ResourceQuantities,
}

#[derive(Debug, Deserialize)]
struct NodeMetricsList {
    #[serde(default)]
    items: Vec<NodeMetricsItem>,
}

#[derive(Debug, Deserialize)]
struct NodeStatus {
    #[serde(default)]
    capacity: ResourceQuantities,
}

#[derive(Debug, Deserialize)]
struct NodeItem {
    metadata: ObjectMeta,
    status: NodeStatus,
}

#[derive(Debug, Deserialize)]
struct NodeList {
    #[serde(default)]
    items: Vec<NodeItem>,
}

/// Minimal kubeconfig shape: the first cluster's server and the first
/// user's token.
#[derive(Debug, Deserialize)]
struct KubeConfigFile {
    #[serde(default)]
    clusters: Vec<NamedCluster>,
    #[serde(default)]
    users: Vec<NamedUser>,
}

#[derive(Debug, Deserialize)]
struct NamedCluster {
    cluster: ClusterEntry,
}

#[derive(Debug, Deserialize)]
struct ClusterEntry {
    server: String,
}

#[derive(Debug, Deserialize)]
struct NamedUser {
    user: UserEntry,
}

#[derive(Debug, Default, Deserialize)]
struct UserEntry {
    #[serde(default)]
    token: Option<String>,
}

impl MetricsServerProvider {
    pub fn new(opts: &MetricsProviderOpts) -> Result<Self> {
        ensure_name(opts, KUBERNETES_METRICS_SERVER_NAME)?;

        let mut server = opts.address.clone();
        let mut bearer_token = (!opts.token.is_empty()).then(|| opts.token.clone());

        if server.is_empty() {
            if let Ok(path) = env::var(KUBE_CONFIG_KEY) {
                let (config_server, config_token) = load_kubeconfig(&path)?;
                server = config_server;
                if bearer_token.is_none() {
                    bearer_token = config_token;
                }
            } else {
                server = IN_CLUSTER_ADDRESS.to_string();
            }
        }
        if bearer_token.is_none() {
            bearer_token = std::fs::read_to_string(SERVICE_ACCOUNT_TOKEN_PATH)
                .ok()
                .map(|token| token.trim().to_string());
        }

        Ok(Self {
            client: build_http_client(HTTP_CLIENT_TIMEOUT, opts.insecure_skip_verify)?,
            server: server.trim_end_matches('/').to_string(),
            bearer_token,
        })
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{path}", self.server);
        let mut request = self.client.get(&url);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("kubernetes api returned status {status} for {path}");
        }
        response
            .json()
            .await
            .with_context(|| format!("failed to decode response from {path}"))
    }
}

fn load_kubeconfig(path: &str) -> Result<(String, Option<String>)> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read kubeconfig at {path}"))?;
    let config: KubeConfigFile =
        serde_yaml::from_str(&raw).with_context(|| format!("invalid kubeconfig at {path}"))?;
    let server = config
        .clusters
        .first()
        .map(|named| named.cluster.server.clone())
        .ok_or_else(|| anyhow::anyhow!("kubeconfig at {path} defines no cluster"))?;
    let token = config
        .users
        .first()
        .and_then(|named| named.user.token.clone());
    Ok((server, token))
}

/// Parse a Kubernetes resource quantity into base units.
fn parse_quantity(quantity: &str) -> Result<f64> {
    const SUFFIXES: [(&str, f64); 15] = [
        ("Ki", 1024.0),
        ("Mi", 1024.0 * 1024.0),
        ("Gi", 1024.0 * 1024.0 * 1024.0),
        ("Ti", 1024.0 * 1024.0 * 1024.0 * 1024.0),
        ("Pi", 1125899906842624.0),
        ("Ei", 1152921504606846976.0),
        ("n", 1e-9),
        ("u", 1e-6),
        ("m", 1e-3),
        ("k", 1e3),
        ("M", 1e6),
        ("G", 1e9),
        ("T", 1e12),
        ("P", 1e15),
        ("E", 1e18),
    ];

    let quantity = quantity.trim();
    anyhow::ensure!(!quantity.is_empty(), "empty resource quantity");
    for (suffix, factor) in SUFFIXES {
        if let Some(number) = quantity.strip_suffix(suffix) {
            let parsed: f64 = number
                .parse()
                .with_context(|| format!("invalid resource quantity {quantity:?}"))?;
            return Ok(parsed * factor);
        }
    }
    quantity
        .parse()
        .with_context(|| format!("invalid resource quantity {quantity:?}"))
}

/// Usage over capacity on the 0-100 scale.
fn utilisation(usage: &str, capacity: &str) -> Result<f64> {
    let usage = parse_quantity(usage)?;
    let capacity = parse_quantity(capacity)?;
    anyhow::ensure!(capacity > 0.0, "node reports zero capacity");
    Ok(100.0 * usage / capacity)
}

fn node_metrics(usage: &ResourceQuantities, capacity: &ResourceQuantities) -> Result<Vec<Metric>> {
    Ok(vec![
        Metric {
            name: String::new(),
            metric_type: MetricType::Cpu,
            operator: None,
            rollup: None,
            value: utilisation(&usage.cpu, &capacity.cpu)?,
        },
        Metric {
            name: String::new(),
            metric_type: MetricType::Memory,
            operator: None,
            rollup: None,
            value: utilisation(&usage.memory, &capacity.memory)?,
        },
    ])
}

#[async_trait]
impl MetricsProvider for MetricsServerProvider {
    fn name(&self) -> &'static str {
        KUBERNETES_METRICS_SERVER_NAME
    }

    async fn fetch_host_metrics(&self, host: &str, _window: &Window) -> Result<Vec<Metric>> {
        let usage: NodeMetricsItem = self
            .get(&format!("/apis/metrics.k8s.io/v1beta1/nodes/{host}"))
            .await?;
        let node: NodeItem = self.get(&format!("/api/v1/nodes/{host}")).await?;
        node_metrics(&usage.usage, &node.status.capacity)
    }

    async fn fetch_all_hosts_metrics(
        &self,
        _window: &Window,
    ) -> Result<HashMap<String, Vec<Metric>>> {
        let usage_list: NodeMetricsList = self.get("/apis/metrics.k8s.io/v1beta1/nodes").await?;
        let node_list: NodeList = self.get("/api/v1/nodes").await?;

        let capacities: HashMap<String, ResourceQuantities> = node_list
            .items
            .into_iter()
            .map(|node| (node.metadata.name, node.status.capacity))
            .collect();

        let mut metrics = HashMap::new();
        for item in usage_list.items {
            let Some(capacity) = capacities.get(&item.metadata.name) else {
                warn!(host = %item.metadata.name, "node missing from capacity list, skipping");
                continue;
            };
            match node_metrics(&item.usage, capacity) {
                Ok(host_metrics) => {
                    metrics.insert(item.metadata.name, host_metrics);
                }
                Err(err) => {
                    warn!(host = %item.metadata.name, error = %err, "unusable node quantities, skipping");
                }
            }
        }
        Ok(metrics)
    }

    async fn health(&self) -> Result<()> {
        let url = format!("{}/healthz", self.server);
        let mut request = self.client.get(&url);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.context("kubernetes health probe failed")?;
        let status = response.status();
        anyhow::ensure!(status.is_success(), "kubernetes health probe returned {status}");
        Ok(())
    }
}
