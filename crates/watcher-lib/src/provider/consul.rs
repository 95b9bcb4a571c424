//! Adapter for Consul node health checks
//!
//! Relies on a health check script installed on each node that prints the
//! uptime load averages followed by the core count, e.g. `"0.1,0.2,0.3\n2"`.
//! Load averages stand in for CPU utilisation; the window ladder maps to
//! the 15, 5, and 1 minute averages.

use std::collections::HashMap;
use std::env;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, error};

use super::{build_http_client, ensure_name, MetricsProvider, CONSUL_NAME, HTTP_CLIENT_TIMEOUT};
use crate::config::MetricsProviderOpts;
use crate::models::{Metric, MetricType, Window, WindowDuration};
use async_trait::async_trait;

const DEFAULT_CONSUL_ADDRESS: &str = "http://127.0.0.1:8500";
const CONSUL_ADDRESS_KEY: &str = "CONSUL_MASTER_ADDRESS";
const CHECK_ID_KEY: &str = "CONSUL_CHECK_ID";
const DEFAULT_CHECK_ID: &str = "metrics";
const LOAD_AVERAGE_NAME: &str = "load_average";

pub struct ConsulProvider {
    client: reqwest::Client,
    address: String,
    check_id: String,
}

#[derive(Debug, Deserialize)]
struct CatalogNode {
    #[serde(rename = "Node")]
    node: String,
}

#[derive(Debug, Deserialize)]
struct HealthCheck {
    #[serde(rename = "CheckID")]
    check_id: String,
    #[serde(rename = "Output", default)]
    output: String,
}

/// Parsed check output: three load averages plus the core count.
#[derive(Debug, PartialEq)]
struct HealthCheckOutput {
    one_minute: f64,
    five_minute: f64,
    fifteen_minute: f64,
    capacity: f64,
}

impl ConsulProvider {
    pub fn new(opts: &MetricsProviderOpts) -> Result<Self> {
        ensure_name(opts, CONSUL_NAME)?;

        let address = if !opts.address.is_empty() {
            opts.address.clone()
        } else {
            env::var(CONSUL_ADDRESS_KEY).unwrap_or_else(|_| DEFAULT_CONSUL_ADDRESS.to_string())
        };
        let check_id = env::var(CHECK_ID_KEY)
            .ok()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| DEFAULT_CHECK_ID.to_string());

        Ok(Self {
            client: build_http_client(HTTP_CLIENT_TIMEOUT, opts.insecure_skip_verify)?,
            address: address.trim_end_matches('/').to_string(),
            check_id,
        })
    }
}

fn parse_check_output(raw: &str) -> Result<HealthCheckOutput> {
    let normalized = raw.replace(',', " ");
    let mut fields = normalized.split_whitespace();
    let mut next = || -> Result<f64> {
        fields
            .next()
            .ok_or_else(|| anyhow::anyhow!("health check output too short: {raw:?}"))?
            .parse()
            .with_context(|| format!("unparseable health check output {raw:?}"))
    };
    Ok(HealthCheckOutput {
        one_minute: next()?,
        five_minute: next()?,
        fifteen_minute: next()?,
        capacity: next()?,
    })
}

/// The check reports 15m, 5m and 1m load averages; the shorter cache
/// windows fall back to the shorter averages.
fn load_for_window(output: &HealthCheckOutput, duration: WindowDuration) -> f64 {
    match duration {
        WindowDuration::FifteenMinutes => output.fifteen_minute,
        WindowDuration::TenMinutes => output.five_minute,
        WindowDuration::FiveMinutes => output.one_minute,
    }
}

#[async_trait]
impl MetricsProvider for ConsulProvider {
    fn name(&self) -> &'static str {
        CONSUL_NAME
    }

    async fn fetch_host_metrics(&self, host: &str, window: &Window) -> Result<Vec<Metric>> {
        let url = format!("{}/v1/health/node/{host}", self.address);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("consul health query for {host} failed"))?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("consul returned status {status} for node {host}");
        }
        let checks: Vec<HealthCheck> = response
            .json()
            .await
            .context("failed to decode consul health checks")?;
        debug!(host = host, checks = checks.len(), "fetched consul health checks");

        let mut metrics = Vec::new();
        for check in checks {
            if check.check_id != self.check_id {
                continue;
            }
            let output = parse_check_output(&check.output)?;
            anyhow::ensure!(output.capacity > 0.0, "node {host} reports zero capacity");
            metrics.push(Metric {
                name: LOAD_AVERAGE_NAME.to_string(),
                metric_type: MetricType::Cpu,
                operator: None,
                rollup: None,
                value: 100.0 * load_for_window(&output, window.duration) / output.capacity,
            });
            break;
        }
        Ok(metrics)
    }

    async fn fetch_all_hosts_metrics(
        &self,
        window: &Window,
    ) -> Result<HashMap<String, Vec<Metric>>> {
        let url = format!("{}/v1/catalog/nodes", self.address);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("consul catalog query failed")?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("consul returned status {status} for catalog nodes");
        }
        let nodes: Vec<CatalogNode> = response
            .json()
            .await
            .context("failed to decode consul catalog")?;

        let mut metrics = HashMap::new();
        for node in nodes {
            match self.fetch_host_metrics(&node.node, window).await {
                Ok(node_metrics) => {
                    metrics.insert(node.node, node_metrics);
                }
                Err(err) => {
                    error!(host = %node.node, error = %err, "error while fetching host metrics");
                }
            }
        }
        Ok(metrics)
    }

    async fn health(&self) -> Result<()> {
        let url = format!("{}/v1/status/leader", self.address);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("consul health probe failed")?;
        let status = response.status();
        anyhow::ensure!(status.is_success(), "consul health probe returned {status}");
        Ok(())
    }
}
