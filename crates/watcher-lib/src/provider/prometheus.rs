//! Range-query adapter for a Prometheus-compatible store
//!
//! Evaluates `avg_over_time` and `stddev_over_time` over the node CPU and
//! memory utilisation recording rules, one instant query per
//! (operator, metric) pair. A failed pair is skipped; the call fails only
//! when every pair failed.

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::warn;

use super::{build_http_client, ensure_name, MetricsProvider, PROMETHEUS_NAME};
use crate::config::MetricsProviderOpts;
use crate::models::{Metric, MetricType, Operator, Window};
use async_trait::async_trait;

const DEFAULT_PROMETHEUS_ADDRESS: &str = "http://prometheus-k8s:9090";
const PROM_HOST_KEY: &str = "PROM_HOST";
const PROM_TOKEN_KEY: &str = "PROM_TOKEN";

const CPU_METRIC: &str = "instance:node_cpu:ratio";
const MEMORY_METRIC: &str = "instance:node_memory_utilisation:ratio";
const AVG_METHOD: &str = "avg_over_time";
const STD_METHOD: &str = "stddev_over_time";
const ALL_HOSTS: &str = "all";

const QUERY_TIMEOUT: Duration = Duration::from_secs(10);

pub struct PrometheusProvider {
    client: reqwest::Client,
    address: String,
    bearer_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    status: String,
    #[serde(default)]
    data: Option<QueryData>,
}

#[derive(Debug, Deserialize)]
struct QueryData {
    #[serde(rename = "resultType")]
    result_type: String,
    #[serde(default)]
    result: Vec<VectorSample>,
}

/// One instant-vector sample: label set plus an `[epoch, "value"]` pair.
#[derive(Debug, Deserialize)]
struct VectorSample {
    #[serde(default)]
    metric: HashMap<String, String>,
    value: (f64, String),
}

impl PrometheusProvider {
    pub fn new(opts: &MetricsProviderOpts) -> Result<Self> {
        ensure_name(opts, PROMETHEUS_NAME)?;

        let address = if !opts.address.is_empty() {
            opts.address.clone()
        } else {
            env::var(PROM_HOST_KEY).unwrap_or_else(|_| DEFAULT_PROMETHEUS_ADDRESS.to_string())
        };
        let bearer_token = if !opts.token.is_empty() {
            Some(opts.token.clone())
        } else {
            env::var(PROM_TOKEN_KEY).ok().filter(|token| !token.is_empty())
        };

        Ok(Self {
            client: build_http_client(QUERY_TIMEOUT, opts.insecure_skip_verify)?,
            address: address.trim_end_matches('/').to_string(),
            bearer_token,
        })
    }

    /// Evaluate an instant query at "now" and return the vector samples.
    async fn instant_query(&self, query: &str) -> Result<Vec<VectorSample>> {
        let url = format!("{}/api/v1/query", self.address);
        let mut request = self.client.get(&url).query(&[("query", query)]);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("prometheus query {query:?} failed"))?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("prometheus returned status {status} for query {query:?}");
        }

        let body: QueryResponse = response
            .json()
            .await
            .context("failed to decode prometheus response")?;
        if body.status != "success" {
            anyhow::bail!("prometheus query {query:?} ended with status {:?}", body.status);
        }
        let data = body
            .data
            .ok_or_else(|| anyhow::anyhow!("prometheus response missing data field"))?;
        if data.result_type != "vector" {
            anyhow::bail!("expected an instant vector, got {:?}", data.result_type);
        }
        Ok(data.result)
    }

    async fn fetch_pairs(&self, host: &str, window: &Window) -> Result<HashMap<String, Vec<Metric>>> {
        let rollup = window.duration.to_string();
        let mut host_metrics: HashMap<String, Vec<Metric>> = HashMap::new();
        let mut last_err = None;

        for method in [AVG_METHOD, STD_METHOD] {
            for metric_name in [CPU_METRIC, MEMORY_METRIC] {
                let query = build_query(host, metric_name, method, &rollup);
                match self.instant_query(&query).await {
                    Ok(samples) => {
                        for (sample_host, metrics) in
                            samples_to_metrics(samples, metric_name, method, &rollup)
                        {
                            host_metrics.entry(sample_host).or_default().extend(metrics);
                        }
                    }
                    Err(err) => {
                        warn!(query = %query, error = %err, "prometheus query failed");
                        last_err = Some(err);
                    }
                }
            }
        }

        match last_err {
            Some(err) if host_metrics.is_empty() => Err(err),
            _ => Ok(host_metrics),
        }
    }
}

fn build_query(host: &str, metric: &str, method: &str, rollup: &str) -> String {
    if host == ALL_HOSTS {
        format!("{method}({metric}[{rollup}])")
    } else {
        format!("{method}({metric}{{instance=\"{host}\"}}[{rollup}])")
    }
}

/// Turn the samples of one (operator, metric) query into per-host metrics,
/// keyed by the `instance` label.
fn samples_to_metrics(
    samples: Vec<VectorSample>,
    metric_name: &str,
    method: &str,
    rollup: &str,
) -> HashMap<String, Vec<Metric>> {
    let metric_type = if metric_name == CPU_METRIC {
        MetricType::Cpu
    } else {
        MetricType::Memory
    };
    let operator = if method == STD_METHOD {
        Operator::Std
    } else {
        Operator::Avg
    };

    let mut metrics: HashMap<String, Vec<Metric>> = HashMap::new();
    for sample in samples {
        let Some(host) = sample.metric.get("instance") else {
            warn!(metric = metric_name, "sample without instance label, skipping");
            continue;
        };
        let value = match sample.value.1.parse::<f64>() {
            Ok(value) => value,
            Err(err) => {
                warn!(metric = metric_name, error = %err, "unparseable sample value, skipping");
                continue;
            }
        };
        metrics.entry(host.clone()).or_default().push(Metric {
            name: metric_name.to_string(),
            metric_type,
            operator: Some(operator),
            rollup: Some(rollup.to_string()),
            value,
        });
    }
    metrics
}

#[async_trait]
impl MetricsProvider for PrometheusProvider {
    fn name(&self) -> &'static str {
        PROMETHEUS_NAME
    }

    async fn fetch_host_metrics(&self, host: &str, window: &Window) -> Result<Vec<Metric>> {
        let mut host_metrics = self.fetch_pairs(host, window).await?;
        Ok(host_metrics.remove(host).unwrap_or_default())
    }

    async fn fetch_all_hosts_metrics(
        &self,
        window: &Window,
    ) -> Result<HashMap<String, Vec<Metric>>> {
        self.fetch_pairs(ALL_HOSTS, window).await
    }

    async fn health(&self) -> Result<()> {
        let url = format!("{}/-/healthy", self.address);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("prometheus health probe failed")?;
        let status = response.status();
        anyhow::ensure!(status.is_success(), "prometheus health probe returned {status}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_forms() {
        assert_eq!(
            build_query(ALL_HOSTS, CPU_METRIC, AVG_METHOD, "15m"),
            "avg_over_time(instance:node_cpu:ratio[15m])"
        );
        assert_eq!(
            build_query("alpha", MEMORY_METRIC, STD_METHOD, "5m"),
            "stddev_over_time(instance:node_memory_utilisation:ratio{instance=\"alpha\"}[5m])"
        );
    }

    fn vector_json(hosts: &[(&str, f64)]) -> Vec<VectorSample> {
        let result: Vec<serde_json::Value> = hosts
            .iter()
            .map(|(host, value)| {
                serde_json::json!({
                    "metric": {"instance": host},
                    "value": [1_700_000_000.0, value.to_string()],
                })
            })
            .collect();
        serde_json::from_value(serde_json::Value::Array(result)).unwrap()
    }

    #[test]
    fn instant_vector_decodes() {
        let raw = r#"{
            "status": "success",
            "data": {
                "resultType": "vector",
                "result": [
                    {"metric": {"instance": "a"}, "value": [1700000000.123, "42.5"]}
                ]
            }
        }"#;
        let body: QueryResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(body.status, "success");
        let data = body.data.unwrap();
        assert_eq!(data.result_type, "vector");
        assert_eq!(data.result[0].metric["instance"], "a");
        assert_eq!(data.result[0].value.1, "42.5");
    }

    #[test]
    fn each_pair_contributes_one_metric_per_host() {
        let mut host_metrics: HashMap<String, Vec<Metric>> = HashMap::new();
        for method in [AVG_METHOD, STD_METHOD] {
            for metric_name in [CPU_METRIC, MEMORY_METRIC] {
                let samples = vector_json(&[("a", 12.0), ("b", 24.0)]);
                for (host, metrics) in samples_to_metrics(samples, metric_name, method, "15m") {
                    host_metrics.entry(host).or_default().extend(metrics);
                }
            }
        }

        for host in ["a", "b"] {
            let metrics = &host_metrics[host];
            assert_eq!(metrics.len(), 4);
            for metric_type in [MetricType::Cpu, MetricType::Memory] {
                for operator in [Operator::Avg, Operator::Std] {
                    assert!(metrics
                        .iter()
                        .any(|m| m.metric_type == metric_type && m.operator == Some(operator)));
                }
            }
            assert!(metrics.iter().all(|m| m.rollup.as_deref() == Some("15m")));
        }
    }

    #[test]
    fn samples_without_instance_label_are_skipped() {
        let samples: Vec<VectorSample> = serde_json::from_value(serde_json::json!([
            {"metric": {}, "value": [1700000000.0, "1.0"]},
            {"metric": {"instance": "a"}, "value": [1700000000.0, "2.0"]}
        ]))
        .unwrap();
        let metrics = samples_to_metrics(samples, CPU_METRIC, AVG_METHOD, "15m");
        assert_eq!(metrics.len(), 1);
        assert!(metrics.contains_key("a"));
    }
}
