//! Formula adapter for a Datadog-compatible store
//!
//! Issues a single timeseries request carrying two parallel queries (CPU
//! first, memory second) and demultiplexes the response by query index and
//! group tag. Each series row is averaged across its one-minute points.

use std::collections::HashMap;
use std::env;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{build_http_client, ensure_name, MetricsProvider, DATADOG_NAME, HTTP_CLIENT_TIMEOUT};
use crate::config::MetricsProviderOpts;
use crate::models::{Metric, MetricType, Operator, Window};
use async_trait::async_trait;

const DEFAULT_DATADOG_ADDRESS: &str = "datadoghq.com";
const CLUSTER_NAME_KEY: &str = "DATADOG_CLUSTER_NAME";
const HOST_NAME_SUFFIX_KEY: &str = "DATADOG_HOST_NAME_SUFFIX";

const CPU_UTILIZATION_METRIC: &str = "max:cpu.utilization";
const MEMORY_UTILIZATION_METRIC: &str = "max:memory.utilization";
const ROLLUP: &str = "rollup(max, 60)";
const ONE_MINUTE_RESOLUTION_MS: i64 = 60_000;

pub struct DatadogProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    application_key: String,
    cluster_name: String,
    host_name_suffix: String,
}

#[derive(Debug, Serialize)]
struct TimeseriesRequest {
    data: TimeseriesRequestData,
}

#[derive(Debug, Serialize)]
struct TimeseriesRequestData {
    #[serde(rename = "type")]
    request_type: &'static str,
    attributes: TimeseriesRequestAttributes,
}

#[derive(Debug, Serialize)]
struct TimeseriesRequestAttributes {
    from: i64,
    to: i64,
    interval: i64,
    queries: Vec<TimeseriesQuery>,
}

#[derive(Debug, Serialize)]
struct TimeseriesQuery {
    name: String,
    data_source: &'static str,
    query: String,
}

#[derive(Debug, Deserialize)]
struct TimeseriesResponse {
    #[serde(default)]
    data: Option<TimeseriesResponseData>,
}

#[derive(Debug, Deserialize)]
struct TimeseriesResponseData {
    #[serde(default)]
    attributes: Option<TimeseriesAttributes>,
}

/// Parallel series/values lists; row `i` of `values` belongs to row `i`
/// of `series`.
#[derive(Debug, Default, Deserialize)]
struct TimeseriesAttributes {
    #[serde(default)]
    series: Vec<TimeseriesSeries>,
    #[serde(default)]
    values: Vec<Vec<Option<f64>>>,
}

#[derive(Debug, Deserialize)]
struct TimeseriesSeries {
    #[serde(default)]
    group_tags: Vec<String>,
    #[serde(default)]
    query_index: i64,
}

impl DatadogProvider {
    pub fn new(opts: &MetricsProviderOpts) -> Result<Self> {
        ensure_name(opts, DATADOG_NAME)?;
        anyhow::ensure!(!opts.token.is_empty(), "no api key found to connect to datadog");
        anyhow::ensure!(
            !opts.app_key.is_empty(),
            "no application key found to connect to datadog"
        );

        let address = if opts.address.is_empty() {
            DEFAULT_DATADOG_ADDRESS.to_string()
        } else {
            opts.address.clone()
        };

        Ok(Self {
            client: build_http_client(HTTP_CLIENT_TIMEOUT, opts.insecure_skip_verify)?,
            base_url: base_url(&address),
            api_key: opts.token.clone(),
            application_key: opts.app_key.clone(),
            cluster_name: env::var(CLUSTER_NAME_KEY).unwrap_or_default(),
            host_name_suffix: env::var(HOST_NAME_SUFFIX_KEY).unwrap_or_default(),
        })
    }

    fn build_request(&self, host: &str, window: &Window) -> TimeseriesRequest {
        let filter = format!(
            "{{host:{host}{suffix}, cluster_name:{cluster}}}",
            suffix = self.host_name_suffix,
            cluster = self.cluster_name,
        );
        let queries = [CPU_UTILIZATION_METRIC, MEMORY_UTILIZATION_METRIC]
            .iter()
            .enumerate()
            .map(|(index, metric)| TimeseriesQuery {
                name: format!("query{index}"),
                data_source: "metrics",
                query: format!("{metric}{filter} by {{host}}.{ROLLUP}"),
            })
            .collect();

        TimeseriesRequest {
            data: TimeseriesRequestData {
                request_type: "timeseries_request",
                attributes: TimeseriesRequestAttributes {
                    from: window.start * 1000,
                    to: window.end * 1000,
                    interval: ONE_MINUTE_RESOLUTION_MS,
                    queries,
                },
            },
        }
    }

    async fn query_metrics(
        &self,
        host: &str,
        window: &Window,
    ) -> Result<HashMap<String, Vec<Metric>>> {
        let body = self.build_request(host, window);
        let url = format!("{}/api/v2/query/timeseries", self.base_url);
        debug!(host = host, url = %url, "querying datadog timeseries");

        let response = self
            .client
            .post(&url)
            .header("DD-API-KEY", &self.api_key)
            .header("DD-APPLICATION-KEY", &self.application_key)
            .json(&body)
            .send()
            .await
            .context("datadog timeseries query failed")?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("datadog returned status {status} for timeseries query");
        }

        let body: TimeseriesResponse = response
            .json()
            .await
            .context("failed to decode datadog response")?;
        let attributes = body
            .data
            .and_then(|data| data.attributes)
            .ok_or_else(|| anyhow::anyhow!("datadog response carries no timeseries attributes"))?;
        metrics_from_timeseries(&attributes)
    }
}

/// Map a host address such as `datadoghq.com` onto the API base URL.
fn base_url(address: &str) -> String {
    if address.starts_with("http://") || address.starts_with("https://") {
        address.trim_end_matches('/').to_string()
    } else {
        format!("https://api.{address}")
    }
}

/// Demultiplex the parallel series/values lists into per-host metrics.
///
/// Rows whose points are all null contribute nothing; a length mismatch
/// between the two lists fails the whole call.
fn metrics_from_timeseries(
    attributes: &TimeseriesAttributes,
) -> Result<HashMap<String, Vec<Metric>>> {
    anyhow::ensure!(!attributes.series.is_empty(), "no series in timeseries response");
    anyhow::ensure!(!attributes.values.is_empty(), "no values in timeseries response");
    anyhow::ensure!(
        attributes.series.len() == attributes.values.len(),
        "timeseries series and values are not parallel: {} vs {}",
        attributes.series.len(),
        attributes.values.len()
    );

    let mut metrics: HashMap<String, Vec<Metric>> = HashMap::new();
    for (series, points) in attributes.series.iter().zip(&attributes.values) {
        let Some(group_tag) = series.group_tags.first() else {
            warn!("series row without group tags, skipping");
            continue;
        };
        let host = host_name(group_tag);
        let is_cpu = series.query_index == 0;

        let mut sum = 0.0;
        let mut count = 0usize;
        for point in points.iter().flatten() {
            sum += point;
            count += 1;
        }
        if count == 0 {
            debug!(host = %host, "series row with only null points, skipping");
            continue;
        }

        let (name, metric_type) = if is_cpu {
            (CPU_UTILIZATION_METRIC, MetricType::Cpu)
        } else {
            (MEMORY_UTILIZATION_METRIC, MetricType::Memory)
        };
        metrics.entry(host).or_default().push(Metric {
            name: name.to_string(),
            metric_type,
            operator: Some(Operator::Avg),
            rollup: Some(ROLLUP.to_string()),
            value: sum / count as f64,
        });
    }

    // CPU before memory per host, independent of response row order.
    for host_metrics in metrics.values_mut() {
        host_metrics.sort_by_key(|metric| matches!(metric.metric_type, MetricType::Memory));
    }
    Ok(metrics)
}

/// Strip a leading `<label>:` prefix and truncate at the first dot:
/// `host:alpha.dev.k8s.com` becomes `alpha`.
fn host_name(group_tag: &str) -> String {
    match group_tag.split_once(':') {
        Some((_, hostname)) => hostname
            .split('.')
            .next()
            .unwrap_or(hostname)
            .to_string(),
        None => group_tag.to_string(),
    }
}

#[async_trait]
impl MetricsProvider for DatadogProvider {
    fn name(&self) -> &'static str {
        DATADOG_NAME
    }

    async fn fetch_host_metrics(&self, host: &str, window: &Window) -> Result<Vec<Metric>> {
        let metrics = self.query_metrics(host, window).await?;
        // The response names hosts by group tag, which may differ from the
        // requested form once the suffix is stripped; there is at most one.
        Ok(metrics.into_values().next().unwrap_or_default())
    }

    async fn fetch_all_hosts_metrics(
        &self,
        window: &Window,
    ) -> Result<HashMap<String, Vec<Metric>>> {
        self.query_metrics("*", window).await
    }

    async fn health(&self) -> Result<()> {
        let response = self
            .client
            .get(&self.base_url)
            .send()
            .await
            .context("datadog health probe failed")?;
        let status = response.status();
        anyhow::ensure!(status.is_success(), "datadog health probe returned {status}");
        Ok(())
    }
}
