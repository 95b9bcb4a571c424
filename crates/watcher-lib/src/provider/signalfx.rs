//! Single-host window adapter for a SignalFx-compatible store

use std::collections::HashMap;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

use super::{build_http_client, ensure_name, MetricsProvider, HTTP_CLIENT_TIMEOUT, SIGNALFX_NAME};
use crate::config::MetricsProviderOpts;
use crate::models::{Metric, MetricType, Operator, Window};
use async_trait::async_trait;

const DEFAULT_SIGNALFX_ADDRESS: &str = "https://api.signalfx.com";
const TIMESERIES_WINDOW_API: &str = "/v1/timeserieswindow";
const HOST_FILTER: &str = "host:";

const CPU_UTILIZATION_METRIC: &str = "sf_metric:\"cpu.utilization\"";
const MEMORY_UTILIZATION_METRIC: &str = "sf_metric:\"memory.utilization\"";
const ONE_MINUTE_RESOLUTION_MS: i64 = 60_000;

pub struct SignalFxProvider {
    client: reqwest::Client,
    address: String,
    auth_token: String,
}

/// Timeseries payload: an opaque series id mapped to `[ms, value]` pairs.
#[derive(Debug, Deserialize)]
struct TimeseriesWindowResponse {
    #[serde(default)]
    data: HashMap<String, Vec<(i64, f64)>>,
}

impl SignalFxProvider {
    pub fn new(opts: &MetricsProviderOpts) -> Result<Self> {
        ensure_name(opts, SIGNALFX_NAME)?;
        anyhow::ensure!(!opts.token.is_empty(), "no auth token found to connect to signalfx");

        let address = if opts.address.is_empty() {
            DEFAULT_SIGNALFX_ADDRESS.to_string()
        } else {
            opts.address.clone()
        };

        Ok(Self {
            client: build_http_client(HTTP_CLIENT_TIMEOUT, opts.insecure_skip_verify)?,
            address: address.trim_end_matches('/').to_string(),
            auth_token: opts.token.clone(),
        })
    }

    async fn fetch_metric(&self, host: &str, metric: &str, window: &Window) -> Result<f64> {
        let query = format!("{HOST_FILTER}{host} AND {metric}");
        let url = format!("{}{TIMESERIES_WINDOW_API}", self.address);
        debug!(host = host, query = %query, "querying signalfx timeseries window");

        let response = self
            .client
            .get(&url)
            .header("X-SF-Token", &self.auth_token)
            .header("Content-Type", "application/json")
            .query(&[
                ("query", query.as_str()),
                ("startMs", &(window.start * 1000).to_string()),
                ("endMs", &(window.end * 1000).to_string()),
                ("resolution", &ONE_MINUTE_RESOLUTION_MS.to_string()),
            ])
            .send()
            .await
            .context("signalfx timeseries query failed")?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("signalfx returned status {status}");
        }

        let body: TimeseriesWindowResponse = response
            .json()
            .await
            .context("failed to decode signalfx response")?;
        latest_value(&body)
    }
}

/// Pick the most recent point of the first (only) returned series.
fn latest_value(payload: &TimeseriesWindowResponse) -> Result<f64> {
    let series = payload
        .data
        .values()
        .next()
        .ok_or_else(|| anyhow::anyhow!("no values found in signalfx payload"))?;
    let (_, value) = series
        .last()
        .ok_or_else(|| anyhow::anyhow!("no metric value array could be decoded"))?;
    Ok(*value)
}

#[async_trait]
impl MetricsProvider for SignalFxProvider {
    fn name(&self) -> &'static str {
        SIGNALFX_NAME
    }

    async fn fetch_host_metrics(&self, host: &str, window: &Window) -> Result<Vec<Metric>> {
        let mut metrics = Vec::with_capacity(2);
        for (metric_name, metric_type) in [
            (CPU_UTILIZATION_METRIC, MetricType::Cpu),
            (MEMORY_UTILIZATION_METRIC, MetricType::Memory),
        ] {
            let value = self.fetch_metric(host, metric_name, window).await?;
            metrics.push(Metric {
                name: metric_name.to_string(),
                metric_type,
                operator: Some(Operator::Avg),
                rollup: Some(window.duration.to_string()),
                value,
            });
        }
        Ok(metrics)
    }

    async fn fetch_all_hosts_metrics(
        &self,
        _window: &Window,
    ) -> Result<HashMap<String, Vec<Metric>>> {
        // The timeserieswindow API is strictly per-host.
        anyhow::bail!("fetching metrics for all hosts is not supported by signalfx")
    }

    async fn health(&self) -> Result<()> {
        let response = self
            .client
            .get(&self.address)
            .send()
            .await
            .context("signalfx health probe failed")?;
        let status = response.status();
        anyhow::ensure!(status.is_success(), "signalfx health probe returned {status}");
        Ok(())
    }
}
