//! Metrics provider capability and backend adapters
//!
//! A provider translates fetch requests into its backend's native query
//! language and normalizes the response into per-host [`Metric`] values
//! on the 0-100 percentage scale.

mod consul;
mod datadog;
mod k8s;
mod prometheus;
mod signalfx;

pub use consul::ConsulProvider;
pub use datadog::DatadogProvider;
pub use k8s::MetricsServerProvider;
pub use prometheus::PrometheusProvider;
pub use signalfx::SignalFxProvider;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::config::MetricsProviderOpts;
use crate::models::{Metric, Window};

pub use async_trait::async_trait;

/// Provider names accepted in `METRICS_PROVIDER_NAME`.
pub const KUBERNETES_METRICS_SERVER_NAME: &str = "KubernetesMetricsServer";
pub const PROMETHEUS_NAME: &str = "Prometheus";
pub const SIGNALFX_NAME: &str = "SignalFx";
pub const DATADOG_NAME: &str = "Datadog";
pub const CONSUL_NAME: &str = "Consul";

/// Timeout applied to provider HTTP clients, except range queries which
/// use their own tighter bound.
pub(crate) const HTTP_CLIENT_TIMEOUT: Duration = Duration::from_secs(55);

/// Capability every metrics backend adapter satisfies.
#[async_trait]
pub trait MetricsProvider: Send + Sync {
    /// Stable identifier placed in the envelope `source` field.
    fn name(&self) -> &'static str;

    /// Fetch metrics for a single host across the given window.
    async fn fetch_host_metrics(&self, host: &str, window: &Window) -> Result<Vec<Metric>>;

    /// Fetch metrics for every host the provider knows, keyed by host.
    async fn fetch_all_hosts_metrics(&self, window: &Window)
        -> Result<HashMap<String, Vec<Metric>>>;

    /// Probe the backend for liveness.
    async fn health(&self) -> Result<()>;
}

/// Instantiate the provider selected by `opts.name`.
///
/// An unknown name is a configuration error and must be treated as fatal
/// at startup.
pub fn create_provider(opts: &MetricsProviderOpts) -> Result<Arc<dyn MetricsProvider>> {
    match opts.name.as_str() {
        PROMETHEUS_NAME => Ok(Arc::new(PrometheusProvider::new(opts)?)),
        DATADOG_NAME => Ok(Arc::new(DatadogProvider::new(opts)?)),
        SIGNALFX_NAME => Ok(Arc::new(SignalFxProvider::new(opts)?)),
        CONSUL_NAME => Ok(Arc::new(ConsulProvider::new(opts)?)),
        KUBERNETES_METRICS_SERVER_NAME => Ok(Arc::new(MetricsServerProvider::new(opts)?)),
        other => anyhow::bail!("unknown metrics provider {other:?}"),
    }
}

/// Guard used by constructors against being handed another provider's
/// options.
pub(crate) fn ensure_name(opts: &MetricsProviderOpts, expected: &str) -> Result<()> {
    anyhow::ensure!(
        opts.name == expected,
        "metrics provider name should be {expected}, found {}",
        opts.name
    );
    Ok(())
}

/// Build a reqwest client honoring the shared timeout and TLS options.
pub(crate) fn build_http_client(
    timeout: Duration,
    insecure_skip_verify: bool,
) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().timeout(timeout);
    if insecure_skip_verify {
        builder = builder.danger_accept_invalid_certs(true);
    }
    builder.build().context("failed to build HTTP client")
}
