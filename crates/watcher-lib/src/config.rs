//! Provider configuration read from the environment

use anyhow::{Context, Result};
use serde::Deserialize;

/// Options handed to provider constructors.
///
/// Populated from `METRICS_PROVIDER_*` environment variables; individual
/// adapters read their provider-specific extras themselves.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsProviderOpts {
    /// Provider to instantiate; one of the names in [`crate::provider`].
    #[serde(default = "default_provider_name")]
    pub name: String,

    /// Backend endpoint; adapters fall back to their own defaults.
    #[serde(default)]
    pub address: String,

    /// API or bearer token, provider dependent.
    #[serde(default)]
    pub token: String,

    /// Application key, for providers with two-part credentials.
    #[serde(default)]
    pub app_key: String,

    /// Accept invalid TLS certificates when talking to the backend.
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

fn default_provider_name() -> String {
    crate::provider::KUBERNETES_METRICS_SERVER_NAME.to_string()
}

impl Default for MetricsProviderOpts {
    fn default() -> Self {
        Self {
            name: default_provider_name(),
            address: String::new(),
            token: String::new(),
            app_key: String::new(),
            insecure_skip_verify: false,
        }
    }
}

impl MetricsProviderOpts {
    /// Load options from `METRICS_PROVIDER_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("METRICS_PROVIDER").try_parsing(true))
            .build()
            .context("failed to read provider environment")?;

        config
            .try_deserialize()
            .context("invalid METRICS_PROVIDER_* configuration")
    }
}
