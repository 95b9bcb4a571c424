//! Service configuration

use anyhow::{Context, Result};
use serde::Deserialize;

/// Watcher service configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Port the HTTP API listens on
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    2020
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

impl ServiceConfig {
    /// Load configuration from `WATCHER_*` environment variables.
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("WATCHER").try_parsing(true))
            .build()
            .context("failed to read service environment")?;

        config
            .try_deserialize()
            .context("invalid WATCHER_* configuration")
    }
}
