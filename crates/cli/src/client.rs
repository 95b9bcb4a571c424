//! HTTP client for a remote watcher service

use std::time::Duration;

use anyhow::{Context, Result};
use tracing::debug;
use url::Url;
use watcher_lib::models::WatcherMetrics;

pub const DEFAULT_WATCHER_ENDPOINT: &str = "http://localhost:2020";

const CLIENT_TIMEOUT: Duration = Duration::from_secs(55);
const DEFAULT_RETRIES: u32 = 3;

/// Client for a peer watcher's JSON API.
pub struct WatcherClient {
    client: reqwest::Client,
    base_url: Url,
}

impl WatcherClient {
    pub fn new(base_url: &str, insecure_skip_verify: bool) -> Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(CLIENT_TIMEOUT);
        if insecure_skip_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let client = builder.build().context("failed to build HTTP client")?;
        let base_url = Url::parse(base_url).context("invalid watcher URL")?;

        Ok(Self { client, base_url })
    }

    /// Most recent snapshot, optionally filtered to one host.
    pub async fn latest_metrics(&self, host: Option<&str>) -> Result<WatcherMetrics> {
        let url = request_url(&self.base_url, "/watcher", host, None)?;
        self.fetch(url).await
    }

    /// Mean/variance analysis, optionally filtered and with an explicit
    /// window duration.
    pub async fn variation_metrics(
        &self,
        host: Option<&str>,
        duration: Option<&str>,
    ) -> Result<WatcherMetrics> {
        let url = request_url(&self.base_url, "/variation", host, duration)?;
        self.fetch(url).await
    }

    async fn fetch(&self, url: Url) -> Result<WatcherMetrics> {
        let response = self.get_with_retries(url).await?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("watcher returned status {status}");
        }
        response
            .json()
            .await
            .context("unable to decode watcher metrics")
    }

    /// Transport failures are retried up to three times, no backoff.
    async fn get_with_retries(&self, url: Url) -> Result<reqwest::Response> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.client.get(url.clone()).send().await {
                Ok(response) => return Ok(response),
                Err(err) if attempt >= DEFAULT_RETRIES => {
                    return Err(err).context("watcher request failed");
                }
                Err(err) => {
                    debug!(attempt, error = %err, "watcher request failed, retrying");
                }
            }
        }
    }
}

fn request_url(
    base_url: &Url,
    path: &str,
    host: Option<&str>,
    duration: Option<&str>,
) -> Result<Url> {
    let mut url = base_url.join(path).context("invalid path")?;
    {
        let mut pairs = url.query_pairs_mut();
        if let Some(host) = host {
            pairs.append_pair("host", host);
        }
        if let Some(duration) = duration {
            pairs.append_pair("duration", duration);
        }
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_urls_carry_the_filters() {
        let base = Url::parse(DEFAULT_WATCHER_ENDPOINT).unwrap();

        let url = request_url(&base, "/watcher", None, None).unwrap();
        assert_eq!(url.as_str(), "http://localhost:2020/watcher");

        let url = request_url(&base, "/watcher", Some("alpha"), None).unwrap();
        assert_eq!(url.as_str(), "http://localhost:2020/watcher?host=alpha");

        let url = request_url(&base, "/variation", Some("alpha"), Some("5m")).unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:2020/variation?host=alpha&duration=5m"
        );
    }

    #[test]
    fn invalid_endpoints_are_rejected() {
        assert!(WatcherClient::new("not a url", false).is_err());
        assert!(WatcherClient::new(DEFAULT_WATCHER_ENDPOINT, false).is_ok());
    }
}
