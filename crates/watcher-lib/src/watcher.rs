//! Periodic metrics watcher with a bounded sliding-window cache
//!
//! Polls the configured provider once per minute and keeps the last
//! [`CACHE_SIZE`] snapshots in memory. Readers always receive deep copies
//! taken under the cache lock, so later polls can never race a caller's
//! serialization.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::analyzer;
use crate::models::{Data, NodeMetrics, WatcherMetrics, Window, WindowDuration};
use crate::observability::ServiceMetrics;
use crate::provider::MetricsProvider;

/// Maximum number of one-minute snapshots kept in memory.
pub const CACHE_SIZE: usize = 15;

/// Spacing between poll cycles.
pub const POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Engine-read failures the HTTP layer must tell apart.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WatcherError {
    #[error("watcher has not been started")]
    NotStarted,
    #[error("no metrics collected yet")]
    NoMetricsYet,
}

/// Watcher engine. Cheap to clone; all clones share the same cache.
#[derive(Clone)]
pub struct Watcher {
    provider: Arc<dyn MetricsProvider>,
    cache: Arc<RwLock<VecDeque<WatcherMetrics>>>,
    started: Arc<AtomicBool>,
    metrics: ServiceMetrics,
    poll_interval: Duration,
}

impl Watcher {
    pub fn new(provider: Arc<dyn MetricsProvider>) -> Self {
        Self {
            provider,
            cache: Arc::new(RwLock::new(VecDeque::with_capacity(CACHE_SIZE))),
            started: Arc::new(AtomicBool::new(false)),
            metrics: ServiceMetrics::new(),
            poll_interval: POLL_INTERVAL,
        }
    }

    /// Override the poll spacing; used by tests.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Provider this watcher polls.
    pub fn provider(&self) -> &Arc<dyn MetricsProvider> {
        &self.provider
    }

    /// Begin polling on a background task. One-shot: only the first call
    /// spawns the loop, later calls return immediately.
    pub fn start(&self, shutdown: broadcast::Receiver<()>) {
        if self
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("watcher already started");
            return;
        }

        let watcher = self.clone();
        tokio::spawn(async move { watcher.run_poll_loop(shutdown).await });
    }

    async fn run_poll_loop(&self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.poll_interval.as_secs(),
            provider = self.provider.name(),
            "starting metrics poll loop"
        );

        // The ticker also paces failed cycles, so a broken provider is
        // retried at the normal cadence instead of hot-looping.
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    info!("shutting down metrics poll loop");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.poll_once().await {
                        error!(error = %err, "received error while fetching metrics");
                    }
                }
            }
        }
    }

    /// Run a single fetch-and-append cycle.
    pub async fn poll_once(&self) -> Result<()> {
        let window = Window::current(WindowDuration::FifteenMinutes);

        let fetch_start = Instant::now();
        let result = self.provider.fetch_all_hosts_metrics(&window).await;
        self.metrics
            .observe_fetch_latency(fetch_start.elapsed().as_secs_f64());
        self.metrics.inc_poll_cycles();

        let host_metrics = match result {
            Ok(host_metrics) => host_metrics,
            Err(err) => {
                self.metrics.inc_fetch_errors();
                return Err(err);
            }
        };

        let mut node_metrics_map = HashMap::with_capacity(host_metrics.len());
        for (host, metrics) in host_metrics {
            node_metrics_map.insert(
                host,
                NodeMetrics {
                    metrics,
                    ..Default::default()
                },
            );
        }
        let envelope = WatcherMetrics {
            timestamp: Utc::now().timestamp(),
            window,
            source: self.provider.name().to_string(),
            data: Data { node_metrics_map },
        };

        let mut cache = self.cache.write().await;
        if cache.len() == CACHE_SIZE {
            cache.pop_front();
        }
        cache.push_back(envelope);
        self.metrics.set_cache_entries(cache.len() as i64);
        Ok(())
    }

    /// Deep copy of the most recent snapshot.
    pub async fn latest(&self) -> Result<WatcherMetrics, WatcherError> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(WatcherError::NotStarted);
        }
        let cache = self.cache.read().await;
        cache.back().cloned().ok_or(WatcherError::NoMetricsYet)
    }

    /// Longest available window not exceeding `duration`, with deep copies
    /// of the matching cache tail: 15 minutes, then 10, then 5, then
    /// whatever is present.
    pub async fn current_window(
        &self,
        duration: WindowDuration,
    ) -> (Window, Vec<WatcherMetrics>) {
        let cache = self.cache.read().await;
        let len = cache.len();

        let wants_fifteen = duration == WindowDuration::FifteenMinutes;
        let wants_ten = wants_fifteen || duration == WindowDuration::TenMinutes;
        let (window, take) = if len == 0 {
            (Window::current(duration), 0)
        } else if wants_fifteen && len >= 15 {
            (Window::current(WindowDuration::FifteenMinutes), 15)
        } else if wants_ten && len >= 10 {
            (Window::current(WindowDuration::TenMinutes), 10)
        } else if len >= 5 {
            (Window::current(WindowDuration::FiveMinutes), 5)
        } else {
            (Window::current(WindowDuration::FiveMinutes), len)
        };

        let tail = cache.iter().skip(len - take).cloned().collect();
        (window, tail)
    }

    /// Per-host mean/variance analysis across the chosen window.
    pub async fn analysis(
        &self,
        duration: WindowDuration,
    ) -> Result<WatcherMetrics, WatcherError> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(WatcherError::NotStarted);
        }
        let (window, envelopes) = self.current_window(duration).await;
        if envelopes.is_empty() {
            return Err(WatcherError::NoMetricsYet);
        }

        Ok(WatcherMetrics {
            timestamp: Utc::now().timestamp(),
            window,
            source: self.provider.name().to_string(),
            data: analyzer::analyze(&envelopes),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Metric, MetricType, Operator};
    use crate::provider::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Provider returning one CPU sample per call, walking a fixed series.
    struct SequenceProvider {
        values: Vec<f64>,
        calls: AtomicUsize,
    }

    impl SequenceProvider {
        fn new(values: Vec<f64>) -> Self {
            Self {
                values,
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MetricsProvider for SequenceProvider {
        fn name(&self) -> &'static str {
            "TestProvider"
        }

        async fn fetch_host_metrics(&self, _host: &str, _window: &Window) -> Result<Vec<Metric>> {
            Ok(Vec::new())
        }

        async fn fetch_all_hosts_metrics(
            &self,
            _window: &Window,
        ) -> Result<HashMap<String, Vec<Metric>>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let value = self.values[call % self.values.len()];
            let mut metrics = HashMap::new();
            metrics.insert(
                "h".to_string(),
                vec![Metric {
                    name: "instance:node_cpu:ratio".to_string(),
                    metric_type: MetricType::Cpu,
                    operator: Some(Operator::Avg),
                    rollup: Some("15m".to_string()),
                    value,
                }],
            );
            Ok(metrics)
        }

        async fn health(&self) -> Result<()> {
            Ok(())
        }
    }

    struct FailingProvider;

    #[async_trait]
    impl MetricsProvider for FailingProvider {
        fn name(&self) -> &'static str {
            "FailingProvider"
        }

        async fn fetch_host_metrics(&self, _host: &str, _window: &Window) -> Result<Vec<Metric>> {
            anyhow::bail!("backend unavailable")
        }

        async fn fetch_all_hosts_metrics(
            &self,
            _window: &Window,
        ) -> Result<HashMap<String, Vec<Metric>>> {
            anyhow::bail!("backend unavailable")
        }

        async fn health(&self) -> Result<()> {
            anyhow::bail!("backend unavailable")
        }
    }

    fn test_watcher(values: Vec<f64>) -> (Watcher, Arc<SequenceProvider>) {
        let provider = Arc::new(SequenceProvider::new(values));
        let watcher = Watcher::new(provider.clone());
        (watcher, provider)
    }

    /// Start the watcher with an already-fired shutdown so the background
    /// loop exits before its first tick; tests drive polls by hand.
    fn start_without_loop(watcher: &Watcher) {
        let (shutdown_tx, _) = broadcast::channel(1);
        let shutdown_rx = shutdown_tx.subscribe();
        shutdown_tx.send(()).unwrap();
        watcher.start(shutdown_rx);
    }

    #[tokio::test]
    async fn latest_requires_start_and_data() {
        let (watcher, _provider) = test_watcher(vec![10.0]);
        assert_eq!(watcher.latest().await, Err(WatcherError::NotStarted));

        start_without_loop(&watcher);
        watcher.poll_once().await.unwrap();

        let latest = watcher.latest().await.unwrap();
        assert_eq!(latest.source, "TestProvider");
        assert!(latest.data.node_metrics_map.contains_key("h"));
    }

    #[tokio::test]
    async fn empty_cache_after_start_reports_no_metrics() {
        let watcher = Watcher::new(Arc::new(FailingProvider));
        start_without_loop(&watcher);

        assert!(watcher.poll_once().await.is_err());
        assert_eq!(watcher.latest().await, Err(WatcherError::NoMetricsYet));
        assert_eq!(
            watcher.analysis(WindowDuration::FifteenMinutes).await,
            Err(WatcherError::NoMetricsYet)
        );
    }

    #[tokio::test]
    async fn cache_evicts_oldest_at_capacity() {
        let (watcher, _provider) = test_watcher(vec![1.0]);
        for _ in 0..CACHE_SIZE + 1 {
            watcher.poll_once().await.unwrap();
        }

        let cache = watcher.cache.read().await;
        assert_eq!(cache.len(), CACHE_SIZE);
        for pair in cache.iter().zip(cache.iter().skip(1)) {
            assert!(pair.0.timestamp <= pair.1.timestamp);
        }
    }

    #[tokio::test]
    async fn window_ladder_falls_back() {
        let (watcher, _provider) = test_watcher(vec![1.0]);
        for _ in 0..7 {
            watcher.poll_once().await.unwrap();
        }

        let (window, envelopes) = watcher
            .current_window(WindowDuration::FifteenMinutes)
            .await;
        assert_eq!(window.duration, WindowDuration::FiveMinutes);
        assert_eq!(window.end - window.start, WindowDuration::FiveMinutes.seconds());
        assert_eq!(envelopes.len(), 5);

        // The tail is the newest five entries.
        let cache = watcher.cache.read().await;
        let expected: Vec<_> = cache.iter().skip(2).cloned().collect();
        assert_eq!(envelopes, expected);
    }

    #[tokio::test]
    async fn short_cache_returns_everything() {
        let (watcher, _provider) = test_watcher(vec![1.0]);
        for _ in 0..3 {
            watcher.poll_once().await.unwrap();
        }

        let (window, envelopes) = watcher.current_window(WindowDuration::TenMinutes).await;
        assert_eq!(window.duration, WindowDuration::FiveMinutes);
        assert_eq!(envelopes.len(), 3);
    }

    #[tokio::test]
    async fn readers_get_isolated_copies() {
        let (watcher, _provider) = test_watcher(vec![10.0]);
        start_without_loop(&watcher);
        watcher.poll_once().await.unwrap();

        let mut copy = watcher.latest().await.unwrap();
        copy.data.node_metrics_map.get_mut("h").unwrap().metrics[0].value = -1.0;
        copy.data.node_metrics_map.remove("h");

        let fresh = watcher.latest().await.unwrap();
        assert_eq!(fresh.data.node_metrics_map["h"].metrics[0].value, 10.0);
    }

    #[tokio::test]
    async fn analysis_reduces_the_window() {
        let (watcher, _provider) = test_watcher(vec![10.0, 20.0, 30.0]);
        start_without_loop(&watcher);
        for _ in 0..3 {
            watcher.poll_once().await.unwrap();
        }

        let analysis = watcher.analysis(WindowDuration::FiveMinutes).await.unwrap();
        let metrics = &analysis.data.node_metrics_map["h"].metrics;
        assert_eq!(metrics.len(), 4);
        assert_eq!(metrics[0].operator, Some(Operator::Avg));
        assert!((metrics[0].value - 20.0).abs() < 1e-9);
        assert_eq!(metrics[1].operator, Some(Operator::Std));
        assert!((metrics[1].value - 200.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_loop_stops_on_shutdown() {
        let (watcher, provider) = test_watcher(vec![1.0]);
        let watcher = watcher.with_poll_interval(Duration::from_millis(20));

        let (shutdown_tx, _) = broadcast::channel(1);
        watcher.start(shutdown_tx.subscribe());

        tokio::time::sleep(Duration::from_millis(110)).await;
        let polled = provider.calls();
        assert!(polled >= 2, "expected several poll cycles, saw {polled}");

        shutdown_tx.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let after_shutdown = provider.calls();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(provider.calls(), after_shutdown);
    }

    #[tokio::test]
    async fn second_start_is_idempotent() {
        let (watcher, _provider) = test_watcher(vec![1.0]);
        let (shutdown_tx, _) = broadcast::channel(1);
        watcher.start(shutdown_tx.subscribe());
        watcher.start(shutdown_tx.subscribe());
        assert!(watcher.started.load(Ordering::SeqCst));
    }
}
