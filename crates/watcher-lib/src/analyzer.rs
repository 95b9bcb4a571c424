//! Rolling per-host statistics across cached snapshots
//!
//! Reduces a sequence of envelopes to four samples per host: mean and
//! population variance for CPU and memory utilisation.

use std::collections::HashMap;

use crate::models::{Data, Metric, MetricType, NodeMetrics, Operator, WatcherMetrics};

pub const CPU_UTILISATION_NAME: &str = "host.cpu.utilisation";
pub const MEMORY_UTILISATION_NAME: &str = "host.memory.utilisation";

#[derive(Default)]
struct HostSeries {
    cpus: Vec<f64>,
    memories: Vec<f64>,
}

/// Reduce the given envelopes to per-host mean/variance rows.
///
/// Hosts absent from some envelopes contribute only the ticks they appear
/// in. All numeric points are treated uniformly regardless of the operator
/// that produced them.
pub fn analyze(envelopes: &[WatcherMetrics]) -> Data {
    let mut per_host: HashMap<String, HostSeries> = HashMap::new();

    for envelope in envelopes {
        for (host, node) in &envelope.data.node_metrics_map {
            let series = per_host.entry(host.clone()).or_default();
            for metric in &node.metrics {
                match metric.metric_type {
                    MetricType::Cpu => series.cpus.push(metric.value),
                    MetricType::Memory => series.memories.push(metric.value),
                }
            }
        }
    }

    let mut node_metrics_map = HashMap::with_capacity(per_host.len());
    for (host, series) in per_host {
        let metrics = vec![
            stat_metric(MetricType::Cpu, Operator::Avg, mean(&series.cpus)),
            stat_metric(MetricType::Cpu, Operator::Std, variance(&series.cpus)),
            stat_metric(MetricType::Memory, Operator::Avg, mean(&series.memories)),
            stat_metric(MetricType::Memory, Operator::Std, variance(&series.memories)),
        ];
        node_metrics_map.insert(
            host,
            NodeMetrics {
                metrics,
                ..Default::default()
            },
        );
    }

    Data { node_metrics_map }
}

fn stat_metric(metric_type: MetricType, operator: Operator, value: f64) -> Metric {
    let name = match metric_type {
        MetricType::Cpu => CPU_UTILISATION_NAME,
        MetricType::Memory => MEMORY_UTILISATION_NAME,
    };
    Metric {
        name: name.to_string(),
        metric_type,
        operator: Some(operator),
        rollup: None,
        value,
    }
}

/// Arithmetic mean; an empty series yields 0 rather than NaN.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population variance (sum of squared deviations over N); an empty
/// series yields 0 rather than NaN.
pub fn variance(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let center = mean(values);
    values
        .iter()
        .map(|value| {
            let deviation = value - center;
            deviation * deviation
        })
        .sum::<f64>()
        / values.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Window, WindowDuration};

    fn envelope_with_cpu(host: &str, value: f64) -> WatcherMetrics {
        let mut node_metrics_map = HashMap::new();
        node_metrics_map.insert(
            host.to_string(),
            NodeMetrics {
                metrics: vec![Metric {
                    name: "instance:node_cpu:ratio".to_string(),
                    metric_type: MetricType::Cpu,
                    operator: Some(Operator::Avg),
                    rollup: Some("15m".to_string()),
                    value,
                }],
                ..Default::default()
            },
        );
        WatcherMetrics {
            timestamp: 0,
            window: Window::current(WindowDuration::FiveMinutes),
            source: String::new(),
            data: Data { node_metrics_map },
        }
    }

    #[test]
    fn mean_and_variance_of_known_series() {
        let values = [10.0, 20.0, 30.0];
        assert!((mean(&values) - 20.0).abs() < 1e-9);
        assert!((variance(&values) - 200.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn empty_series_yield_zero() {
        assert_eq!(mean(&[]), 0.0);
        assert_eq!(variance(&[]), 0.0);
    }

    #[test]
    fn analysis_produces_four_rows_in_order() {
        let envelopes: Vec<_> = [10.0, 20.0, 30.0]
            .iter()
            .map(|value| envelope_with_cpu("h", *value))
            .collect();

        let data = analyze(&envelopes);
        let metrics = &data.node_metrics_map["h"].metrics;
        assert_eq!(metrics.len(), 4);

        assert_eq!(metrics[0].metric_type, MetricType::Cpu);
        assert_eq!(metrics[0].operator, Some(Operator::Avg));
        assert_eq!(metrics[0].name, CPU_UTILISATION_NAME);
        assert!((metrics[0].value - 20.0).abs() < 1e-9);

        assert_eq!(metrics[1].metric_type, MetricType::Cpu);
        assert_eq!(metrics[1].operator, Some(Operator::Std));
        assert!((metrics[1].value - 200.0 / 3.0).abs() < 1e-9);

        assert_eq!(metrics[2].metric_type, MetricType::Memory);
        assert_eq!(metrics[2].operator, Some(Operator::Avg));
        assert_eq!(metrics[2].name, MEMORY_UTILISATION_NAME);
        assert_eq!(metrics[2].value, 0.0);

        assert_eq!(metrics[3].metric_type, MetricType::Memory);
        assert_eq!(metrics[3].operator, Some(Operator::Std));
        assert_eq!(metrics[3].value, 0.0);
    }

    #[test]
    fn hosts_missing_from_some_envelopes_are_partial() {
        let mut envelopes = vec![envelope_with_cpu("a", 10.0), envelope_with_cpu("a", 30.0)];
        envelopes.push(envelope_with_cpu("b", 50.0));

        let data = analyze(&envelopes);
        assert_eq!(data.node_metrics_map.len(), 2);
        assert!((data.node_metrics_map["a"].metrics[0].value - 20.0).abs() < 1e-9);
        assert!((data.node_metrics_map["b"].metrics[0].value - 50.0).abs() < 1e-9);
        // A single sample has zero variance.
        assert_eq!(data.node_metrics_map["b"].metrics[1].value, 0.0);
    }
}
