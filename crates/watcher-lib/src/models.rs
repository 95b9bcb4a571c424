//! Core data model shared by the cache, the HTTP surface, and clients

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Named window lengths supported by the sliding cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WindowDuration {
    #[serde(rename = "15m")]
    FifteenMinutes,
    #[serde(rename = "10m")]
    TenMinutes,
    #[serde(rename = "5m")]
    FiveMinutes,
}

impl WindowDuration {
    /// Window length in seconds.
    pub fn seconds(&self) -> i64 {
        match self {
            WindowDuration::FifteenMinutes => 15 * 60,
            WindowDuration::TenMinutes => 10 * 60,
            WindowDuration::FiveMinutes => 5 * 60,
        }
    }

    /// Number of one-minute samples covering the window.
    pub fn samples(&self) -> usize {
        (self.seconds() / 60) as usize
    }
}

impl fmt::Display for WindowDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let raw = match self {
            WindowDuration::FifteenMinutes => "15m",
            WindowDuration::TenMinutes => "10m",
            WindowDuration::FiveMinutes => "5m",
        };
        f.write_str(raw)
    }
}

impl FromStr for WindowDuration {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "15m" => Ok(WindowDuration::FifteenMinutes),
            "10m" => Ok(WindowDuration::TenMinutes),
            "5m" => Ok(WindowDuration::FiveMinutes),
            other => Err(anyhow::anyhow!("unknown window duration {other:?}")),
        }
    }
}

/// A concrete time interval ending at the moment it was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub duration: WindowDuration,
    pub start: i64,
    pub end: i64,
}

impl Window {
    /// Window of the given length ending now.
    pub fn current(duration: WindowDuration) -> Self {
        let end = Utc::now().timestamp();
        Self {
            duration,
            start: end - duration.seconds(),
            end,
        }
    }
}

/// Whether a sample measures processor or memory utilisation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetricType {
    #[serde(rename = "CPU")]
    Cpu,
    #[serde(rename = "Memory")]
    Memory,
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MetricType::Cpu => "CPU",
            MetricType::Memory => "Memory",
        })
    }
}

/// Aggregation applied over the window: mean or variance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "AVG")]
    Avg,
    #[serde(rename = "STD")]
    Std,
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operator::Avg => "AVG",
            Operator::Std => "STD",
        })
    }
}

/// A single numeric sample for one host.
///
/// `value` is a percentage on the 0-100 scale for provider samples;
/// variance samples produced by the analyzer are in percent squared.
/// `name` and `rollup` are provider-dependent labels kept for
/// traceability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    #[serde(rename = "type")]
    pub metric_type: MetricType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<Operator>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollup: Option<String>,
    pub value: f64,
}

/// Opaque per-node tags. Currently always empty, but the envelope must
/// round-trip it unchanged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tags {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(rename = "dataCenter", default, skip_serializing_if = "Option::is_none")]
    pub data_center: Option<String>,
}

/// All samples for a single host at one poll tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeMetrics {
    #[serde(default)]
    pub metrics: Vec<Metric>,
    #[serde(default)]
    pub tags: Tags,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Host identifier to per-host samples.
pub type NodeMetricsMap = HashMap<String, NodeMetrics>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Data {
    #[serde(rename = "NodeMetricsMap")]
    pub node_metrics_map: NodeMetricsMap,
}

/// One snapshot across all hosts, the unit of caching and serialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatcherMetrics {
    pub timestamp: i64,
    pub window: Window,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source: String,
    pub data: Data,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_envelope() -> WatcherMetrics {
        let mut node_metrics_map = NodeMetricsMap::new();
        node_metrics_map.insert(
            "alpha".to_string(),
            NodeMetrics {
                metrics: vec![Metric {
                    name: "instance:node_cpu:ratio".to_string(),
                    metric_type: MetricType::Cpu,
                    operator: Some(Operator::Avg),
                    rollup: Some("15m".to_string()),
                    value: 42.5,
                }],
                tags: Tags::default(),
                metadata: Metadata::default(),
            },
        );
        node_metrics_map.insert(
            "beta".to_string(),
            NodeMetrics {
                metrics: vec![Metric {
                    name: String::new(),
                    metric_type: MetricType::Memory,
                    operator: None,
                    rollup: None,
                    value: 17.0,
                }],
                tags: Tags::default(),
                metadata: Metadata {
                    data_center: Some("dc1".to_string()),
                },
            },
        );
        WatcherMetrics {
            timestamp: 1_700_000_000,
            window: Window {
                duration: WindowDuration::FifteenMinutes,
                start: 1_699_999_100,
                end: 1_700_000_000,
            },
            source: "Prometheus".to_string(),
            data: Data { node_metrics_map },
        }
    }

    #[test]
    fn window_duration_arithmetic() {
        for duration in [
            WindowDuration::FifteenMinutes,
            WindowDuration::TenMinutes,
            WindowDuration::FiveMinutes,
        ] {
            let window = Window::current(duration);
            assert_eq!(window.end - window.start, duration.seconds());
        }
    }

    #[test]
    fn window_duration_parses_and_displays() {
        for raw in ["15m", "10m", "5m"] {
            let duration: WindowDuration = raw.parse().unwrap();
            assert_eq!(duration.to_string(), raw);
        }
        assert!("2h".parse::<WindowDuration>().is_err());
    }

    #[test]
    fn envelope_round_trips() {
        let envelope = sample_envelope();
        let encoded = serde_json::to_string(&envelope).unwrap();
        let decoded: WatcherMetrics = serde_json::from_str(&encoded).unwrap();
        assert_eq!(envelope, decoded);
    }

    #[test]
    fn wire_casing_matches_schema() {
        let envelope = sample_envelope();
        let value: serde_json::Value = serde_json::to_value(&envelope).unwrap();

        assert!(value.get("data").unwrap().get("NodeMetricsMap").is_some());
        let alpha = &value["data"]["NodeMetricsMap"]["alpha"];
        assert_eq!(alpha["tags"], serde_json::json!({}));
        assert_eq!(alpha["metrics"][0]["type"], "CPU");
        assert_eq!(alpha["metrics"][0]["operator"], "AVG");
        assert_eq!(alpha["metrics"][0]["rollup"], "15m");
        // Absent optionals are omitted, not null.
        assert!(alpha["metadata"].get("dataCenter").is_none());
        let beta = &value["data"]["NodeMetricsMap"]["beta"];
        assert!(beta["metrics"][0].get("operator").is_none());
        assert!(beta["metrics"][0].get("rollup").is_none());
        assert_eq!(beta["metadata"]["dataCenter"], "dc1");
        assert_eq!(value["window"]["duration"], "15m");
    }

    #[test]
    fn empty_source_is_omitted_and_restored() {
        let mut envelope = sample_envelope();
        envelope.source = String::new();
        let value: serde_json::Value = serde_json::to_value(&envelope).unwrap();
        assert!(value.get("source").is_none());

        let decoded: WatcherMetrics = serde_json::from_value(value).unwrap();
        assert_eq!(envelope, decoded);
    }
}
