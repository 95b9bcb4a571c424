//! Output formatting utilities

use anyhow::Result;
use clap::ValueEnum;
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};
use watcher_lib::models::WatcherMetrics;

/// Output format for CLI commands
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    /// Table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
}

#[derive(Tabled)]
struct MetricRow {
    #[tabled(rename = "HOST")]
    host: String,
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "TYPE")]
    metric_type: String,
    #[tabled(rename = "OPERATOR")]
    operator: String,
    #[tabled(rename = "ROLLUP")]
    rollup: String,
    #[tabled(rename = "VALUE")]
    value: String,
}

/// Print a snapshot in the requested format.
pub fn print_metrics(metrics: &WatcherMetrics, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(metrics)?);
        }
        OutputFormat::Table => {
            println!(
                "{} {}   {} {}   {} {}-{}",
                "source:".bold(),
                metrics.source,
                "window:".bold(),
                metrics.window.duration,
                "span:".bold(),
                metrics.window.start,
                metrics.window.end,
            );

            let mut rows = Vec::new();
            let mut hosts: Vec<_> = metrics.data.node_metrics_map.keys().collect();
            hosts.sort();
            for host in hosts {
                for metric in &metrics.data.node_metrics_map[host].metrics {
                    rows.push(MetricRow {
                        host: host.clone(),
                        name: metric.name.clone(),
                        metric_type: metric.metric_type.to_string(),
                        operator: metric
                            .operator
                            .map(|operator| operator.to_string())
                            .unwrap_or_default(),
                        rollup: metric.rollup.clone().unwrap_or_default(),
                        value: format!("{:.3}", metric.value),
                    });
                }
            }

            if rows.is_empty() {
                println!("{}", "No metrics found".yellow());
                return Ok(());
            }
            println!("{}", Table::new(rows).with(Style::rounded()));
        }
    }
    Ok(())
}

/// Print an error message
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message);
}
