//! Core library for the node load watcher
//!
//! This crate provides:
//! - the metrics data model shared by the cache, the HTTP surface, and
//!   remote clients
//! - the provider capability and the backend adapters implementing it
//! - the polling watcher engine with its sliding-window cache
//! - rolling mean/variance analysis across cached windows

pub mod analyzer;
pub mod config;
pub mod models;
pub mod observability;
pub mod provider;
pub mod watcher;

pub use config::MetricsProviderOpts;
pub use models::*;
pub use observability::ServiceMetrics;
pub use provider::{create_provider, MetricsProvider};
pub use watcher::{Watcher, WatcherError, CACHE_SIZE, POLL_INTERVAL};
