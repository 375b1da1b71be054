//! Prometheus exporter for data-source queries.
//!
//! This crate serves the metrics produced by configured collectors over an
//! HTTP `/metrics` endpoint, bounding every scrape by Prometheus' scrape
//! timeout.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌─────────────────┐
//! │  Config + files │────>│ CollectorCatalog│────>│ ResolvedTargets │
//! │  (load time)    │     │  (name / glob)  │     │                 │
//! └─────────────────┘     └─────────────────┘     └────────┬────────┘
//!                                                          │
//! ┌─────────────────┐     ┌─────────────────┐     ┌────────v────────┐
//! │  HTTP response  │<────│     Encoder     │<────│     Gather      │
//! │  200/408/500    │     │ (text/pb, gzip) │     │ (exporter+self) │
//! └─────────────────┘     └─────────────────┘     └─────────────────┘
//! ```
//!
//! Each request computes its deadline from the
//! `X-Prometheus-Scrape-Timeout-Seconds` header and `global` settings,
//! gathers under a [`context::ScrapeContext`], then encodes into a pooled
//! buffer.
//!
//! # Usage
//!
//! Run the exporter binary with a configuration file:
//!
//! ```bash
//! querysight-exporter --config querysight.json5
//! ```
//!
//! # Configuration
//!
//! See [`config::ExporterConfig`] for configuration options.

pub mod catalog;
pub mod config;
pub mod context;
pub mod encode;
pub mod error;
pub mod exporter;
pub mod gather;
pub mod http;
pub mod metrics;
pub mod naming;
pub mod pool;
pub mod timeout;

pub use catalog::CollectorCatalog;
pub use config::{ConfigError, ExporterConfig, ResolvedConfig, ResolvedTarget};
pub use context::ScrapeContext;
pub use exporter::{CollectError, Collection, Exporter, QueryEngine, TargetExporter};
pub use http::{AppState, HttpServer, create_router};
