//! Prometheus exporter for data-source queries.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use prometheus::Registry;
use prometheus::proto::MetricFamily;
use tokio::sync::watch;
use tracing::{error, info};

use querysight_common::{format_duration, init_tracing};
use querysight_exporter::config::CollectorConfig;
use querysight_exporter::{
    AppState, CollectError, ExporterConfig, HttpServer, QueryEngine, ResolvedTarget,
    ScrapeContext, TargetExporter,
};

/// Prometheus exporter for data-source queries.
#[derive(Parser, Debug)]
#[command(name = "querysight-exporter")]
#[command(about = "Export data-source query results as Prometheus metrics")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format).
    #[arg(short, long, default_value = "querysight.json5")]
    config: String,

    /// HTTP listen address (overrides config).
    #[arg(long)]
    listen: Option<String>,

    /// Log level (trace, debug, info, warn, error). Overrides config.
    #[arg(long)]
    log_level: Option<String>,

    /// Load and resolve the configuration, then exit.
    #[arg(long)]
    check_config: bool,
}

/// Engine used when no data-source driver is linked in.
///
/// Every collector fails, so each target reports `up 0`.
struct UnconfiguredEngine;

#[async_trait]
impl QueryEngine for UnconfiguredEngine {
    async fn run(
        &self,
        _ctx: &ScrapeContext,
        target: &ResolvedTarget,
        collector: &CollectorConfig,
    ) -> Result<Vec<MetricFamily>, CollectError> {
        Err(CollectError::Query {
            target: target.name.clone(),
            collector: collector.name.clone(),
            message: "no query engine available for data source".to_string(),
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut resolved = ExporterConfig::load_from_file(&args.config)
        .map_err(|e| anyhow::anyhow!("Failed to load {}: {}", args.config, e))?;

    // Override from CLI
    if let Some(listen) = args.listen {
        resolved.config.web.listen = listen;
    }
    if let Some(level) = args.log_level {
        resolved.config.logging.level = level;
    }

    init_tracing(&resolved.config.logging)?;

    for target in &resolved.targets {
        let collectors: Vec<&str> = target.collectors.iter().map(|c| c.name.as_str()).collect();
        info!(
            target = %target.name,
            job = target.job.as_deref().unwrap_or("-"),
            collectors = ?collectors,
            "Resolved target"
        );
    }

    if args.check_config {
        info!(
            collectors = resolved.catalog.len(),
            targets = resolved.targets.len(),
            "Configuration OK"
        );
        return Ok(());
    }

    info!(
        scrape_timeout = %format_duration(resolved.config.global.scrape_timeout),
        scrape_timeout_offset = %format_duration(resolved.config.global.scrape_timeout_offset),
        "Starting QuerySight exporter"
    );

    // Create shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Parse listen address
    let listen_addr = resolved
        .config
        .web
        .listen
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid listen address: {}", e))?;

    // Create components
    let exporter = Arc::new(TargetExporter::new(resolved.targets, UnconfiguredEngine));
    let state = AppState::new(exporter, resolved.config.global.clone(), Registry::new())?;
    let http_server = HttpServer::new(state, listen_addr, resolved.config.web.path.clone());

    // Start HTTP server
    let http_shutdown = shutdown_rx.clone();
    let http_task = tokio::spawn(async move {
        if let Err(e) = http_server.run(http_shutdown).await {
            error!("HTTP server error: {}", e);
        }
    });

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = terminate() => {
            info!("Received SIGTERM, shutting down...");
        }
    }

    // Signal shutdown
    shutdown_tx.send(true)?;

    // Wait for tasks to complete
    let _ = tokio::time::timeout(Duration::from_secs(5), http_task).await;

    info!("Exporter stopped");
    Ok(())
}

async fn terminate() {
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        std::future::pending::<()>().await;
    }
}
