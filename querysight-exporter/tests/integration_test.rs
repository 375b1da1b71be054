//! Integration tests for the query exporter.
//!
//! These tests verify the full flow from loading a configuration with
//! collector files to serving the resolved collectors' metrics over HTTP.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use prometheus::Registry;
use prometheus::proto::{MetricFamily, MetricType};
use tokio::sync::watch;
use tower::ServiceExt;

use querysight_exporter::config::CollectorConfig;
use querysight_exporter::exporter::{family, gauge_metric};
use querysight_exporter::timeout::SCRAPE_TIMEOUT_HEADER;
use querysight_exporter::{
    AppState, CollectError, ConfigError, ExporterConfig, HttpServer, QueryEngine,
    ResolvedConfig, ResolvedTarget, ScrapeContext, TargetExporter, create_router,
};

/// Engine answering every query with a gauge of value 1.
struct EchoEngine;

#[async_trait]
impl QueryEngine for EchoEngine {
    async fn run(
        &self,
        _ctx: &ScrapeContext,
        target: &ResolvedTarget,
        collector: &CollectorConfig,
    ) -> Result<Vec<MetricFamily>, CollectError> {
        Ok(collector
            .queries
            .iter()
            .map(|q| {
                let mut mf = family(&q.metric_name, &q.help, MetricType::GAUGE);
                let labels = vec![("target".to_string(), target.name.clone())];
                mf.mut_metric().push(gauge_metric(&labels, 1.0));
                mf
            })
            .collect())
    }
}

/// Engine that never answers before the scrape is cancelled.
struct HangingEngine;

#[async_trait]
impl QueryEngine for HangingEngine {
    async fn run(
        &self,
        ctx: &ScrapeContext,
        _target: &ResolvedTarget,
        _collector: &CollectorConfig,
    ) -> Result<Vec<MetricFamily>, CollectError> {
        ctx.cancelled().await;
        Err(CollectError::DeadlineExceeded)
    }
}

const CONFIG: &str = r#"{
    global: { scrape_timeout: "5s", scrape_timeout_offset: "100ms" },
    collector_files: ["collectors/*.collector.json5"],
    jobs: [{
        job_name: "pg",
        collectors: ["pg_*", "inline"],
        static_configs: [{
            targets: { db1: "postgres://db1/app", db2: "postgres://db2/app" },
            labels: { env: "test" }
        }]
    }],
    collectors: [
        { collector_name: "inline", queries: [{ metric_name: "inline_rows", help: "Inline rows.", query: "SELECT 1" }] }
    ],
    web: { listen: "127.0.0.1:0" }
}"#;

fn write_config(dir: &Path, config: &str) -> std::path::PathBuf {
    let collectors = dir.join("collectors");
    std::fs::create_dir_all(&collectors).unwrap();
    std::fs::write(
        collectors.join("stat.collector.json5"),
        r#"{ collector_name: "pg_stat", queries: [{ metric_name: "pg_stat_rows", help: "Stat rows.", query: "SELECT 1" }] }"#,
    )
    .unwrap();
    std::fs::write(
        collectors.join("locks.collector.json5"),
        r#"[{ collector_name: "pg_locks", queries: [{ metric_name: "pg_locks_count", help: "Locks.", query: "SELECT 1" }] }]"#,
    )
    .unwrap();

    let path = dir.join("querysight.json5");
    std::fs::write(&path, config).unwrap();
    path
}

fn load() -> (tempfile::TempDir, ResolvedConfig) {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(dir.path(), CONFIG);
    let resolved = ExporterConfig::load_from_file(&path).unwrap();
    (dir, resolved)
}

fn state<E: QueryEngine + 'static>(resolved: ResolvedConfig, engine: E) -> AppState {
    let exporter = Arc::new(TargetExporter::new(resolved.targets, engine));
    AppState::new(exporter, resolved.config.global, Registry::new()).unwrap()
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[test]
fn test_load_resolves_collector_files() {
    let (_dir, resolved) = load();

    assert_eq!(
        resolved.catalog.names(),
        vec!["inline", "pg_locks", "pg_stat"]
    );
    assert_eq!(resolved.targets.len(), 2);

    for target in &resolved.targets {
        assert_eq!(target.job.as_deref(), Some("pg"));
        let names: Vec<&str> = target.collectors.iter().map(|c| c.name.as_str()).collect();
        // Glob matches sorted, then the exact reference.
        assert_eq!(names, vec!["pg_locks", "pg_stat", "inline"]);
    }
}

#[test]
fn test_load_reports_unknown_collector() {
    let dir = tempfile::tempdir().unwrap();
    let config = CONFIG.replace(r#"["pg_*", "inline"]"#, r#"["pg_*", "mysql_status"]"#);
    let path = write_config(dir.path(), &config);

    let err = ExporterConfig::load_from_file(&path).unwrap_err();
    assert_eq!(
        err.to_string(),
        "unknown collector \"mysql_status\" referenced in job \"pg\""
    );
}

#[test]
fn test_load_fails_on_bad_collector_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(dir.path(), CONFIG);
    std::fs::write(
        dir.path().join("collectors").join("broken.collector.json5"),
        "{ collector_name: ",
    )
    .unwrap();

    let err = ExporterConfig::load_from_file(&path).unwrap_err();
    assert!(matches!(err, ConfigError::CollectorFile { .. }), "{}", err);
}

#[tokio::test]
async fn test_scrape_resolved_targets() {
    let (_dir, resolved) = load();
    let router = create_router(state(resolved, EchoEngine), "/metrics");

    let response = router
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_string(response).await;
    for line in [
        "inline_rows{target=\"db1\"} 1",
        "pg_locks_count{target=\"db2\"} 1",
        "pg_stat_rows{target=\"db1\"} 1",
        "up{env=\"test\",job=\"pg\",target=\"db1\"} 1",
        "up{env=\"test\",job=\"pg\",target=\"db2\"} 1",
    ] {
        assert!(body.contains(line), "missing {:?} in:\n{}", line, body);
    }

    // Families come out sorted by name.
    let inline = body.find("# TYPE inline_rows").unwrap();
    let up = body.find("# TYPE up").unwrap();
    assert!(inline < up);
}

#[tokio::test]
async fn test_scrape_honours_prometheus_timeout() {
    let (_dir, resolved) = load();
    let router = create_router(state(resolved, HangingEngine), "/metrics");

    let started = std::time::Instant::now();
    let response = router
        .oneshot(
            Request::get("/metrics")
                .header(SCRAPE_TIMEOUT_HEADER, "0.2")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
    // 200ms minus the 100ms offset, well below the configured 5s.
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_http_server_serves_metrics() {
    let (_dir, resolved) = load();
    let path = resolved.config.web.path.clone();
    let state = state(resolved, EchoEngine);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server = HttpServer::new(state, addr, path);
    let server_handle = tokio::spawn(async move { server.serve(listener, shutdown_rx).await });

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{}/metrics", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body = response.text().await.unwrap();
    assert!(body.contains("up{env=\"test\",job=\"pg\",target=\"db1\"} 1"));

    let health = client
        .get(format!("http://{}/health", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(health.status(), reqwest::StatusCode::OK);

    shutdown_tx.send(true).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), server_handle)
        .await
        .expect("server should stop after shutdown")
        .unwrap();
    assert!(result.is_ok());
}
