//! HTTP server for Prometheus metrics endpoint.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::State;
use axum::http::header::{ACCEPT, ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use prometheus::Registry;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::GlobalConfig;
use crate::context::ScrapeContext;
use crate::encode::encode;
use crate::exporter::Exporter;
use crate::gather::{Gathered, gather};
use crate::metrics::ScrapeMetrics;
use crate::pool::BufferPool;
use crate::timeout::{SCRAPE_TIMEOUT_HEADER, scrape_timeout};

/// Path of the liveness endpoint. The metrics path must differ from it.
pub const HEALTH_PATH: &str = "/health";

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    exporter: Arc<dyn Exporter>,
    service: Registry,
    metrics: ScrapeMetrics,
    global: GlobalConfig,
    pool: Arc<BufferPool>,
}

impl AppState {
    /// Create the state, registering the scrape metrics on `service`.
    ///
    /// `service` is gathered alongside the exporter on every scrape.
    pub fn new(
        exporter: Arc<dyn Exporter>,
        global: GlobalConfig,
        service: Registry,
    ) -> prometheus::Result<Self> {
        let metrics = ScrapeMetrics::register(&service)?;
        Ok(Self {
            exporter,
            service,
            metrics,
            global,
            pool: Arc::new(BufferPool::new()),
        })
    }
}

/// Create the HTTP router.
pub fn create_router(state: AppState, metrics_path: &str) -> Router {
    Router::new()
        .route(metrics_path, get(metrics_handler))
        .route(HEALTH_PATH, get(health_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Handler for the metrics endpoint.
async fn metrics_handler(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let started = Instant::now();

    let timeout = scrape_timeout(header(&headers, SCRAPE_TIMEOUT_HEADER), &state.global);
    let ctx = ScrapeContext::new(timeout);
    let gathered = gather(&ctx, state.exporter.as_ref(), &state.service).await;
    drop(ctx);

    state.metrics.record_gather_errors(&gathered.errors);
    let response = respond(&state.pool, gathered, &headers);

    state
        .metrics
        .observe(response.status().as_u16(), started.elapsed());
    response
}

/// Turn a gather result into a response.
fn respond(pool: &BufferPool, gathered: Gathered, headers: &HeaderMap) -> Response {
    if gathered.deadline_exceeded() {
        error!(error = %gathered.errors, "Timeout collecting metrics");
        return (
            StatusCode::REQUEST_TIMEOUT,
            "Timeout while collecting metrics",
        )
            .into_response();
    }

    if gathered.families.is_empty() {
        error!(error = %gathered.errors, "No metrics gathered");
        let body = if gathered.errors.is_empty() {
            "No metrics gathered".to_string()
        } else {
            format!("No metrics gathered, {}", gathered.errors)
        };
        return (StatusCode::INTERNAL_SERVER_ERROR, body).into_response();
    }

    if !gathered.errors.is_empty() {
        warn!(error = %gathered.errors, "Error gathering metrics");
    }

    let encoded = match encode(
        pool,
        &gathered.families,
        header(headers, ACCEPT.as_str()),
        header(headers, ACCEPT_ENCODING.as_str()),
    ) {
        Ok(encoded) => encoded,
        Err(errors) => {
            error!(error = %errors, "Error encoding metrics");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("No metrics encoded, {}", errors),
            )
                .into_response();
        }
    };

    let mut response_headers = HeaderMap::new();
    response_headers.insert(CONTENT_TYPE, HeaderValue::from_static(encoded.content_type));
    response_headers.insert(CONTENT_LENGTH, HeaderValue::from(encoded.body.len()));
    if let Some(encoding) = encoded.content_encoding {
        response_headers.insert(CONTENT_ENCODING, HeaderValue::from_static(encoding));
    }

    (StatusCode::OK, response_headers, encoded.body).into_response()
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Handler for the /health endpoint.
async fn health_handler() -> Response {
    (StatusCode::OK, "healthy\n").into_response()
}

/// HTTP server configuration.
pub struct HttpServer {
    state: AppState,
    listen_addr: SocketAddr,
    metrics_path: String,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(state: AppState, listen_addr: SocketAddr, metrics_path: String) -> Self {
        Self {
            state,
            listen_addr,
            metrics_path,
        }
    }

    /// Run the HTTP server until the shutdown signal is received.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.listen_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", self.listen_addr, e))?;

        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener until the shutdown signal is received.
    pub async fn serve(
        self,
        listener: tokio::net::TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let router = create_router(self.state, &self.metrics_path);
        let addr = listener.local_addr()?;

        info!(
            addr = %addr,
            path = %self.metrics_path,
            "HTTP server listening"
        );

        // Run server with graceful shutdown
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                // Wait for shutdown signal
                loop {
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                    if *shutdown.borrow() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
            .map_err(|e| anyhow::anyhow!("HTTP server error: {}", e))?;

        info!("HTTP server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::{PROTOBUF_CONTENT_TYPE, TEXT_CONTENT_TYPE};
    use crate::error::{GatherError, MultiError};
    use crate::exporter::{CollectError, Collection, family, gauge_metric};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use flate2::read::GzDecoder;
    use prometheus::proto::{MetricFamily, MetricType};
    use std::io::Read;
    use std::time::Duration;
    use tower::ServiceExt;

    /// Exporter returning fixed families and errors, after an optional delay.
    struct TestExporter {
        families: Vec<MetricFamily>,
        errors: Vec<CollectError>,
        delay: Duration,
    }

    #[async_trait]
    impl Exporter for TestExporter {
        async fn collect(&self, _ctx: &ScrapeContext) -> Collection {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Collection {
                families: self.families.clone(),
                errors: self.errors.clone(),
            }
        }
    }

    fn up_family() -> MetricFamily {
        let mut mf = family("up", "Target is up.", MetricType::GAUGE);
        mf.mut_metric().push(gauge_metric(
            &[("target".to_string(), "db1".to_string())],
            1.0,
        ));
        mf
    }

    fn exporter(families: Vec<MetricFamily>, errors: Vec<CollectError>) -> TestExporter {
        TestExporter {
            families,
            errors,
            delay: Duration::ZERO,
        }
    }

    fn no_timeout() -> GlobalConfig {
        GlobalConfig {
            scrape_timeout: Duration::ZERO,
            scrape_timeout_offset: Duration::ZERO,
        }
    }

    fn router(exporter: TestExporter, global: GlobalConfig) -> Router {
        let state = AppState::new(Arc::new(exporter), global, Registry::new()).unwrap();
        create_router(state, "/metrics")
    }

    fn scrape() -> axum::http::request::Builder {
        Request::get("/metrics")
    }

    async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let router = router(exporter(vec![up_family()], vec![]), no_timeout());

        let response = router
            .oneshot(scrape().body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            TEXT_CONTENT_TYPE
        );
        assert!(response.headers().get(CONTENT_ENCODING).is_none());

        let length: usize = response
            .headers()
            .get(CONTENT_LENGTH)
            .unwrap()
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        let body = body_string(response).await;
        assert_eq!(length, body.len());
        assert!(body.contains("up{target=\"db1\"} 1"));
    }

    #[tokio::test]
    async fn test_timeout_from_header() {
        let slow = TestExporter {
            families: vec![up_family()],
            errors: vec![],
            delay: Duration::from_secs(10),
        };
        let router = router(slow, no_timeout());

        let response = router
            .oneshot(
                scrape()
                    .header(SCRAPE_TIMEOUT_HEADER, "0.05")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
        assert_eq!(body_string(response).await, "Timeout while collecting metrics");
    }

    #[tokio::test]
    async fn test_timeout_from_config() {
        let slow = TestExporter {
            families: vec![up_family()],
            errors: vec![],
            delay: Duration::from_secs(10),
        };
        let global = GlobalConfig {
            scrape_timeout: Duration::from_millis(50),
            scrape_timeout_offset: Duration::ZERO,
        };

        let response = router(slow, global)
            .oneshot(scrape().body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
    }

    #[tokio::test]
    async fn test_no_families_gathered() {
        let failing = exporter(
            vec![],
            vec![CollectError::Target {
                target: "db1".to_string(),
                message: "connection refused".to_string(),
            }],
        );
        // A bare registry: the scrape metrics are vectors and stay empty
        // until the first scrape has been observed.
        let response = router(failing, no_timeout())
            .oneshot(scrape().body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body_string(response).await,
            "No metrics gathered, [db1] connection refused"
        );
    }

    #[tokio::test]
    async fn test_partial_gather_is_served() {
        let partial = exporter(
            vec![up_family()],
            vec![CollectError::Query {
                target: "db1".to_string(),
                collector: "pg_locks".to_string(),
                message: "permission denied".to_string(),
            }],
        );

        let response = router(partial, no_timeout())
            .oneshot(scrape().body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_string(response).await.contains("up{target=\"db1\"} 1"));
    }

    #[tokio::test]
    async fn test_failed_exporter_serves_service_metrics() {
        let failed = exporter(
            vec![],
            vec![CollectError::Query {
                target: "db1".to_string(),
                collector: "pg_locks".to_string(),
                message: "connection refused".to_string(),
            }],
        );

        let service = Registry::new();
        let build_info =
            prometheus::Gauge::new("querysight_build_info", "Build information.").unwrap();
        build_info.set(1.0);
        service.register(Box::new(build_info)).unwrap();

        let state = AppState::new(Arc::new(failed), no_timeout(), service).unwrap();
        let response = create_router(state, "/metrics")
            .oneshot(scrape().body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_string(response).await;
        assert!(body.contains("querysight_build_info 1"), "{}", body);
        assert!(!body.contains("up{"), "{}", body);
    }

    #[tokio::test]
    async fn test_encode_failure() {
        let pool = BufferPool::new();
        let gathered = Gathered {
            families: vec![family("empty", "No samples.", MetricType::GAUGE)],
            errors: MultiError::new(),
        };

        let response = respond(&pool, gathered, &HeaderMap::new());

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body_string(response).await.starts_with("No metrics encoded, "));
    }

    #[tokio::test]
    async fn test_empty_gather_without_errors() {
        let pool = BufferPool::new();
        let response = respond(&pool, Gathered::default(), &HeaderMap::new());

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_string(response).await, "No metrics gathered");
    }

    #[tokio::test]
    async fn test_deadline_wins_over_families() {
        let pool = BufferPool::new();
        let mut errors = MultiError::new();
        errors.push(GatherError::DeadlineExceeded);
        let gathered = Gathered {
            families: vec![up_family()],
            errors,
        };

        let response = respond(&pool, gathered, &HeaderMap::new());
        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
    }

    #[tokio::test]
    async fn test_gzip_response() {
        let router = router(exporter(vec![up_family()], vec![]), no_timeout());

        let response = router
            .oneshot(
                scrape()
                    .header(ACCEPT_ENCODING, "gzip, deflate")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get(CONTENT_ENCODING).unwrap(), "gzip");

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let mut body = String::new();
        GzDecoder::new(bytes.as_ref())
            .read_to_string(&mut body)
            .unwrap();
        assert!(body.contains("up{target=\"db1\"} 1"));
    }

    #[tokio::test]
    async fn test_protobuf_response() {
        let router = router(exporter(vec![up_family()], vec![]), no_timeout());
        let accept = "application/vnd.google.protobuf;proto=io.prometheus.client.MetricFamily;encoding=delimited;q=0.7,text/plain;version=0.0.4;q=0.3";

        let response = router
            .oneshot(scrape().header(ACCEPT, accept).body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            PROTOBUF_CONTENT_TYPE
        );
    }

    #[tokio::test]
    async fn test_scrape_metrics_exposed() {
        let router = router(exporter(vec![up_family()], vec![]), no_timeout());

        let first = router
            .clone()
            .oneshot(scrape().body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = router
            .oneshot(scrape().body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_string(second).await;
        assert!(body.contains("querysight_scrape_requests_total{code=\"200\"} 1"));
        assert!(body.contains("querysight_scrape_duration_seconds_count{code=\"200\"} 1"));
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let router = router(exporter(vec![], vec![]), no_timeout());

        let response = router
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "healthy\n");
    }

    #[tokio::test]
    async fn test_custom_metrics_path() {
        let state = AppState::new(
            Arc::new(exporter(vec![up_family()], vec![])),
            no_timeout(),
            Registry::new(),
        )
        .unwrap();
        let router = create_router(state, "/prometheus/metrics");

        // Custom path should work
        let response = router
            .clone()
            .oneshot(
                Request::get("/prometheus/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Default path should 404
        let response = router
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
