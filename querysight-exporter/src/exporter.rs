//! Metric-producing side of a scrape.
//!
//! An [`Exporter`] yields metric families under a [`ScrapeContext`]. The
//! bundled [`TargetExporter`] fans the resolved collectors of every target
//! out to a [`QueryEngine`], which is the component that actually talks to
//! data sources.

use async_trait::async_trait;
use futures::future::join_all;
use prometheus::proto::{Gauge, LabelPair, Metric, MetricFamily, MetricType};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{CollectorConfig, ResolvedTarget};
use crate::context::ScrapeContext;

/// Errors reported by an exporter for part or all of a collection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollectError {
    #[error("context deadline exceeded")]
    DeadlineExceeded,

    #[error("context cancelled")]
    Cancelled,

    /// A single collector failed against a target.
    #[error("[{target}] collector {collector:?}: {message}")]
    Query {
        target: String,
        collector: String,
        message: String,
    },

    /// The target as a whole could not be scraped.
    #[error("[{target}] {message}")]
    Target { target: String, message: String },
}

/// Families produced by an exporter, alongside any errors.
///
/// Partial results are normal: some collectors may fail while others
/// succeed.
#[derive(Debug, Default)]
pub struct Collection {
    pub families: Vec<MetricFamily>,
    pub errors: Vec<CollectError>,
}

impl Collection {
    /// A collection that produced nothing.
    pub fn failed(err: CollectError) -> Self {
        Self {
            families: Vec::new(),
            errors: vec![err],
        }
    }
}

/// Primary metrics source of the scrape handler.
#[async_trait]
pub trait Exporter: Send + Sync {
    /// Collect metric families, observing `ctx` for cancellation.
    async fn collect(&self, ctx: &ScrapeContext) -> Collection;
}

/// Executes one collector's queries against one target.
#[async_trait]
pub trait QueryEngine: Send + Sync {
    async fn run(
        &self,
        ctx: &ScrapeContext,
        target: &ResolvedTarget,
        collector: &CollectorConfig,
    ) -> Result<Vec<MetricFamily>, CollectError>;
}

/// Exporter running every resolved collector of every target.
pub struct TargetExporter<E> {
    targets: Vec<ResolvedTarget>,
    engine: E,
}

impl<E: QueryEngine> TargetExporter<E> {
    pub fn new(targets: Vec<ResolvedTarget>, engine: E) -> Self {
        Self { targets, engine }
    }

    pub fn targets(&self) -> &[ResolvedTarget] {
        &self.targets
    }

    async fn scrape_target(
        &self,
        ctx: &ScrapeContext,
        target: &ResolvedTarget,
    ) -> (Vec<MetricFamily>, Vec<CollectError>) {
        let runs = target
            .collectors
            .iter()
            .map(|collector| self.engine.run(ctx, target, collector));

        let mut families = Vec::new();
        let mut errors = Vec::new();
        for result in join_all(runs).await {
            match result {
                Ok(mut produced) => families.append(&mut produced),
                Err(e) => {
                    warn!(target = %target.name, error = %e, "Collector failed");
                    errors.push(e);
                }
            }
        }

        debug!(
            target = %target.name,
            families = families.len(),
            errors = errors.len(),
            "Scraped target"
        );
        (families, errors)
    }
}

#[async_trait]
impl<E: QueryEngine> Exporter for TargetExporter<E> {
    async fn collect(&self, ctx: &ScrapeContext) -> Collection {
        let scrapes = self
            .targets
            .iter()
            .map(|target| self.scrape_target(ctx, target));
        let results = join_all(scrapes).await;

        let mut collection = Collection::default();
        let mut up = family(
            "up",
            "1 if the target was scraped successfully, 0 otherwise.",
            MetricType::GAUGE,
        );

        for (target, (mut families, mut errors)) in self.targets.iter().zip(results) {
            let value = if errors.is_empty() { 1.0 } else { 0.0 };
            up.mut_metric().push(gauge_metric(&target_labels(target), value));
            collection.families.append(&mut families);
            collection.errors.append(&mut errors);
        }

        if !up.get_metric().is_empty() {
            collection.families.push(up);
        }
        collection
    }
}

/// Labels identifying a target on the `up` series.
///
/// Static labels from the job cannot override `job` or `target`.
fn target_labels(target: &ResolvedTarget) -> Vec<(String, String)> {
    let mut labels = Vec::with_capacity(2 + target.labels.len());

    if let Some(job) = &target.job {
        labels.push(("job".to_string(), job.clone()));
    }
    labels.push(("target".to_string(), target.name.clone()));

    for (k, v) in &target.labels {
        if k != "job" && k != "target" {
            labels.push((k.clone(), v.clone()));
        }
    }

    labels.sort_by(|a, b| a.0.cmp(&b.0));
    labels
}

/// Build an empty metric family.
pub fn family(name: &str, help: &str, metric_type: MetricType) -> MetricFamily {
    let mut mf = MetricFamily::default();
    mf.set_name(name.to_string());
    mf.set_help(help.to_string());
    mf.set_field_type(metric_type);
    mf
}

/// Build a gauge sample with the given labels.
pub fn gauge_metric(labels: &[(String, String)], value: f64) -> Metric {
    let mut metric = Metric::default();
    for (name, val) in labels {
        let mut pair = LabelPair::default();
        pair.set_name(name.clone());
        pair.set_value(val.clone());
        metric.mut_label().push(pair);
    }

    let mut gauge = Gauge::default();
    gauge.set_value(value);
    metric.set_gauge(gauge);
    metric
}
