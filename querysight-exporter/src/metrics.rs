//! The exporter's own scrape metrics.
//!
//! Registered on the service registry, which the scrape handler gathers
//! next to the exporter's metrics on every request.

use std::time::Duration;

use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};

use crate::error::{GatherError, MultiError};

/// Counters and histograms describing scrape handling.
#[derive(Clone)]
pub struct ScrapeMetrics {
    requests: IntCounterVec,
    duration: HistogramVec,
    gather_errors: IntCounterVec,
}

impl ScrapeMetrics {
    /// Create the metrics and register them on `registry`.
    pub fn register(registry: &Registry) -> prometheus::Result<Self> {
        let requests = IntCounterVec::new(
            Opts::new(
                "querysight_scrape_requests_total",
                "Scrape requests served, by HTTP status code.",
            ),
            &["code"],
        )?;
        registry.register(Box::new(requests.clone()))?;

        let duration = HistogramVec::new(
            HistogramOpts::new(
                "querysight_scrape_duration_seconds",
                "Time spent serving scrape requests, by HTTP status code.",
            )
            .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
            &["code"],
        )?;
        registry.register(Box::new(duration.clone()))?;

        let gather_errors = IntCounterVec::new(
            Opts::new(
                "querysight_gather_errors_total",
                "Errors encountered while gathering metrics, by kind.",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(gather_errors.clone()))?;

        Ok(Self {
            requests,
            duration,
            gather_errors,
        })
    }

    /// Record a finished scrape request.
    pub fn observe(&self, status: u16, elapsed: Duration) {
        let code = status.to_string();
        self.requests.with_label_values(&[code.as_str()]).inc();
        self.duration
            .with_label_values(&[code.as_str()])
            .observe(elapsed.as_secs_f64());
    }

    /// Count gather errors by kind.
    pub fn record_gather_errors(&self, errors: &MultiError<GatherError>) {
        for err in errors {
            self.gather_errors.with_label_values(&[err.kind()]).inc();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family<'a>(
        families: &'a [prometheus::proto::MetricFamily],
        name: &str,
    ) -> Option<&'a prometheus::proto::MetricFamily> {
        families.iter().find(|mf| mf.get_name() == name)
    }

    #[test]
    fn test_observe() {
        let registry = Registry::new();
        let metrics = ScrapeMetrics::register(&registry).unwrap();

        metrics.observe(200, Duration::from_millis(30));
        metrics.observe(200, Duration::from_millis(60));
        metrics.observe(408, Duration::from_secs(5));

        let families = registry.gather();
        let requests = family(&families, "querysight_scrape_requests_total").unwrap();
        assert_eq!(requests.get_metric().len(), 2);

        let ok = requests
            .get_metric()
            .iter()
            .find(|m| m.get_label()[0].get_value() == "200")
            .unwrap();
        assert_eq!(ok.get_counter().get_value(), 2.0);

        let duration = family(&families, "querysight_scrape_duration_seconds").unwrap();
        assert_eq!(duration.get_metric().len(), 2);
    }

    #[test]
    fn test_record_gather_errors() {
        let registry = Registry::new();
        let metrics = ScrapeMetrics::register(&registry).unwrap();

        let mut errors = MultiError::new();
        errors.push(GatherError::DeadlineExceeded);
        errors.push(GatherError::InvalidMetricName {
            name: "1bad".to_string(),
        });
        errors.push(GatherError::InvalidMetricName {
            name: "2bad".to_string(),
        });
        metrics.record_gather_errors(&errors);

        let families = registry.gather();
        let gather_errors = family(&families, "querysight_gather_errors_total").unwrap();
        let counts: Vec<(&str, f64)> = gather_errors
            .get_metric()
            .iter()
            .map(|m| (m.get_label()[0].get_value(), m.get_counter().get_value()))
            .collect();
        assert_eq!(counts, vec![("deadline", 1.0), ("invalid_name", 2.0)]);
    }

    #[test]
    fn test_register_twice_fails() {
        let registry = Registry::new();
        ScrapeMetrics::register(&registry).unwrap();
        assert!(ScrapeMetrics::register(&registry).is_err());
    }
}
