//! Merging the exporter's metrics with the exporter's own metrics.
//!
//! Families from both sources are merged by name, validated and sorted so
//! that the encoder only ever sees a consistent, canonical snapshot. Bad
//! families or samples are dropped and reported; they never fail the whole
//! gather.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet, btree_map::Entry};

use prometheus::Registry;
use prometheus::proto::{Metric, MetricFamily, MetricType};
use tracing::debug;

use crate::context::ScrapeContext;
use crate::error::{GatherError, MultiError};
use crate::exporter::{Collection, Exporter};
use crate::naming::{format_labels, is_valid_label_name, is_valid_metric_name};

/// Result of a gather: canonical families plus everything that went wrong.
#[derive(Debug, Default)]
pub struct Gathered {
    pub families: Vec<MetricFamily>,
    pub errors: MultiError<GatherError>,
}

impl Gathered {
    /// Whether the scrape deadline expired during collection.
    pub fn deadline_exceeded(&self) -> bool {
        self.errors
            .iter()
            .any(|e| matches!(e, GatherError::DeadlineExceeded))
    }
}

/// Collect from `exporter` under `ctx`, add the families of `service` and
/// canonicalize the result.
///
/// The service registry is always gathered, even when the exporter failed
/// or ran out of time.
pub async fn gather(ctx: &ScrapeContext, exporter: &dyn Exporter, service: &Registry) -> Gathered {
    let collection = match ctx.run(exporter.collect(ctx)).await {
        Ok(collection) => collection,
        Err(e) => Collection::failed(e),
    };

    let mut errors = MultiError::new();
    errors.extend(collection.errors.into_iter().map(GatherError::from));

    let mut families = collection.families;
    families.extend(service.gather());

    let families = canonicalize(families, &mut errors);
    debug!(
        families = families.len(),
        errors = errors.len(),
        "Gathered metric families"
    );

    Gathered { families, errors }
}

/// Merge families by name, validate them and sort them.
///
/// Output families are sorted by name and their metrics by label values.
/// Families left without any valid metric are omitted.
pub fn canonicalize(
    families: Vec<MetricFamily>,
    errors: &mut MultiError<GatherError>,
) -> Vec<MetricFamily> {
    let mut merged: BTreeMap<String, MetricFamily> = BTreeMap::new();
    let mut seen: HashSet<String> = HashSet::new();

    for mut mf in families {
        let name = mf.get_name().to_string();
        if !is_valid_metric_name(&name) {
            errors.push(GatherError::InvalidMetricName { name });
            continue;
        }

        let metrics = mf.take_metric().into_vec();
        let target = match merged.entry(name.clone()) {
            Entry::Vacant(entry) => entry.insert(mf),
            Entry::Occupied(entry) => {
                let existing = entry.into_mut();
                if let Some(detail) = inconsistency(existing, &mf) {
                    errors.push(GatherError::InconsistentFamily { name, detail });
                    continue;
                }
                existing
            }
        };

        let metric_type = target.get_field_type();
        for mut metric in metrics {
            metric
                .mut_label()
                .sort_by(|a, b| a.get_name().cmp(b.get_name()));

            match check_metric(&name, metric_type, &metric, &mut seen) {
                Ok(()) => target.mut_metric().push(metric),
                Err(e) => errors.push(e),
            }
        }
    }

    merged
        .into_values()
        .filter(|mf| !mf.get_metric().is_empty())
        .map(|mut mf| {
            mf.mut_metric().sort_by(compare_label_values);
            mf
        })
        .collect()
}

fn inconsistency(existing: &MetricFamily, other: &MetricFamily) -> Option<String> {
    if existing.get_field_type() != other.get_field_type() {
        return Some(format!(
            "type {:?} inconsistent with previously collected type {:?}",
            other.get_field_type(),
            existing.get_field_type()
        ));
    }
    if existing.get_help() != other.get_help() {
        return Some(format!(
            "help {:?} but should have {:?}",
            other.get_help(),
            existing.get_help()
        ));
    }
    None
}

fn check_metric(
    name: &str,
    metric_type: MetricType,
    metric: &Metric,
    seen: &mut HashSet<String>,
) -> Result<(), GatherError> {
    let labels = format_labels(
        metric
            .get_label()
            .iter()
            .map(|l| (l.get_name(), l.get_value())),
    );
    let invalid = |detail: String| GatherError::InvalidMetric {
        name: name.to_string(),
        labels: labels.clone(),
        detail,
    };

    let has_value = match metric_type {
        MetricType::COUNTER => metric.has_counter(),
        MetricType::GAUGE => metric.has_gauge(),
        MetricType::SUMMARY => metric.has_summary(),
        MetricType::HISTOGRAM => metric.has_histogram(),
        MetricType::UNTYPED => metric.has_untyped(),
    };
    if !has_value {
        return Err(invalid(format!("should be a {:?}", metric_type)));
    }

    if let Some(label) = metric
        .get_label()
        .iter()
        .find(|l| !is_valid_label_name(l.get_name()))
    {
        return Err(invalid(format!(
            "has a label with an invalid name: {:?}",
            label.get_name()
        )));
    }

    // Labels are sorted, so repeated names are adjacent.
    if let Some(pair) = metric
        .get_label()
        .windows(2)
        .find(|pair| pair[0].get_name() == pair[1].get_name())
    {
        return Err(invalid(format!(
            "has two or more labels with the same name: {}",
            pair[0].get_name()
        )));
    }

    if !seen.insert(format!("{}{}", name, labels)) {
        return Err(GatherError::DuplicateMetric {
            name: name.to_string(),
            labels,
        });
    }

    Ok(())
}

fn compare_label_values(a: &Metric, b: &Metric) -> Ordering {
    let a = a.get_label().iter().map(|l| l.get_value());
    let b = b.get_label().iter().map(|l| l.get_value());
    a.cmp(b)
}
