//! Error types for the scrape path.
//!
//! Configuration-time failures live in [`crate::config::ConfigError`]; the
//! types here are recovered into HTTP status codes by the scrape handler.

use std::fmt;

use thiserror::Error;

use crate::exporter::CollectError;

/// Errors surfaced while gathering metric families.
#[derive(Debug, Error)]
pub enum GatherError {
    /// The scrape deadline expired before the exporter finished.
    #[error("context deadline exceeded")]
    DeadlineExceeded,

    /// The exporter reported a failure for part of its work.
    #[error(transparent)]
    Collect(CollectError),

    #[error("{name:?} is not a valid metric name")]
    InvalidMetricName { name: String },

    /// A family disagrees with an earlier family of the same name.
    #[error("gathered metric family {name} has {detail}")]
    InconsistentFamily { name: String, detail: String },

    #[error("collected metric {name} {labels} {detail}")]
    InvalidMetric {
        name: String,
        labels: String,
        detail: String,
    },

    #[error(
        "collected metric {name} {labels} was collected before with the same name and label values"
    )]
    DuplicateMetric { name: String, labels: String },
}

impl GatherError {
    /// Short classification used as a label value on self-observability metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            GatherError::DeadlineExceeded => "deadline",
            GatherError::Collect(_) => "collect",
            GatherError::InvalidMetricName { .. } => "invalid_name",
            GatherError::InconsistentFamily { .. } => "inconsistent",
            GatherError::InvalidMetric { .. } => "invalid_metric",
            GatherError::DuplicateMetric { .. } => "duplicate",
        }
    }
}

impl From<CollectError> for GatherError {
    fn from(err: CollectError) -> Self {
        match err {
            CollectError::DeadlineExceeded => GatherError::DeadlineExceeded,
            other => GatherError::Collect(other),
        }
    }
}

/// Errors surfaced while encoding the response body.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("error encoding metric family {family:?}: {source}")]
    Family {
        family: String,
        #[source]
        source: prometheus::Error,
    },

    #[error("error finalizing response body: {0}")]
    Io(#[from] std::io::Error),
}

/// A collection of errors of one kind, reported together.
#[derive(Debug)]
pub struct MultiError<E>(Vec<E>);

impl<E> MultiError<E> {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, err: E) {
        self.0.push(err);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, E> {
        self.0.iter()
    }

    pub fn into_inner(self) -> Vec<E> {
        self.0
    }
}

impl<E> Default for MultiError<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Extend<E> for MultiError<E> {
    fn extend<I: IntoIterator<Item = E>>(&mut self, iter: I) {
        self.0.extend(iter);
    }
}

impl<'a, E> IntoIterator for &'a MultiError<E> {
    type Item = &'a E;
    type IntoIter = std::slice::Iter<'a, E>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl<E: fmt::Display> fmt::Display for MultiError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let [err] = self.0.as_slice() {
            return write!(f, "{}", err);
        }
        write!(f, "{} error(s) occurred:", self.0.len())?;
        for err in &self.0 {
            write!(f, "\n* {}", err)?;
        }
        Ok(())
    }
}

impl<E: std::error::Error> std::error::Error for MultiError<E> {}
