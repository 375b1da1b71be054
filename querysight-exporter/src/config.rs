//! Configuration for the query exporter.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use querysight_common::LoggingConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::catalog::CollectorCatalog;
use crate::http::HEALTH_PATH;
use crate::naming::is_valid_label_name;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] json5::Error),
    #[error(transparent)]
    Common(#[from] querysight_common::Error),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("unknown collector {reference:?} referenced in {context}")]
    UnknownCollector { reference: String, context: String },
    #[error("duplicate collector name {0:?}")]
    DuplicateCollector(String),
    #[error("collector file {}: {source}", path.display())]
    CollectorFile {
        path: PathBuf,
        #[source]
        source: Box<ConfigError>,
    },
    #[error("invalid collector_files pattern {pattern:?}: {source}")]
    FilePattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },
}

/// Complete exporter configuration, as written in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExporterConfig {
    /// Scrape-wide settings.
    #[serde(default)]
    pub global: GlobalConfig,

    /// Glob patterns of additional collector definition files.
    ///
    /// Relative patterns are resolved against the config file's directory.
    #[serde(default)]
    pub collector_files: Vec<String>,

    /// Single-target mode. Mutually exclusive with `jobs`.
    #[serde(default)]
    pub target: Option<TargetConfig>,

    /// Multi-target mode. Mutually exclusive with `target`.
    #[serde(default)]
    pub jobs: Vec<JobConfig>,

    /// Inline collector definitions.
    #[serde(default)]
    pub collectors: Vec<CollectorConfig>,

    /// HTTP endpoint settings.
    #[serde(default)]
    pub web: WebConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Scrape timeout settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Upper bound on a scrape; `0s` disables it (default: "10s").
    #[serde(
        default = "default_scrape_timeout",
        with = "querysight_common::duration"
    )]
    pub scrape_timeout: Duration,

    /// Subtracted from Prometheus' scrape timeout to leave room for network
    /// latency (default: "500ms").
    #[serde(
        default = "default_scrape_timeout_offset",
        with = "querysight_common::duration"
    )]
    pub scrape_timeout_offset: Duration,
}

fn default_scrape_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_scrape_timeout_offset() -> Duration {
    Duration::from_millis(500)
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            scrape_timeout: default_scrape_timeout(),
            scrape_timeout_offset: default_scrape_timeout_offset(),
        }
    }
}

/// HTTP endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    /// Address to listen on (default: "0.0.0.0:9399").
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Path for metrics endpoint (default: "/metrics").
    #[serde(default = "default_path")]
    pub path: String,
}

fn default_listen() -> String {
    "0.0.0.0:9399".to_string()
}

fn default_path() -> String {
    "/metrics".to_string()
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            path: default_path(),
        }
    }
}

/// A single data source scraped on every request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Name reported on the `target` label (default: "target").
    #[serde(default)]
    pub name: Option<String>,

    /// Connection string handed to the query engine.
    pub data_source_name: String,

    /// Collector references: exact names or glob patterns.
    pub collectors: Vec<String>,
}

/// A group of data sources sharing the same collectors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub job_name: String,

    /// Collector references: exact names or glob patterns.
    pub collectors: Vec<String>,

    #[serde(default)]
    pub static_configs: Vec<StaticConfig>,
}

/// Named data sources plus labels attached to their `up` series.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StaticConfig {
    /// Target name to connection string.
    pub targets: BTreeMap<String, String>,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// A named, reusable set of queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectorConfig {
    #[serde(rename = "collector_name")]
    pub name: String,

    #[serde(default)]
    pub queries: Vec<QueryConfig>,
}

/// One query whose result becomes a metric. Interpreted by the query engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryConfig {
    pub metric_name: String,

    #[serde(default)]
    pub help: String,

    pub query: String,
}

/// A target with its collector references resolved.
#[derive(Debug, Clone)]
pub struct ResolvedTarget {
    pub name: String,
    /// Owning job, `None` in single-target mode.
    pub job: Option<String>,
    pub data_source_name: String,
    pub labels: BTreeMap<String, String>,
    pub collectors: Vec<Arc<CollectorConfig>>,
}

/// Configuration after collector files are loaded and references resolved.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub config: ExporterConfig,
    pub catalog: CollectorCatalog,
    pub targets: Vec<ResolvedTarget>,
}

impl ExporterConfig {
    /// Load, validate and resolve a configuration file.
    ///
    /// Collector files are looked up relative to the file's directory.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<ResolvedConfig, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config = Self::parse(&content)?;
        config.resolve(path.parent())
    }

    /// Parse configuration from a JSON5 string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: ExporterConfig = json5::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match (&self.target, self.jobs.is_empty()) {
            (Some(_), false) | (None, true) => {
                return Err(ConfigError::Validation(
                    "exactly one of `jobs` and `target` must be defined".to_string(),
                ));
            }
            _ => {}
        }

        if let Some(target) = &self.target
            && target.data_source_name.is_empty()
        {
            return Err(ConfigError::Validation(
                "target data_source_name must not be empty".to_string(),
            ));
        }

        let mut job_names = HashSet::new();
        let mut target_names = HashSet::new();
        for job in &self.jobs {
            if job.job_name.is_empty() {
                return Err(ConfigError::Validation(
                    "job_name must not be empty".to_string(),
                ));
            }
            if !job_names.insert(job.job_name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate job name {:?}",
                    job.job_name
                )));
            }
            for static_config in &job.static_configs {
                for (name, dsn) in &static_config.targets {
                    if dsn.is_empty() {
                        return Err(ConfigError::Validation(format!(
                            "empty data source name for target {:?} in job {:?}",
                            name, job.job_name
                        )));
                    }
                    if !target_names.insert(name.as_str()) {
                        return Err(ConfigError::Validation(format!(
                            "duplicate target name {:?} in job {:?}",
                            name, job.job_name
                        )));
                    }
                }
                if let Some(label) = static_config
                    .labels
                    .keys()
                    .find(|k| !is_valid_label_name(k))
                {
                    return Err(ConfigError::Validation(format!(
                        "invalid label name {:?} in job {:?}",
                        label, job.job_name
                    )));
                }
            }
        }

        if self.collectors.iter().any(|c| c.name.is_empty()) {
            return Err(ConfigError::Validation(
                "collector_name must not be empty".to_string(),
            ));
        }

        // Validate listen address format
        if self.web.listen.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::Validation(format!(
                "Invalid listen address: {}",
                self.web.listen
            )));
        }

        // Validate path starts with /
        if !self.web.path.starts_with('/') {
            return Err(ConfigError::Validation(
                "Metrics path must start with /".to_string(),
            ));
        }
        if self.web.path == HEALTH_PATH {
            return Err(ConfigError::Validation(format!(
                "Metrics path must not be {}",
                HEALTH_PATH
            )));
        }

        Ok(())
    }

    /// Expand `collector_files` patterns into concrete paths.
    ///
    /// Patterns are expanded in order; matches of one pattern are sorted.
    /// A pattern matching no file contributes nothing.
    pub fn collector_file_paths(
        &self,
        base_dir: Option<&Path>,
    ) -> Result<Vec<PathBuf>, ConfigError> {
        let mut paths = Vec::new();

        for pattern in &self.collector_files {
            let full = match base_dir {
                Some(dir) if Path::new(pattern).is_relative() && !dir.as_os_str().is_empty() => {
                    format!(
                        "{}{}{}",
                        glob::Pattern::escape(&dir.to_string_lossy()),
                        std::path::MAIN_SEPARATOR,
                        pattern
                    )
                }
                _ => pattern.clone(),
            };

            let entries = glob::glob(&full).map_err(|source| ConfigError::FilePattern {
                pattern: pattern.clone(),
                source,
            })?;

            let mut matched = Vec::new();
            for entry in entries {
                matched.push(entry.map_err(|e| ConfigError::Io(e.into_error()))?);
            }
            matched.sort();

            debug!(pattern = %pattern, matched = matched.len(), "Expanded collector_files pattern");
            paths.extend(matched);
        }

        Ok(paths)
    }

    /// Build the collector catalog and resolve every target's references.
    pub fn resolve(self, base_dir: Option<&Path>) -> Result<ResolvedConfig, ConfigError> {
        let mut catalog = CollectorCatalog::from_collectors(self.collectors.iter().cloned())?;
        let files = self.collector_file_paths(base_dir)?;
        catalog.load_files(&files)?;

        let mut targets = Vec::new();

        if let Some(target) = &self.target {
            targets.push(ResolvedTarget {
                name: target.name.clone().unwrap_or_else(|| "target".to_string()),
                job: None,
                data_source_name: target.data_source_name.clone(),
                labels: BTreeMap::new(),
                collectors: catalog.resolve(&target.collectors, "target")?,
            });
        }

        for job in &self.jobs {
            let context = format!("job {:?}", job.job_name);
            let collectors = catalog.resolve(&job.collectors, &context)?;

            for static_config in &job.static_configs {
                for (name, dsn) in &static_config.targets {
                    targets.push(ResolvedTarget {
                        name: name.clone(),
                        job: Some(job.job_name.clone()),
                        data_source_name: dsn.clone(),
                        labels: static_config.labels.clone(),
                        collectors: collectors.clone(),
                    });
                }
            }
        }

        Ok(ResolvedConfig {
            config: self,
            catalog,
            targets,
        })
    }
}
