//! Collector catalog and reference resolution.
//!
//! Targets and jobs refer to collectors by name or by shell-style glob
//! pattern. References are resolved once, at configuration load, against a
//! catalog made of the inline collectors plus any collector files.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use glob::{MatchOptions, Pattern};
use tracing::debug;

use crate::config::{CollectorConfig, ConfigError};

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// All known collector definitions, keyed by name.
///
/// Read-only once configuration loading is done.
#[derive(Debug, Clone, Default)]
pub struct CollectorCatalog {
    collectors: HashMap<String, Arc<CollectorConfig>>,
}

impl CollectorCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a catalog from definitions, rejecting duplicate names.
    pub fn from_collectors(
        collectors: impl IntoIterator<Item = CollectorConfig>,
    ) -> Result<Self, ConfigError> {
        let mut catalog = Self::new();
        for collector in collectors {
            catalog.insert(collector)?;
        }
        Ok(catalog)
    }

    /// Add a definition. A name already present is an error.
    pub fn insert(&mut self, collector: CollectorConfig) -> Result<(), ConfigError> {
        if self.collectors.contains_key(&collector.name) {
            return Err(ConfigError::DuplicateCollector(collector.name));
        }
        self.collectors
            .insert(collector.name.clone(), Arc::new(collector));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<CollectorConfig>> {
        self.collectors.get(name)
    }

    pub fn len(&self) -> usize {
        self.collectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collectors.is_empty()
    }

    /// Collector names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.collectors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Expand collector references into definitions.
    ///
    /// Each reference is looked up by exact name first, then matched as a
    /// glob against every name. Output follows reference order; the matches
    /// of a single glob are sorted by name. Duplicates are kept. The first
    /// reference matching nothing aborts with an error naming `context`.
    pub fn resolve(
        &self,
        references: &[String],
        context: &str,
    ) -> Result<Vec<Arc<CollectorConfig>>, ConfigError> {
        let mut resolved = Vec::with_capacity(references.len());

        for reference in references {
            if let Some(collector) = self.collectors.get(reference) {
                resolved.push(Arc::clone(collector));
                continue;
            }

            let matched = self.glob(reference);
            if matched.is_empty() {
                return Err(ConfigError::UnknownCollector {
                    reference: reference.clone(),
                    context: context.to_string(),
                });
            }
            resolved.extend(matched);
        }

        Ok(resolved)
    }

    fn glob(&self, reference: &str) -> Vec<Arc<CollectorConfig>> {
        // An unparsable pattern cannot match anything.
        let Ok(pattern) = Pattern::new(reference) else {
            return Vec::new();
        };

        let mut matched: Vec<&Arc<CollectorConfig>> = self
            .collectors
            .iter()
            .filter(|(name, _)| pattern.matches_with(name, MATCH_OPTIONS))
            .map(|(_, collector)| collector)
            .collect();
        matched.sort_by(|a, b| a.name.cmp(&b.name));
        matched.into_iter().cloned().collect()
    }

    /// Merge the definitions found in `paths` into the catalog.
    ///
    /// Stops at the first unreadable or invalid file. Definitions merged
    /// from earlier files stay in the catalog.
    pub fn load_files(&mut self, paths: &[PathBuf]) -> Result<(), ConfigError> {
        for path in paths {
            let loaded = self
                .load_file(path)
                .map_err(|source| ConfigError::CollectorFile {
                    path: path.clone(),
                    source: Box::new(source),
                })?;
            debug!(path = %path.display(), collectors = loaded, "Loaded collector file");
        }
        Ok(())
    }

    fn load_file(&mut self, path: &Path) -> Result<usize, ConfigError> {
        // One definition or a list of them.
        let content = querysight_common::read_config(path)?;
        let collectors: Vec<CollectorConfig> = if is_array(&content) {
            json5::from_str(&content)?
        } else {
            vec![json5::from_str(&content)?]
        };

        let count = collectors.len();
        for collector in collectors {
            if collector.name.is_empty() {
                return Err(ConfigError::Validation(
                    "collector_name must not be empty".to_string(),
                ));
            }
            self.insert(collector)?;
        }
        Ok(count)
    }
}

/// Whether the first JSON5 token of `content` opens an array.
fn is_array(content: &str) -> bool {
    let mut rest = content.trim_start_matches('\u{feff}');
    loop {
        rest = rest.trim_start();
        if let Some(comment) = rest.strip_prefix("//") {
            rest = comment.split_once('\n').map_or("", |(_, tail)| tail);
        } else if let Some(comment) = rest.strip_prefix("/*") {
            rest = comment.split_once("*/").map_or("", |(_, tail)| tail);
        } else {
            return rest.starts_with('[');
        }
    }
}
