//! The preprocessed, deduplicated dataset every analyzer reads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::error::Result;

/// One normalized website snapshot.
///
/// Every collection defaults to empty, so a record missing a feature map
/// simply contributes no patterns for that category.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Site {
    pub url: String,
    pub headers: BTreeMap<String, BTreeSet<String>>,
    pub meta_tags: BTreeMap<String, BTreeSet<String>>,
    pub scripts: BTreeSet<String>,
    pub technologies: BTreeSet<String>,
    pub cms: Option<String>,
    pub cms_confidence: Option<f64>,
    pub captured_at: Option<DateTime<Utc>>,
}

impl Site {
    pub fn new(url: impl Into<String>) -> Self {
        Site {
            url: url.into(),
            ..Site::default()
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers
            .entry(name.to_string())
            .or_default()
            .insert(value.to_string());
        self
    }

    pub fn with_meta(mut self, name: &str, content: &str) -> Self {
        self.meta_tags
            .entry(name.to_string())
            .or_default()
            .insert(content.to_string());
        self
    }

    pub fn with_script(mut self, src: &str) -> Self {
        self.scripts.insert(src.to_string());
        self
    }

    pub fn with_technology(mut self, name: &str) -> Self {
        self.technologies.insert(name.to_string());
        self
    }

    pub fn with_cms(mut self, cms: &str) -> Self {
        self.cms = Some(cms.to_string());
        self
    }

    /// The platform label used for contingency tables. Blank labels count as
    /// unknown.
    pub fn platform(&self) -> Option<&str> {
        self.cms
            .as_deref()
            .map(str::trim)
            .filter(|label| !label.is_empty() && !label.eq_ignore_ascii_case("unknown"))
    }
}

/// Optional per-header classification produced by the preprocessing step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClassificationMetadata {
    pub header_categories: BTreeMap<String, String>,
    pub discriminative_scores: BTreeMap<String, f64>,
    pub header_vendors: BTreeMap<String, String>,
}

impl ClassificationMetadata {
    pub fn is_empty(&self) -> bool {
        self.header_categories.is_empty()
            && self.discriminative_scores.is_empty()
            && self.header_vendors.is_empty()
    }
}

/// Site id to site, iterated in key order. That order is the "dataset order"
/// example sampling relies on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Dataset {
    pub sites: BTreeMap<String, Site>,
    pub classification: Option<ClassificationMetadata>,
}

impl Dataset {
    pub fn new() -> Self {
        Dataset::default()
    }

    /// Build a dataset keyed by each site's url.
    pub fn from_sites(sites: impl IntoIterator<Item = Site>) -> Self {
        Dataset {
            sites: sites
                .into_iter()
                .map(|site| (site.url.clone(), site))
                .collect(),
            classification: None,
        }
    }

    pub fn with_classification(mut self, classification: ClassificationMetadata) -> Self {
        self.classification = Some(classification);
        self
    }

    pub fn total_sites(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    /// Sites in dataset order, collected so rayon can index into them.
    pub fn ordered_sites(&self) -> Vec<(&str, &Site)> {
        self.sites
            .iter()
            .map(|(id, site)| (id.as_str(), site))
            .collect()
    }

    /// Distinct known platform labels, sorted.
    pub fn platforms(&self) -> BTreeSet<String> {
        self.sites
            .values()
            .filter_map(|site| site.platform().map(str::to_string))
            .collect()
    }
}

/// Where the orchestrator gets its dataset from.
pub trait DatasetSource: Send + Sync {
    fn load(&self) -> Result<Arc<Dataset>>;
}

/// A dataset that is already materialized in memory.
#[derive(Debug, Clone)]
pub struct InMemorySource {
    dataset: Arc<Dataset>,
}

impl InMemorySource {
    pub fn new(dataset: Dataset) -> Self {
        InMemorySource {
            dataset: Arc::new(dataset),
        }
    }
}

impl DatasetSource for InMemorySource {
    fn load(&self) -> Result<Arc<Dataset>> {
        Ok(Arc::clone(&self.dataset))
    }
}
