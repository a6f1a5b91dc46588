use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use super::counter::{count_patterns, SiteObservations};
use super::header::normalize_header_name;
use super::Analyzer;
use crate::dataset::{ClassificationMetadata, Dataset};
use crate::error::Result;
use crate::options::AnalysisOptions;
use crate::signatures::{SignatureTable, VendorCategory};
use crate::stats::{AnalysisResult, AnalyzerKind, AnalyzerSpecific};
use crate::validation::ValidatedPattern;

/// Headers scoring at least this much are recommended for classification.
pub const INCLUDE_THRESHOLD: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum HeaderCategory {
    Security,
    Caching,
    Analytics,
    Cms,
    Ecommerce,
    Framework,
    Infrastructure,
    Server,
    Custom,
}

impl HeaderCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            HeaderCategory::Security => "security",
            HeaderCategory::Caching => "caching",
            HeaderCategory::Analytics => "analytics",
            HeaderCategory::Cms => "cms",
            HeaderCategory::Ecommerce => "ecommerce",
            HeaderCategory::Framework => "framework",
            HeaderCategory::Infrastructure => "infrastructure",
            HeaderCategory::Server => "server",
            HeaderCategory::Custom => "custom",
        }
    }

    /// Parse a classification label; anything unrecognized is `Custom`.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "security" => HeaderCategory::Security,
            "caching" | "cache" => HeaderCategory::Caching,
            "analytics" | "tracking" => HeaderCategory::Analytics,
            "cms" => HeaderCategory::Cms,
            "ecommerce" | "e-commerce" => HeaderCategory::Ecommerce,
            "framework" => HeaderCategory::Framework,
            "infrastructure" | "cdn" => HeaderCategory::Infrastructure,
            "server" | "hosting" => HeaderCategory::Server,
            _ => HeaderCategory::Custom,
        }
    }

    fn from_vendor(category: VendorCategory) -> Self {
        match category {
            VendorCategory::Cdn => HeaderCategory::Infrastructure,
            VendorCategory::Cms => HeaderCategory::Cms,
            VendorCategory::Ecommerce => HeaderCategory::Ecommerce,
            VendorCategory::Analytics => HeaderCategory::Analytics,
            VendorCategory::Framework => HeaderCategory::Framework,
            VendorCategory::Security => HeaderCategory::Security,
            VendorCategory::Hosting => HeaderCategory::Server,
        }
    }

    /// Prior discriminative weight for the rule-based source.
    fn prior_score(self) -> f64 {
        match self {
            HeaderCategory::Cms | HeaderCategory::Ecommerce => 0.8,
            HeaderCategory::Framework => 0.6,
            HeaderCategory::Analytics => 0.5,
            HeaderCategory::Custom => 0.4,
            HeaderCategory::Security => 0.25,
            HeaderCategory::Caching => 0.2,
            HeaderCategory::Server => 0.1,
            HeaderCategory::Infrastructure => 0.0,
        }
    }

    fn excluded_from_recommendation(self) -> bool {
        matches!(self, HeaderCategory::Infrastructure | HeaderCategory::Server)
    }
}

const SECURITY_HEADERS: &[&str] = &[
    "content-security-policy",
    "content-security-policy-report-only",
    "permissions-policy",
    "referrer-policy",
    "strict-transport-security",
    "x-content-type-options",
    "x-frame-options",
    "x-permitted-cross-domain-policies",
    "x-xss-protection",
];
const CACHING_HEADERS: &[&str] = &[
    "age",
    "cache-control",
    "etag",
    "expires",
    "last-modified",
    "pragma",
    "surrogate-control",
    "vary",
];
const SERVER_HEADERS: &[&str] = &["server", "via", "x-served-by", "x-server", "x-backend-server"];
const FRAMEWORK_HEADERS: &[&str] = &["x-powered-by", "x-runtime", "x-framework", "x-version"];
const INFRASTRUCTURE_HEADERS: &[&str] = &[
    "accept-ranges",
    "alt-svc",
    "connection",
    "date",
    "keep-alive",
    "nel",
    "report-to",
    "set-cookie",
    "transfer-encoding",
    "x-request-id",
];

/// Name-based category rules used when neither validation output nor
/// classification metadata names a category.
pub fn categorize_header(name: &str, table: &SignatureTable) -> HeaderCategory {
    let name = normalize_header_name(name);
    if let Some(vendor) = table.vendor_for_header(&name) {
        return HeaderCategory::from_vendor(vendor.category);
    }

    let n = name.as_str();
    if SECURITY_HEADERS.contains(&n) || n.starts_with("cross-origin-") {
        HeaderCategory::Security
    } else if CACHING_HEADERS.contains(&n) || n.contains("cache") {
        HeaderCategory::Caching
    } else if SERVER_HEADERS.contains(&n) {
        HeaderCategory::Server
    } else if FRAMEWORK_HEADERS.contains(&n) || n.starts_with("x-aspnet") {
        HeaderCategory::Framework
    } else if ["wp", "drupal", "joomla", "generator", "pingback"]
        .iter()
        .any(|needle| n.contains(needle))
    {
        HeaderCategory::Cms
    } else if ["shop", "cart", "commerce", "magento"]
        .iter()
        .any(|needle| n.contains(needle))
    {
        HeaderCategory::Ecommerce
    } else if ["analytics", "tracking", "gtm", "pixel"]
        .iter()
        .any(|needle| n.contains(needle))
    {
        HeaderCategory::Analytics
    } else if INFRASTRUCTURE_HEADERS.contains(&n) || n.starts_with("content-") {
        HeaderCategory::Infrastructure
    } else {
        HeaderCategory::Custom
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SemanticSource {
    Validated,
    RawClassification,
    RuleBased,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterRecommendation {
    Include,
    Exclude,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeaderAnalysis {
    pub header: String,
    pub category: HeaderCategory,
    pub discriminative_score: f64,
    pub vendor: Option<String>,
    pub site_count: usize,
    pub recommendation: FilterRecommendation,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SemanticSpecific {
    pub source: SemanticSource,
    pub header_analyses: BTreeMap<String, HeaderAnalysis>,
    /// Headers per category.
    pub category_distribution: BTreeMap<HeaderCategory, usize>,
    /// Headers per attributed vendor.
    pub vendor_distribution: BTreeMap<String, usize>,
    pub recommended_headers: usize,
}

/// Categorizes headers, preferring validated patterns over the dataset's own
/// classification metadata.
#[derive(Debug, Clone)]
pub struct SemanticAnalyzer {
    table: Arc<SignatureTable>,
    validated: Option<Arc<BTreeMap<String, ValidatedPattern>>>,
}

impl Default for SemanticAnalyzer {
    fn default() -> Self {
        SemanticAnalyzer::new(SignatureTable::builtin())
    }
}

impl SemanticAnalyzer {
    pub fn new(table: Arc<SignatureTable>) -> Self {
        SemanticAnalyzer {
            table,
            validated: None,
        }
    }

    pub fn with_validated_patterns(
        mut self,
        validated: Arc<BTreeMap<String, ValidatedPattern>>,
    ) -> Self {
        self.validated = Some(validated);
        self
    }

    pub fn set_validated_patterns(&mut self, validated: Arc<BTreeMap<String, ValidatedPattern>>) {
        self.validated = Some(validated);
    }

    /// Validated patterns when there are any, else classification metadata
    /// when present, else the built-in rules.
    pub fn source_for(&self, dataset: &Dataset) -> SemanticSource {
        if self.validated.as_ref().is_some_and(|v| !v.is_empty()) {
            SemanticSource::Validated
        } else if dataset
            .classification
            .as_ref()
            .is_some_and(|meta| !meta.is_empty())
        {
            SemanticSource::RawClassification
        } else {
            SemanticSource::RuleBased
        }
    }

    fn analyze_header(
        &self,
        header: &str,
        site_count: usize,
        source: SemanticSource,
        metadata: Option<&ClassificationMetadata>,
    ) -> HeaderAnalysis {
        let table_vendor = || self.table.vendor_for_header(header).map(|v| v.name.clone());

        let (category, discriminative_score, vendor) = match source {
            SemanticSource::Validated => {
                let validated = self.validated.as_ref().and_then(|v| v.get(header));
                let category = categorize_header(header, &self.table);
                let score = validated.map(|v| v.cramers_v).unwrap_or(0.0);
                let vendor = validated
                    .and_then(|v| v.vendor.clone())
                    .or_else(table_vendor);
                (category, score, vendor)
            }
            SemanticSource::RawClassification => {
                let meta = metadata;
                let category = meta
                    .and_then(|m| m.header_categories.get(header))
                    .map(|label| HeaderCategory::from_label(label))
                    .unwrap_or_else(|| categorize_header(header, &self.table));
                let score = meta
                    .and_then(|m| m.discriminative_scores.get(header))
                    .copied()
                    .unwrap_or(0.0);
                let vendor = meta
                    .and_then(|m| m.header_vendors.get(header).cloned())
                    .or_else(table_vendor);
                (category, score, vendor)
            }
            SemanticSource::RuleBased => {
                let category = categorize_header(header, &self.table);
                (category, category.prior_score(), table_vendor())
            }
        };

        let discriminative_score = if discriminative_score.is_finite() {
            discriminative_score.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let recommendation = if discriminative_score >= INCLUDE_THRESHOLD
            && !category.excluded_from_recommendation()
        {
            FilterRecommendation::Include
        } else {
            FilterRecommendation::Exclude
        };

        HeaderAnalysis {
            header: header.to_string(),
            category,
            discriminative_score,
            vendor,
            site_count,
            recommendation,
        }
    }
}

impl Analyzer for SemanticAnalyzer {
    fn kind(&self) -> AnalyzerKind {
        AnalyzerKind::Semantic
    }

    fn analyze(&self, dataset: &Dataset, options: &AnalysisOptions) -> Result<AnalysisResult> {
        let start_time = Instant::now();
        let source = self.source_for(dataset);
        debug!(action = "start", component = "semantic_analyzer", source = ?source, "Categorizing headers");

        let mut header_sites: BTreeMap<String, BTreeSet<&str>> = BTreeMap::new();
        for (id, site) in &dataset.sites {
            for name in site.headers.keys() {
                let key = normalize_header_name(name);
                if !key.is_empty() {
                    header_sites.entry(key).or_default().insert(id.as_str());
                }
            }
        }

        let metadata = dataset.classification.as_ref();
        let header_analyses: BTreeMap<String, HeaderAnalysis> = header_sites
            .iter()
            .filter(|(_, sites)| options.passes_threshold(sites.len()))
            .map(|(header, sites)| {
                (
                    header.clone(),
                    self.analyze_header(header, sites.len(), source, metadata),
                )
            })
            .collect();

        let (patterns, total_found) = count_patterns(dataset, options, |_, site| {
            let mut observations = SiteObservations::new();
            for name in site.headers.keys() {
                let key = normalize_header_name(name);
                if let Some(analysis) = header_analyses.get(&key) {
                    observations.observe_with_example(analysis.category.as_str().to_string(), &key);
                }
            }
            observations
        });

        let mut category_distribution = BTreeMap::new();
        let mut vendor_distribution = BTreeMap::new();
        for analysis in header_analyses.values() {
            *category_distribution.entry(analysis.category).or_insert(0) += 1;
            if let Some(vendor) = &analysis.vendor {
                *vendor_distribution.entry(vendor.clone()).or_insert(0) += 1;
            }
        }
        let recommended_headers = header_analyses
            .values()
            .filter(|a| a.recommendation == FilterRecommendation::Include)
            .count();

        info!(
            action = "complete",
            component = "semantic_analyzer",
            source = ?source,
            headers = header_analyses.len(),
            recommended = recommended_headers,
            duration_ms = start_time.elapsed().as_millis(),
            "Semantic analysis completed"
        );

        Ok(AnalysisResult::new(
            patterns,
            total_found,
            dataset.total_sites(),
            options,
            AnalyzerSpecific::Semantic(SemanticSpecific {
                source,
                header_analyses,
                category_distribution,
                vendor_distribution,
                recommended_headers,
            }),
        ))
    }
}
