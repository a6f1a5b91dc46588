use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use crate::analyzers::cooccurrence::CooccurrenceSpecific;
use crate::analyzers::header::HeaderSpecific;
use crate::analyzers::meta::MetaSpecific;
use crate::analyzers::script::ScriptSpecific;
use crate::analyzers::semantic::SemanticSpecific;
use crate::analyzers::technology::TechnologySpecific;
use crate::analyzers::vendor::VendorSpecific;
use crate::discrimination::PlatformDiscriminationSummary;
use crate::options::AnalysisOptions;
use crate::validation::ValidationSpecific;

/// `site_count / total_sites`, 0 for an empty dataset, clamped to [0, 1].
pub fn frequency(site_count: usize, total_sites: usize) -> f64 {
    if total_sites == 0 {
        return 0.0;
    }
    let value = site_count as f64 / total_sites as f64;
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Pattern {
    pub key: String,
    pub site_count: usize,
    pub sites: BTreeSet<String>,
    pub frequency: f64,
    pub examples: Vec<String>,
}

impl Pattern {
    pub fn new(
        key: String,
        sites: BTreeSet<String>,
        examples: Vec<String>,
        total_sites: usize,
    ) -> Self {
        let site_count = sites.len();
        Pattern {
            key,
            site_count,
            sites,
            frequency: frequency(site_count, total_sites),
            examples,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AnalyzerKind {
    Headers,
    MetaTags,
    Scripts,
    Technologies,
    Vendor,
    Validation,
    Semantic,
    Cooccurrence,
}

impl AnalyzerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AnalyzerKind::Headers => "headers",
            AnalyzerKind::MetaTags => "metaTags",
            AnalyzerKind::Scripts => "scripts",
            AnalyzerKind::Technologies => "technologies",
            AnalyzerKind::Vendor => "vendor",
            AnalyzerKind::Validation => "validation",
            AnalyzerKind::Semantic => "semantic",
            AnalyzerKind::Cooccurrence => "cooccurrence",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisMetadata {
    pub analyzer: AnalyzerKind,
    pub analyzed_at: DateTime<Utc>,
    pub total_patterns_found: usize,
    pub total_patterns_after_filtering: usize,
    pub options: AnalysisOptions,
}

/// Analyzer-particular data, one shape per analyzer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "analyzer", content = "data", rename_all = "camelCase")]
pub enum AnalyzerSpecific {
    Headers(HeaderSpecific),
    MetaTags(MetaSpecific),
    Scripts(ScriptSpecific),
    Technologies(TechnologySpecific),
    Vendor(Box<VendorSpecific>),
    Validation(Box<ValidationSpecific>),
    Semantic(SemanticSpecific),
    Cooccurrence(CooccurrenceSpecific),
}

impl AnalyzerSpecific {
    pub fn kind(&self) -> AnalyzerKind {
        match self {
            AnalyzerSpecific::Headers(_) => AnalyzerKind::Headers,
            AnalyzerSpecific::MetaTags(_) => AnalyzerKind::MetaTags,
            AnalyzerSpecific::Scripts(_) => AnalyzerKind::Scripts,
            AnalyzerSpecific::Technologies(_) => AnalyzerKind::Technologies,
            AnalyzerSpecific::Vendor(_) => AnalyzerKind::Vendor,
            AnalyzerSpecific::Validation(_) => AnalyzerKind::Validation,
            AnalyzerSpecific::Semantic(_) => AnalyzerKind::Semantic,
            AnalyzerSpecific::Cooccurrence(_) => AnalyzerKind::Cooccurrence,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub patterns: BTreeMap<String, Pattern>,
    pub total_sites: usize,
    pub metadata: AnalysisMetadata,
    pub analyzer_specific: AnalyzerSpecific,
}

impl AnalysisResult {
    pub fn new(
        patterns: BTreeMap<String, Pattern>,
        total_patterns_found: usize,
        total_sites: usize,
        options: &AnalysisOptions,
        analyzer_specific: AnalyzerSpecific,
    ) -> Self {
        let metadata = AnalysisMetadata {
            analyzer: analyzer_specific.kind(),
            analyzed_at: Utc::now(),
            total_patterns_found,
            total_patterns_after_filtering: patterns.len(),
            options: options.clone(),
        };
        AnalysisResult {
            patterns,
            total_sites,
            metadata,
            analyzer_specific,
        }
    }

    /// Highest site counts first; ties broken by key so output is stable.
    pub fn top_patterns(&self, limit: usize) -> Vec<TopPattern> {
        let mut sorted: Vec<&Pattern> = self.patterns.values().collect();
        sorted.sort_by(|a, b| b.site_count.cmp(&a.site_count).then_with(|| a.key.cmp(&b.key)));
        sorted
            .into_iter()
            .take(limit)
            .map(|p| TopPattern {
                key: p.key.clone(),
                site_count: p.site_count,
                frequency: p.frequency,
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopPattern {
    pub key: String,
    pub site_count: usize,
    pub frequency: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub total_sites_analyzed: usize,
    pub total_patterns_found: usize,
    pub top_patterns: BTreeMap<AnalyzerKind, Vec<TopPattern>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform_discrimination: Option<PlatformDiscriminationSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedResults {
    pub headers: AnalysisResult,
    pub meta_tags: AnalysisResult,
    pub scripts: AnalysisResult,
    pub technologies: AnalysisResult,
    pub vendor: AnalysisResult,
    pub validation: AnalysisResult,
    pub semantic: AnalysisResult,
    pub cooccurrence: AnalysisResult,
    pub summary: Summary,
}

impl AggregatedResults {
    /// Every per-analyzer result, in execution order.
    pub fn results(&self) -> [&AnalysisResult; 8] {
        [
            &self.headers,
            &self.meta_tags,
            &self.scripts,
            &self.technologies,
            &self.vendor,
            &self.validation,
            &self.semantic,
            &self.cooccurrence,
        ]
    }
}
