//! Runs every analyzer over one dataset in dependency order and assembles
//! the aggregated result.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use crate::analyzers::{
    Analyzer, CooccurrenceAnalyzer, HeaderAnalyzer, MetaTagAnalyzer, ScriptAnalyzer,
    SemanticAnalyzer, TechnologyAnalyzer, VendorAnalyzer,
};
use crate::dataset::{Dataset, DatasetSource};
use crate::discrimination;
use crate::error::{AnalysisError, Result};
use crate::options::AnalysisOptions;
use crate::signatures::SignatureTable;
use crate::stats::{AggregatedResults, AnalysisResult, AnalyzerSpecific, Summary};
use crate::validation::{ValidationConfig, ValidationPipeline};

pub const DEFAULT_TOP_PATTERNS: usize = 20;

const FREQUENCY_TOLERANCE: f64 = 1e-9;

pub struct Aggregator {
    source: Box<dyn DatasetSource>,
    table: Arc<SignatureTable>,
    validation: ValidationConfig,
    top_patterns: usize,
}

impl Aggregator {
    pub fn new(source: impl DatasetSource + 'static) -> Self {
        Aggregator {
            source: Box::new(source),
            table: SignatureTable::builtin(),
            validation: ValidationConfig::default(),
            top_patterns: DEFAULT_TOP_PATTERNS,
        }
    }

    pub fn with_signature_table(mut self, table: Arc<SignatureTable>) -> Self {
        self.table = table;
        self
    }

    pub fn with_validation_config(mut self, config: ValidationConfig) -> Self {
        self.validation = config;
        self
    }

    pub fn with_top_patterns(mut self, top_patterns: usize) -> Self {
        self.top_patterns = top_patterns;
        self
    }

    /// Load the dataset once and run the full analysis over it.
    pub fn analyze(&self, options: &AnalysisOptions) -> Result<AggregatedResults> {
        options.validate()?;
        let dataset = self.source.load()?;
        self.analyze_dataset(&dataset, options)
    }

    pub fn analyze_dataset(
        &self,
        dataset: &Dataset,
        options: &AnalysisOptions,
    ) -> Result<AggregatedResults> {
        options.validate()?;
        let start_time = Instant::now();
        info!(
            action = "start",
            component = "aggregator",
            site_count = dataset.total_sites(),
            min_occurrences = options.min_occurrences,
            "Starting frequency analysis"
        );

        let vendor_analyzer = VendorAnalyzer::new(Arc::clone(&self.table));
        let ((headers, meta_tags), (scripts, (technologies, vendor))) = rayon::join(
            || {
                rayon::join(
                    || run(&HeaderAnalyzer::new(), dataset, options),
                    || run(&MetaTagAnalyzer::new(), dataset, options),
                )
            },
            || {
                rayon::join(
                    || run(&ScriptAnalyzer::new(), dataset, options),
                    || {
                        rayon::join(
                            || run(&TechnologyAnalyzer::new(), dataset, options),
                            || run(&vendor_analyzer, dataset, options),
                        )
                    },
                )
            },
        );
        let (headers, meta_tags, scripts, technologies, vendor) =
            (headers?, meta_tags?, scripts?, technologies?, vendor?);
        debug!(action = "join", component = "aggregator", elapsed_ms = start_time.elapsed().as_millis(), "Independent analyzers finished");

        let validation_pipeline = ValidationPipeline::new(Arc::clone(&self.table))
            .with_config(self.validation.clone())
            .with_header_patterns(Arc::new(headers.patterns.clone()));
        let validation = run(&validation_pipeline, dataset, options)?;

        let validated = match &validation.analyzer_specific {
            AnalyzerSpecific::Validation(specific) => Arc::new(specific.validated_patterns.clone()),
            other => return Err(unexpected_payload("validation", other)),
        };
        let semantic_analyzer =
            SemanticAnalyzer::new(Arc::clone(&self.table)).with_validated_patterns(validated);
        let semantic = run(&semantic_analyzer, dataset, options)?;

        let vendor_data = match &vendor.analyzer_specific {
            AnalyzerSpecific::Vendor(specific) => Arc::new((**specific).clone()),
            other => return Err(unexpected_payload("vendor", other)),
        };
        let cooccurrence = run(
            &CooccurrenceAnalyzer::with_vendor_data(vendor_data),
            dataset,
            options,
        )?;

        let results = [
            &headers,
            &meta_tags,
            &scripts,
            &technologies,
            &vendor,
            &validation,
            &semantic,
            &cooccurrence,
        ];
        check_consistency(dataset, options, &results)?;

        let platform_discrimination = options
            .focus_platform_discrimination
            .then(|| discrimination::summarize(dataset, &[&headers, &meta_tags, &scripts]));
        let summary = Summary {
            total_sites_analyzed: dataset.total_sites(),
            total_patterns_found: results.iter().map(|r| r.patterns.len()).sum(),
            top_patterns: results
                .iter()
                .map(|r| (r.metadata.analyzer, r.top_patterns(self.top_patterns)))
                .collect::<BTreeMap<_, _>>(),
            platform_discrimination,
        };

        info!(
            action = "complete",
            component = "aggregator",
            site_count = summary.total_sites_analyzed,
            patterns_found = summary.total_patterns_found,
            duration_ms = start_time.elapsed().as_millis(),
            "Frequency analysis completed"
        );

        Ok(AggregatedResults {
            headers,
            meta_tags,
            scripts,
            technologies,
            vendor,
            validation,
            semantic,
            cooccurrence,
            summary,
        })
    }
}

fn run<A: Analyzer>(
    analyzer: &A,
    dataset: &Dataset,
    options: &AnalysisOptions,
) -> Result<AnalysisResult> {
    let kind = analyzer.kind();
    analyzer
        .analyze(dataset, options)
        .map_err(|e| AnalysisError::in_analyzer(kind.as_str(), e))
}

fn unexpected_payload(analyzer: &str, payload: &AnalyzerSpecific) -> AnalysisError {
    AnalysisError::ConsistencyViolation {
        reason: format!(
            "{} analyzer returned a {} payload",
            analyzer,
            payload.kind().as_str()
        ),
    }
}

/// Every result must agree on the site total and echo the same options, and
/// every pattern must satisfy the frequency invariants.
pub fn check_consistency(
    dataset: &Dataset,
    options: &AnalysisOptions,
    results: &[&AnalysisResult],
) -> Result<()> {
    let total_sites = dataset.total_sites();
    for result in results {
        let analyzer = result.metadata.analyzer.as_str();
        if result.total_sites != total_sites {
            return Err(AnalysisError::ConsistencyViolation {
                reason: format!(
                    "{} reported {} sites, dataset has {}",
                    analyzer, result.total_sites, total_sites
                ),
            });
        }
        if result.metadata.options != *options {
            return Err(AnalysisError::ConsistencyViolation {
                reason: format!("{} echoed different options", analyzer),
            });
        }
        for pattern in result.patterns.values() {
            let expected = crate::stats::frequency(pattern.site_count, total_sites);
            if pattern.site_count != pattern.sites.len()
                || !pattern.frequency.is_finite()
                || (pattern.frequency - expected).abs() > FREQUENCY_TOLERANCE
            {
                return Err(AnalysisError::ConsistencyViolation {
                    reason: format!("{} pattern {:?} has inconsistent counts", analyzer, pattern.key),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{InMemorySource, Site};
    use crate::stats::AnalyzerKind;

    struct FailingSource;

    impl DatasetSource for FailingSource {
        fn load(&self) -> Result<Arc<Dataset>> {
            Err(AnalysisError::SnapshotNotFound("missing.db".into()))
        }
    }

    #[test]
    fn invalid_options_rejected_before_load() {
        let options = AnalysisOptions {
            min_occurrences: 0,
            ..AnalysisOptions::default()
        };
        let err = Aggregator::new(FailingSource).analyze(&options).unwrap_err();
        assert!(matches!(err, AnalysisError::InvalidOptions { .. }));
    }

    #[test]
    fn load_failure_propagates() {
        let err = Aggregator::new(FailingSource)
            .analyze(&AnalysisOptions::default())
            .unwrap_err();
        assert!(matches!(err, AnalysisError::SnapshotNotFound(_)));
    }

    #[test]
    fn every_result_shares_totals_and_options() {
        let dataset = Dataset::from_sites([
            Site::new("a.com").with_cms("WordPress").with_header("server", "nginx"),
            Site::new("b.com").with_cms("Drupal").with_header("server", "apache"),
        ]);
        let options = AnalysisOptions {
            max_examples: 1,
            ..AnalysisOptions::default()
        };
        let results = Aggregator::new(InMemorySource::new(dataset))
            .analyze(&options)
            .unwrap();
        for result in results.results() {
            assert_eq!(result.total_sites, 2);
            assert_eq!(result.metadata.options, options);
        }
        assert_eq!(results.summary.top_patterns.len(), 8);
        assert_eq!(results.summary.top_patterns[&AnalyzerKind::Headers][0].key, "server");
        assert!(results.summary.platform_discrimination.is_none());
    }

    #[test]
    fn consistency_check_catches_mismatched_totals() {
        let dataset = Dataset::from_sites([Site::new("a.com").with_header("server", "x")]);
        let options = AnalysisOptions::default();
        let mut result = HeaderAnalyzer::new().analyze(&dataset, &options).unwrap();
        result.total_sites = 5;
        let err = check_consistency(&dataset, &options, &[&result]).unwrap_err();
        assert!(matches!(err, AnalysisError::ConsistencyViolation { .. }));
    }

    #[test]
    fn consistency_check_catches_changed_options() {
        let dataset = Dataset::new();
        let options = AnalysisOptions::default();
        let mut result = HeaderAnalyzer::new().analyze(&dataset, &options).unwrap();
        result.metadata.options.max_examples = 99;
        assert!(check_consistency(&dataset, &options, &[&result]).is_err());
    }
}
