use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use super::stages::{default_stages, FinalScoring, ValidationContext, ValidationStage};
use super::{
    AdequacyTally, PowerAnalysis, SampleAdequacy, StageDiagnostics, StageResult,
    StatisticalMetrics, ValidatedPattern, ValidationConfig, ValidationSpecific, ValidationSummary,
    TOTAL_STAGES,
};
use crate::analyzers::Analyzer;
use crate::dataset::Dataset;
use crate::error::{AnalysisError, Result};
use crate::options::AnalysisOptions;
use crate::signatures::SignatureTable;
use crate::stats::{AnalysisResult, AnalyzerKind, AnalyzerSpecific, Pattern};

/// Runs the seven validation stages over the raw header patterns.
///
/// The header patterns are injected before `analyze`; running without them
/// is a [`AnalysisError::MissingDependency`].
pub struct ValidationPipeline {
    config: ValidationConfig,
    table: Arc<SignatureTable>,
    stages: Vec<Box<dyn ValidationStage>>,
    header_patterns: Option<Arc<BTreeMap<String, Pattern>>>,
}

impl Default for ValidationPipeline {
    fn default() -> Self {
        ValidationPipeline::new(SignatureTable::builtin())
    }
}

impl ValidationPipeline {
    pub fn new(table: Arc<SignatureTable>) -> Self {
        ValidationPipeline {
            config: ValidationConfig::default(),
            table,
            stages: default_stages(),
            header_patterns: None,
        }
    }

    pub fn with_config(mut self, config: ValidationConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_header_patterns(mut self, patterns: Arc<BTreeMap<String, Pattern>>) -> Self {
        self.header_patterns = Some(patterns);
        self
    }

    pub fn set_header_patterns(&mut self, patterns: Arc<BTreeMap<String, Pattern>>) {
        self.header_patterns = Some(patterns);
    }

    pub fn config(&self) -> &ValidationConfig {
        &self.config
    }

    fn run_stages(&self, ctx: &mut ValidationContext<'_>) {
        for stage in &self.stages {
            let name = stage.name();
            let stage_start = Instant::now();
            let result = if self.config.is_enabled(name) {
                stage.run(ctx)
            } else {
                StageResult::skipped(name)
            };
            debug!(
                action = "stage",
                component = "validation",
                stage = name.as_str(),
                passed = result.passed,
                skipped = result.skipped,
                duration_ms = stage_start.elapsed().as_millis(),
                "Validation stage finished"
            );
            ctx.results.push(result);
        }
    }
}

fn collect_specific(ctx: &ValidationContext<'_>) -> ValidationSpecific {
    let mut metrics = StatisticalMetrics {
        power_analysis: PowerAnalysis {
            sample_size: ctx.dataset.total_sites(),
            alpha: ctx.config.alpha,
            target_power: ctx.config.target_power,
            ..PowerAnalysis::default()
        },
        ..StatisticalMetrics::default()
    };
    let mut tally = AdequacyTally::default();
    let mut validated_patterns = BTreeMap::new();

    for (key, candidate) in &ctx.candidates {
        match candidate.adequacy {
            Some(SampleAdequacy::Adequate) => tally.adequate += 1,
            Some(SampleAdequacy::Marginal) => tally.marginal += 1,
            Some(SampleAdequacy::Inadequate) => tally.inadequate += 1,
            None => {}
        }
        if let Some(test) = candidate.test {
            metrics.chi_square_tests.insert(key.clone(), test);
        }
        if let Some(adjusted) = candidate.adjusted_p_value {
            metrics.adjusted_p_values.insert(key.clone(), adjusted);
        }
        if let Some(power) = candidate.power {
            metrics
                .power_analysis
                .per_pattern
                .insert(key.clone(), power);
        }

        if !FinalScoring::is_validated(ctx, candidate) {
            continue;
        }
        let cramers_v = match (candidate.power, candidate.test) {
            (Some(power), _) => power.effect_size,
            (None, Some(test)) => {
                super::statistics::cramers_v(test.statistic, ctx.dataset.total_sites() as f64)
            }
            (None, None) => 0.0,
        };
        let p_value = candidate.test.map(|test| test.p_value);
        validated_patterns.insert(
            key.clone(),
            ValidatedPattern {
                key: key.clone(),
                site_count: candidate.pattern.site_count,
                frequency: candidate.pattern.frequency,
                adequacy: candidate.effective_adequacy(&ctx.platform_totals, ctx.config),
                p_value,
                adjusted_p_value: candidate.adjusted_p_value.or(p_value),
                cramers_v,
                dominant_platform: candidate.dominant_platform.clone(),
                vendor: candidate.vendor.clone(),
            },
        );
    }
    metrics.sample_size_adequacy = tally;

    for result in &ctx.results {
        if let StageDiagnostics::Power {
            minimum_detectable_effect,
            mean_achieved_power,
            ..
        } = &result.diagnostics
        {
            metrics.power_analysis.minimum_detectable_effect = *minimum_detectable_effect;
            metrics.power_analysis.mean_achieved_power = *mean_achieved_power;
        }
    }

    let (quality_score, overall_passed) = ctx
        .results
        .last()
        .and_then(|final_stage| match &final_stage.diagnostics {
            StageDiagnostics::FinalScoring { quality_score, .. } => {
                Some((*quality_score, final_stage.passed))
            }
            _ => None,
        })
        .unwrap_or((0.0, false));

    ValidationSpecific {
        validation_summary: ValidationSummary {
            overall_passed,
            total_stages: ctx.results.len(),
            quality_score,
            candidate_count: ctx.candidates.len(),
            validated_count: validated_patterns.len(),
        },
        stage_results: ctx.results.clone(),
        statistical_metrics: metrics,
        validated_patterns,
    }
}

impl Analyzer for ValidationPipeline {
    fn kind(&self) -> AnalyzerKind {
        AnalyzerKind::Validation
    }

    fn analyze(&self, dataset: &Dataset, options: &AnalysisOptions) -> Result<AnalysisResult> {
        let header_patterns =
            self.header_patterns
                .as_ref()
                .ok_or(AnalysisError::MissingDependency {
                    analyzer: "validation",
                    dependency: "header patterns",
                })?;
        self.config.validate()?;

        let start_time = Instant::now();
        debug!(action = "start", component = "validation", candidates = header_patterns.len(), "Running validation pipeline");

        let mut ctx = ValidationContext::new(
            dataset,
            options,
            &self.config,
            &self.table,
            header_patterns,
        );
        self.run_stages(&mut ctx);
        debug_assert_eq!(ctx.results.len(), TOTAL_STAGES);

        let specific = collect_specific(&ctx);
        let patterns: BTreeMap<String, Pattern> = specific
            .validated_patterns
            .keys()
            .filter_map(|key| {
                ctx.candidates
                    .get(key)
                    .map(|candidate| (key.clone(), candidate.pattern.clone()))
            })
            .collect();

        info!(
            action = "complete",
            component = "validation",
            candidates = specific.validation_summary.candidate_count,
            validated = specific.validation_summary.validated_count,
            overall_passed = specific.validation_summary.overall_passed,
            quality_score = specific.validation_summary.quality_score,
            duration_ms = start_time.elapsed().as_millis(),
            "Validation pipeline completed"
        );

        Ok(AnalysisResult::new(
            patterns,
            specific.validation_summary.candidate_count,
            dataset.total_sites(),
            options,
            AnalyzerSpecific::Validation(Box::new(specific)),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzers::HeaderAnalyzer;
    use crate::dataset::Site;
    use crate::validation::StageName;

    /// 40 WordPress and 40 Drupal sites. `x-pingback` only on WordPress,
    /// `server` everywhere, `x-rare` on a single site.
    fn two_platform_dataset() -> Dataset {
        let mut sites = Vec::new();
        for i in 0..40 {
            let mut site = Site::new(format!("wp{i}.com"))
                .with_cms("WordPress")
                .with_header("server", "nginx")
                .with_header("x-pingback", "/xmlrpc.php");
            if i == 0 {
                site = site.with_header("x-rare", "1");
            }
            sites.push(site);
            sites.push(
                Site::new(format!("dr{i}.com"))
                    .with_cms("Drupal")
                    .with_header("server", "nginx")
                    .with_header("x-generator", "Drupal 10"),
            );
        }
        Dataset::from_sites(sites)
    }

    fn run(dataset: &Dataset, config: ValidationConfig) -> (AnalysisResult, ValidationSpecific) {
        let options = AnalysisOptions::default();
        let headers = HeaderAnalyzer::new().analyze(dataset, &options).unwrap();
        let pipeline = ValidationPipeline::new(SignatureTable::builtin())
            .with_config(config)
            .with_header_patterns(Arc::new(headers.patterns));
        let result = pipeline.analyze(dataset, &options).unwrap();
        let specific = match &result.analyzer_specific {
            AnalyzerSpecific::Validation(specific) => (**specific).clone(),
            other => panic!("unexpected payload {other:?}"),
        };
        (result, specific)
    }

    #[test]
    fn missing_header_patterns_is_an_error() {
        let err = ValidationPipeline::default()
            .analyze(&Dataset::new(), &AnalysisOptions::default())
            .unwrap_err();
        assert!(matches!(
            err,
            AnalysisError::MissingDependency {
                analyzer: "validation",
                ..
            }
        ));
    }

    #[test]
    fn discriminative_headers_are_validated() {
        let (result, specific) = run(&two_platform_dataset(), ValidationConfig::default());

        assert_eq!(specific.stage_results.len(), TOTAL_STAGES);
        assert_eq!(specific.validation_summary.total_stages, TOTAL_STAGES);
        assert!(specific.validated_patterns.contains_key("x-pingback"));
        assert!(specific.validated_patterns.contains_key("x-generator"));
        assert_eq!(
            specific.validated_patterns["x-pingback"].dominant_platform.as_deref(),
            Some("WordPress")
        );
        // Present everywhere: no test possible.
        assert!(!specific.validated_patterns.contains_key("server"));
        // One site of eighty.
        assert!(!specific.validated_patterns.contains_key("x-rare"));

        assert_eq!(result.patterns.len(), specific.validated_patterns.len());
        assert_eq!(result.total_sites, 80);
        assert!(specific.validation_summary.quality_score > 0.0);
        assert!(specific.validation_summary.quality_score <= 1.0);
    }

    #[test]
    fn disabled_stage_still_reports() {
        let config = ValidationConfig::default().with_stage(StageName::PowerAnalysis, false);
        let (_, specific) = run(&two_platform_dataset(), config);

        assert_eq!(specific.stage_results.len(), TOTAL_STAGES);
        let power = &specific.stage_results[4];
        assert_eq!(power.name, StageName::PowerAnalysis);
        assert!(power.skipped);
        assert!(power.passed);
        assert!(specific.statistical_metrics.power_analysis.per_pattern.is_empty());
        assert!(specific.validated_patterns.contains_key("x-pingback"));
    }

    #[test]
    fn empty_dataset_yields_empty_validation() {
        let (result, specific) = run(&Dataset::new(), ValidationConfig::default());
        assert!(result.patterns.is_empty());
        assert_eq!(specific.stage_results.len(), TOTAL_STAGES);
        assert!(!specific.validation_summary.overall_passed);
        assert_eq!(specific.validation_summary.validated_count, 0);
        assert_eq!(specific.validation_summary.quality_score, 0.0);
    }

    fn final_stage_validated(specific: &ValidationSpecific) -> usize {
        match &specific.stage_results[TOTAL_STAGES - 1].diagnostics {
            StageDiagnostics::FinalScoring { validated, .. } => *validated,
            other => panic!("unexpected diagnostics {other:?}"),
        }
    }

    #[test]
    fn sample_gate_holds_without_adequacy_stage() {
        let mut sites = vec![Site::new("wp.com")
            .with_cms("WordPress")
            .with_header("server", "nginx")
            .with_header("x-rare", "1")];
        for i in 0..99 {
            sites.push(
                Site::new(format!("dr{i}.com"))
                    .with_cms("Drupal")
                    .with_header("server", "nginx"),
            );
        }
        let config = ValidationConfig::default().with_stage(StageName::SampleSizeAdequacy, false);
        let (result, specific) = run(&Dataset::from_sites(sites), config);

        assert!(specific.stage_results[1].skipped);
        assert!(!specific.validated_patterns.contains_key("x-rare"));
        assert!(!specific.validated_patterns.contains_key("server"));
        assert!(result.patterns.is_empty());
        assert_eq!(final_stage_validated(&specific), 0);
        assert!(!specific.validation_summary.overall_passed);
    }

    #[test]
    fn validated_set_matches_final_stage_without_chi_square() {
        let config =
            ValidationConfig::default().with_stage(StageName::ChiSquareIndependence, false);
        let (_, specific) = run(&two_platform_dataset(), config);

        assert!(specific.stage_results[2].skipped);
        assert_eq!(final_stage_validated(&specific), specific.validated_patterns.len());
        assert_eq!(
            specific.validation_summary.validated_count,
            specific.validated_patterns.len()
        );
        let pingback = &specific.validated_patterns["x-pingback"];
        assert_eq!(pingback.p_value, None);
        assert_eq!(pingback.adjusted_p_value, None);
        assert_eq!(pingback.adequacy, SampleAdequacy::Adequate);
        assert!(!specific.validated_patterns.contains_key("x-rare"));
        assert!(!specific.validated_patterns.contains_key("server"));
    }

    #[test]
    fn validated_count_matches_final_stage() {
        let (_, specific) = run(&two_platform_dataset(), ValidationConfig::default());
        assert_eq!(final_stage_validated(&specific), specific.validated_patterns.len());
        assert!(specific.validated_patterns["x-pingback"].p_value.is_some());
    }
}
