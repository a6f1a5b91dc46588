use std::collections::BTreeMap;
use tracing::{debug, warn};

use super::statistics::{
    adjust_p_values, chi_square_test, cramers_v, estimate_power, minimum_detectable_effect,
    ChiSquareTest, ContingencyTable, PowerEstimate,
};
use super::{
    SampleAdequacy, StageDiagnostics, StageName, StageResult, ValidationConfig, UNKNOWN_PLATFORM,
};
use crate::dataset::Dataset;
use crate::options::AnalysisOptions;
use crate::signatures::SignatureTable;
use crate::stats::Pattern;

/// Vendors whose sites legitimately report a different platform label.
const PLATFORM_FAMILIES: &[(&str, &str)] = &[
    ("woocommerce", "wordpress"),
    ("drupal commerce", "drupal"),
    ("virtuemart", "joomla"),
];

/// A header pattern moving through the pipeline.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub pattern: Pattern,
    /// Sites having the pattern, per platform column.
    pub present: Vec<usize>,
    pub adequacy: Option<SampleAdequacy>,
    pub min_expected: Option<f64>,
    pub test: Option<ChiSquareTest>,
    pub adjusted_p_value: Option<f64>,
    pub significant: bool,
    pub power: Option<PowerEstimate>,
    pub dominant_platform: Option<String>,
    pub vendor: Option<String>,
    pub contradicted: bool,
}

impl Candidate {
    fn table(&self, totals: &[usize]) -> ContingencyTable {
        ContingencyTable::from_counts(&self.present, totals)
    }

    /// Smallest expected cell and the adequacy class it implies.
    pub fn assess_adequacy(
        &self,
        totals: &[usize],
        config: &ValidationConfig,
    ) -> (Option<f64>, SampleAdequacy) {
        let min_expected = self.table(totals).min_expected();
        let adequacy = match min_expected {
            Some(min) if min >= config.min_expected_cell => SampleAdequacy::Adequate,
            Some(min) if min >= config.marginal_expected_cell => SampleAdequacy::Marginal,
            _ => SampleAdequacy::Inadequate,
        };
        (min_expected, adequacy)
    }

    /// The adequacy stage's verdict, or a fresh assessment when it was
    /// skipped.
    pub fn effective_adequacy(&self, totals: &[usize], config: &ValidationConfig) -> SampleAdequacy {
        self.adequacy
            .unwrap_or_else(|| self.assess_adequacy(totals, config).1)
    }

    /// Sample-size gate. Applies even when the adequacy stage is disabled.
    pub fn passes_sample_gate(&self, totals: &[usize], config: &ValidationConfig) -> bool {
        match self.effective_adequacy(totals, config) {
            SampleAdequacy::Adequate => true,
            SampleAdequacy::Marginal => config.accept_marginal,
            SampleAdequacy::Inadequate => false,
        }
    }
}

/// Shared state every stage reads from and writes to.
pub struct ValidationContext<'a> {
    pub dataset: &'a Dataset,
    pub options: &'a AnalysisOptions,
    pub config: &'a ValidationConfig,
    pub table: &'a SignatureTable,
    pub header_patterns: &'a BTreeMap<String, Pattern>,
    /// Platform column labels, sorted, `Unknown` included when present.
    pub platforms: Vec<String>,
    pub platform_totals: Vec<usize>,
    site_columns: BTreeMap<&'a str, usize>,
    pub candidates: BTreeMap<String, Candidate>,
    pub below_threshold: usize,
    pub results: Vec<StageResult>,
}

impl<'a> ValidationContext<'a> {
    pub fn new(
        dataset: &'a Dataset,
        options: &'a AnalysisOptions,
        config: &'a ValidationConfig,
        table: &'a SignatureTable,
        header_patterns: &'a BTreeMap<String, Pattern>,
    ) -> Self {
        let mut columns: BTreeMap<&str, usize> = BTreeMap::new();
        for site in dataset.sites.values() {
            *columns
                .entry(site.platform().unwrap_or(UNKNOWN_PLATFORM))
                .or_default() += 1;
        }
        let platforms: Vec<String> = columns.keys().map(|label| label.to_string()).collect();
        let platform_totals: Vec<usize> = columns.values().copied().collect();

        let site_columns = dataset
            .sites
            .iter()
            .filter_map(|(id, site)| {
                let label = site.platform().unwrap_or(UNKNOWN_PLATFORM);
                platforms
                    .iter()
                    .position(|p| p == label)
                    .map(|column| (id.as_str(), column))
            })
            .collect();

        ValidationContext {
            dataset,
            options,
            config,
            table,
            header_patterns,
            platforms,
            platform_totals,
            site_columns,
            candidates: BTreeMap::new(),
            below_threshold: 0,
            results: Vec::new(),
        }
    }

    fn present_counts(&self, pattern: &Pattern) -> Vec<usize> {
        let mut present = vec![0; self.platforms.len()];
        for site in &pattern.sites {
            if let Some(&column) = self.site_columns.get(site.as_str()) {
                present[column] += 1;
            }
        }
        present
    }

    pub fn stage_ran(&self, name: StageName) -> bool {
        self.results.iter().any(|r| r.name == name && !r.skipped)
    }
}

pub trait ValidationStage: Send + Sync {
    fn name(&self) -> StageName;
    fn run(&self, ctx: &mut ValidationContext<'_>) -> StageResult;
}

/// Stage 1: raw header patterns that meet `min_occurrences`.
pub struct PatternCollection;

impl ValidationStage for PatternCollection {
    fn name(&self) -> StageName {
        StageName::PatternCollection
    }

    fn run(&self, ctx: &mut ValidationContext<'_>) -> StageResult {
        let mut below_threshold = 0;
        for (key, pattern) in ctx.header_patterns {
            if !ctx.options.passes_threshold(pattern.site_count) {
                below_threshold += 1;
                continue;
            }
            let present = ctx.present_counts(pattern);
            ctx.candidates.insert(
                key.clone(),
                Candidate {
                    pattern: pattern.clone(),
                    present,
                    adequacy: None,
                    min_expected: None,
                    test: None,
                    adjusted_p_value: None,
                    significant: false,
                    power: None,
                    dominant_platform: None,
                    vendor: None,
                    contradicted: false,
                },
            );
        }
        ctx.below_threshold = below_threshold;

        StageResult::new(
            self.name(),
            !ctx.candidates.is_empty(),
            StageDiagnostics::PatternCollection {
                raw_patterns: ctx.header_patterns.len(),
                candidates: ctx.candidates.len(),
                below_threshold,
            },
        )
    }
}

/// Stage 2: classify each candidate by its smallest expected cell count.
pub struct SampleSizeAdequacy;

impl ValidationStage for SampleSizeAdequacy {
    fn name(&self) -> StageName {
        StageName::SampleSizeAdequacy
    }

    fn run(&self, ctx: &mut ValidationContext<'_>) -> StageResult {
        let (mut adequate, mut marginal, mut inadequate) = (0, 0, 0);
        let totals = ctx.platform_totals.clone();
        let config = ctx.config;

        for candidate in ctx.candidates.values_mut() {
            let (min_expected, adequacy) = candidate.assess_adequacy(&totals, config);
            match adequacy {
                SampleAdequacy::Adequate => adequate += 1,
                SampleAdequacy::Marginal => marginal += 1,
                SampleAdequacy::Inadequate => inadequate += 1,
            }
            candidate.min_expected = min_expected;
            candidate.adequacy = Some(adequacy);
        }

        if ctx.platforms.len() < 2 && !ctx.candidates.is_empty() {
            warn!(
                action = "sample_size",
                component = "validation",
                platforms = ctx.platforms.len(),
                "Fewer than two platform labels; every pattern is inadequate"
            );
        }

        let usable = adequate + if config.accept_marginal { marginal } else { 0 };
        StageResult::new(
            self.name(),
            usable > 0,
            StageDiagnostics::SampleSize {
                platforms: ctx.platforms.clone(),
                adequate,
                marginal,
                inadequate,
            },
        )
    }
}

/// Stage 3: Pearson chi-square test of pattern presence against platform.
pub struct ChiSquareIndependence;

impl ValidationStage for ChiSquareIndependence {
    fn name(&self) -> StageName {
        StageName::ChiSquareIndependence
    }

    fn run(&self, ctx: &mut ValidationContext<'_>) -> StageResult {
        let totals = ctx.platform_totals.clone();
        let alpha = ctx.config.alpha;
        let (mut tested, mut significant, mut untestable) = (0, 0, 0);

        for candidate in ctx.candidates.values_mut() {
            match chi_square_test(&candidate.table(&totals), alpha) {
                Some(test) => {
                    tested += 1;
                    if test.significant {
                        significant += 1;
                    }
                    candidate.significant = test.significant;
                    candidate.test = Some(test);
                }
                None => {
                    untestable += 1;
                    candidate.significant = false;
                    // A table with no test has no usable sample either.
                    candidate.adequacy = Some(SampleAdequacy::Inadequate);
                }
            }
        }

        debug!(action = "chi_square", component = "validation", tested, significant, untestable, "Independence tests computed");

        StageResult::new(
            self.name(),
            tested > 0,
            StageDiagnostics::ChiSquare {
                tested,
                significant,
                untestable,
            },
        )
    }
}

/// Stage 4: adjust p-values across every tested candidate.
pub struct MultipleComparisonCorrection;

impl ValidationStage for MultipleComparisonCorrection {
    fn name(&self) -> StageName {
        StageName::MultipleComparisonCorrection
    }

    fn run(&self, ctx: &mut ValidationContext<'_>) -> StageResult {
        let method = ctx.config.correction;
        let alpha = ctx.config.alpha;

        let tested: Vec<(String, f64)> = ctx
            .candidates
            .iter()
            .filter_map(|(key, c)| c.test.map(|t| (key.clone(), t.p_value)))
            .collect();
        let p_values: Vec<f64> = tested.iter().map(|(_, p)| *p).collect();
        let adjusted = adjust_p_values(&p_values, method);

        let significant_before = ctx.candidates.values().filter(|c| c.significant).count();
        let mut significant_after = 0;
        for ((key, _), adjusted_p) in tested.iter().zip(adjusted) {
            if let Some(candidate) = ctx.candidates.get_mut(key) {
                candidate.adjusted_p_value = Some(adjusted_p);
                candidate.significant = adjusted_p < alpha;
                if candidate.significant {
                    significant_after += 1;
                }
            }
        }

        StageResult::new(
            self.name(),
            significant_after > 0,
            StageDiagnostics::MultipleComparison {
                method,
                tested: tested.len(),
                significant_before,
                significant_after,
            },
        )
    }
}

/// Stage 5: effect size, achieved power and minimum detectable effect.
pub struct PowerAnalysis;

impl ValidationStage for PowerAnalysis {
    fn name(&self) -> StageName {
        StageName::PowerAnalysis
    }

    fn run(&self, ctx: &mut ValidationContext<'_>) -> StageResult {
        let n = ctx.dataset.total_sites();
        let alpha = ctx.config.alpha;
        let target = ctx.config.target_power;
        let degrees_of_freedom = ctx.platforms.len().saturating_sub(1);

        let mut total_power = 0.0;
        let mut estimated = 0usize;
        let mut underpowered = 0usize;
        for candidate in ctx.candidates.values_mut() {
            let Some(test) = candidate.test else {
                continue;
            };
            let estimate = estimate_power(&test, n, alpha, target);
            total_power += estimate.achieved_power;
            estimated += 1;
            if !estimate.adequately_powered {
                underpowered += 1;
            }
            candidate.power = Some(estimate);
        }

        let mean_achieved_power = if estimated == 0 {
            0.0
        } else {
            total_power / estimated as f64
        };

        StageResult::new(
            self.name(),
            estimated > underpowered,
            StageDiagnostics::Power {
                sample_size: n,
                minimum_detectable_effect: minimum_detectable_effect(
                    n,
                    degrees_of_freedom,
                    alpha,
                    target,
                ),
                mean_achieved_power,
                underpowered,
            },
        )
    }
}

fn same_platform_family(vendor: &str, platform: &str) -> bool {
    let vendor = vendor.to_lowercase();
    let platform = platform.to_lowercase();
    vendor == platform
        || PLATFORM_FAMILIES
            .iter()
            .any(|(v, p)| *v == vendor && *p == platform)
}

/// Known platform where the pattern is most over-represented relative to
/// its expected count.
fn dominant_platform(candidate: &Candidate, platforms: &[String], totals: &[usize]) -> Option<String> {
    let present_total: usize = candidate.present.iter().sum();
    let n: usize = totals.iter().sum();
    if present_total == 0 || n == 0 {
        return None;
    }
    platforms
        .iter()
        .zip(&candidate.present)
        .zip(totals)
        .filter(|((label, &present), _)| label.as_str() != UNKNOWN_PLATFORM && present > 0)
        .map(|((label, &present), &total)| {
            let expected = present_total as f64 * total as f64 / n as f64;
            (label, present as f64 / expected)
        })
        .fold(None::<(&String, f64)>, |best, (label, ratio)| match best {
            Some((_, best_ratio)) if best_ratio >= ratio => best,
            _ => Some((label, ratio)),
        })
        .filter(|(_, ratio)| *ratio > 1.0)
        .map(|(label, _)| label.clone())
}

/// Stage 6: a header attributed to a platform vendor should concentrate on
/// that platform.
pub struct VendorCrossCheck;

impl ValidationStage for VendorCrossCheck {
    fn name(&self) -> StageName {
        StageName::VendorCrossCheck
    }

    fn run(&self, ctx: &mut ValidationContext<'_>) -> StageResult {
        let platforms = ctx.platforms.clone();
        let totals = ctx.platform_totals.clone();
        let table = ctx.table;

        let mut checked = 0;
        let mut consistent = 0;
        let mut contradicted = Vec::new();
        for (key, candidate) in ctx.candidates.iter_mut() {
            candidate.dominant_platform = dominant_platform(candidate, &platforms, &totals);
            let Some(vendor) = table.vendor_for_header(key) else {
                continue;
            };
            candidate.vendor = Some(vendor.name.clone());
            if !vendor.category.is_platform() {
                continue;
            }
            // Only an association that survived testing says anything about
            // where the header lives.
            let Some(dominant) = candidate.dominant_platform.as_deref() else {
                continue;
            };
            if candidate.test.is_some() && !candidate.significant {
                continue;
            }
            checked += 1;
            if same_platform_family(&vendor.name, dominant) {
                consistent += 1;
            } else {
                candidate.contradicted = true;
                contradicted.push(key.clone());
            }
        }

        if !contradicted.is_empty() {
            warn!(
                action = "vendor_cross_check",
                component = "validation",
                contradicted = contradicted.len(),
                "Headers concentrate on a platform other than their vendor"
            );
        }

        let rate = if checked == 0 {
            0.0
        } else {
            contradicted.len() as f64 / checked as f64
        };
        StageResult::new(
            self.name(),
            rate <= ctx.config.max_contradiction_rate,
            StageDiagnostics::VendorCrossCheck {
                checked,
                consistent,
                contradicted,
            },
        )
    }
}

/// Stage 7: fold every diagnostic into the quality score and the validated
/// set. Runs after every other stage has reported.
pub struct FinalScoring;

impl FinalScoring {
    /// A candidate is validated when its sample is adequate and it passed
    /// every other stage that ran and applies to it.
    pub fn is_validated(ctx: &ValidationContext<'_>, candidate: &Candidate) -> bool {
        let adequate = candidate.passes_sample_gate(&ctx.platform_totals, ctx.config);
        let significant = !ctx.stage_ran(StageName::ChiSquareIndependence) || candidate.significant;
        adequate && significant && !candidate.contradicted
    }

    pub fn quality_score(ctx: &ValidationContext<'_>, validated: usize) -> f64 {
        if ctx.candidates.is_empty() {
            return 0.0;
        }
        let ran: Vec<&StageResult> = ctx.results.iter().filter(|r| !r.skipped).collect();
        let stage_ratio = if ran.is_empty() {
            0.0
        } else {
            ran.iter().filter(|r| r.passed).count() as f64 / ran.len() as f64
        };
        let validated_ratio = validated as f64 / ctx.candidates.len() as f64;
        let mean_effect = {
            let effects: Vec<f64> = ctx
                .candidates
                .values()
                .filter_map(|c| c.test.map(|t| cramers_v(t.statistic, ctx.dataset.total_sites() as f64)))
                .collect();
            if effects.is_empty() {
                0.0
            } else {
                effects.iter().sum::<f64>() / effects.len() as f64
            }
        };
        let score = 0.5 * stage_ratio + 0.3 * validated_ratio + 0.2 * mean_effect;
        if score.is_finite() {
            score.clamp(0.0, 1.0)
        } else {
            0.0
        }
    }
}

impl ValidationStage for FinalScoring {
    fn name(&self) -> StageName {
        StageName::FinalScoring
    }

    fn run(&self, ctx: &mut ValidationContext<'_>) -> StageResult {
        let validated = ctx
            .candidates
            .values()
            .filter(|c| FinalScoring::is_validated(ctx, c))
            .count();
        let quality_score = FinalScoring::quality_score(ctx, validated);
        let earlier_passed = ctx.results.iter().all(|r| r.passed);

        StageResult::new(
            self.name(),
            earlier_passed && validated > 0,
            StageDiagnostics::FinalScoring {
                quality_score,
                validated,
                rejected: ctx.candidates.len() - validated,
            },
        )
    }
}

/// Every stage in execution order.
pub fn default_stages() -> Vec<Box<dyn ValidationStage>> {
    vec![
        Box::new(PatternCollection),
        Box::new(SampleSizeAdequacy),
        Box::new(ChiSquareIndependence),
        Box::new(MultipleComparisonCorrection),
        Box::new(PowerAnalysis),
        Box::new(VendorCrossCheck),
        Box::new(FinalScoring),
    ]
}
