//! Seven-stage statistical gate that promotes raw header patterns to
//! validated patterns.

pub mod pipeline;
pub mod stages;
pub mod statistics;

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{AnalysisError, Result};

pub use pipeline::ValidationPipeline;
pub use statistics::{ChiSquareTest, CorrectionMethod, PowerEstimate};

pub const TOTAL_STAGES: usize = 7;

/// Column label for sites without a known platform.
pub const UNKNOWN_PLATFORM: &str = "Unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum StageName {
    PatternCollection,
    SampleSizeAdequacy,
    ChiSquareIndependence,
    MultipleComparisonCorrection,
    PowerAnalysis,
    VendorCrossCheck,
    FinalScoring,
}

impl StageName {
    /// The toggleable middle stages, in execution order.
    pub const CHECKLIST: [StageName; 5] = [
        StageName::SampleSizeAdequacy,
        StageName::ChiSquareIndependence,
        StageName::MultipleComparisonCorrection,
        StageName::PowerAnalysis,
        StageName::VendorCrossCheck,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StageName::PatternCollection => "pattern_collection",
            StageName::SampleSizeAdequacy => "sample_size_adequacy",
            StageName::ChiSquareIndependence => "chi_square_independence",
            StageName::MultipleComparisonCorrection => "multiple_comparison_correction",
            StageName::PowerAnalysis => "power_analysis",
            StageName::VendorCrossCheck => "vendor_cross_check",
            StageName::FinalScoring => "final_scoring",
        }
    }

    pub fn is_endpoint(self) -> bool {
        matches!(self, StageName::PatternCollection | StageName::FinalScoring)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationConfig {
    pub alpha: f64,
    /// Minimum expected cell count for an adequate sample.
    pub min_expected_cell: f64,
    /// Minimum expected cell count for a marginal sample.
    pub marginal_expected_cell: f64,
    /// Let marginal samples through the sample-size gate.
    pub accept_marginal: bool,
    pub target_power: f64,
    pub correction: CorrectionMethod,
    /// Largest share of cross-checked patterns that may be contradicted
    /// before the cross-check stage fails.
    pub max_contradiction_rate: f64,
    pub enabled: BTreeSet<StageName>,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        ValidationConfig {
            alpha: 0.05,
            min_expected_cell: 5.0,
            marginal_expected_cell: 1.0,
            accept_marginal: false,
            target_power: 0.8,
            correction: CorrectionMethod::BenjaminiHochberg,
            max_contradiction_rate: 0.2,
            enabled: StageName::CHECKLIST.into_iter().collect(),
        }
    }
}

impl ValidationConfig {
    /// The first and last stages cannot be turned off.
    pub fn is_enabled(&self, stage: StageName) -> bool {
        stage.is_endpoint() || self.enabled.contains(&stage)
    }

    pub fn with_stage(mut self, stage: StageName, enabled: bool) -> Self {
        if !stage.is_endpoint() {
            if enabled {
                self.enabled.insert(stage);
            } else {
                self.enabled.remove(&stage);
            }
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        let in_unit = |value: f64| value > 0.0 && value < 1.0;
        if !in_unit(self.alpha) {
            return Err(AnalysisError::InvalidOptions {
                reason: format!("alpha must be in (0, 1), got {}", self.alpha),
            });
        }
        if !in_unit(self.target_power) {
            return Err(AnalysisError::InvalidOptions {
                reason: format!("target power must be in (0, 1), got {}", self.target_power),
            });
        }
        if !(self.marginal_expected_cell >= 0.0
            && self.marginal_expected_cell <= self.min_expected_cell)
        {
            return Err(AnalysisError::InvalidOptions {
                reason: "marginal expected cell must be between 0 and the adequate threshold"
                    .to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SampleAdequacy {
    Adequate,
    Marginal,
    Inadequate,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum StageDiagnostics {
    #[serde(rename_all = "camelCase")]
    PatternCollection {
        raw_patterns: usize,
        candidates: usize,
        below_threshold: usize,
    },
    #[serde(rename_all = "camelCase")]
    SampleSize {
        platforms: Vec<String>,
        adequate: usize,
        marginal: usize,
        inadequate: usize,
    },
    #[serde(rename_all = "camelCase")]
    ChiSquare {
        tested: usize,
        significant: usize,
        untestable: usize,
    },
    #[serde(rename_all = "camelCase")]
    MultipleComparison {
        method: CorrectionMethod,
        tested: usize,
        significant_before: usize,
        significant_after: usize,
    },
    #[serde(rename_all = "camelCase")]
    Power {
        sample_size: usize,
        minimum_detectable_effect: Option<f64>,
        mean_achieved_power: f64,
        underpowered: usize,
    },
    #[serde(rename_all = "camelCase")]
    VendorCrossCheck {
        checked: usize,
        consistent: usize,
        contradicted: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    FinalScoring {
        quality_score: f64,
        validated: usize,
        rejected: usize,
    },
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageResult {
    pub name: StageName,
    pub passed: bool,
    pub skipped: bool,
    pub diagnostics: StageDiagnostics,
}

impl StageResult {
    pub fn new(name: StageName, passed: bool, diagnostics: StageDiagnostics) -> Self {
        StageResult {
            name,
            passed,
            skipped: false,
            diagnostics,
        }
    }

    /// A disabled stage passes vacuously.
    pub fn skipped(name: StageName) -> Self {
        StageResult {
            name,
            passed: true,
            skipped: true,
            diagnostics: StageDiagnostics::Skipped,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationSummary {
    pub overall_passed: bool,
    pub total_stages: usize,
    pub quality_score: f64,
    pub candidate_count: usize,
    pub validated_count: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdequacyTally {
    pub adequate: usize,
    pub marginal: usize,
    pub inadequate: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PowerAnalysis {
    pub sample_size: usize,
    pub alpha: f64,
    pub target_power: f64,
    pub minimum_detectable_effect: Option<f64>,
    pub mean_achieved_power: f64,
    pub per_pattern: BTreeMap<String, PowerEstimate>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatisticalMetrics {
    pub chi_square_tests: BTreeMap<String, ChiSquareTest>,
    pub adjusted_p_values: BTreeMap<String, f64>,
    pub power_analysis: PowerAnalysis,
    pub sample_size_adequacy: AdequacyTally,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatedPattern {
    pub key: String,
    pub site_count: usize,
    pub frequency: f64,
    pub adequacy: SampleAdequacy,
    /// `None` when the chi-square stage was disabled.
    pub p_value: Option<f64>,
    pub adjusted_p_value: Option<f64>,
    pub cramers_v: f64,
    pub dominant_platform: Option<String>,
    pub vendor: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationSpecific {
    pub validation_summary: ValidationSummary,
    pub stage_results: Vec<StageResult>,
    pub statistical_metrics: StatisticalMetrics,
    pub validated_patterns: BTreeMap<String, ValidatedPattern>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_cannot_be_disabled() {
        let config = ValidationConfig::default()
            .with_stage(StageName::PatternCollection, false)
            .with_stage(StageName::FinalScoring, false)
            .with_stage(StageName::PowerAnalysis, false);
        assert!(config.is_enabled(StageName::PatternCollection));
        assert!(config.is_enabled(StageName::FinalScoring));
        assert!(!config.is_enabled(StageName::PowerAnalysis));
        assert!(config.is_enabled(StageName::ChiSquareIndependence));
    }

    #[test]
    fn config_rejects_out_of_range_values() {
        assert!(ValidationConfig::default().validate().is_ok());

        let bad_alpha = ValidationConfig {
            alpha: 1.5,
            ..ValidationConfig::default()
        };
        assert!(matches!(
            bad_alpha.validate(),
            Err(AnalysisError::InvalidOptions { .. })
        ));

        let bad_cells = ValidationConfig {
            marginal_expected_cell: 10.0,
            ..ValidationConfig::default()
        };
        assert!(bad_cells.validate().is_err());
    }

    #[test]
    fn stage_diagnostics_serialize_with_kind_tag() {
        let result = StageResult::new(
            StageName::ChiSquareIndependence,
            true,
            StageDiagnostics::ChiSquare {
                tested: 3,
                significant: 1,
                untestable: 0,
            },
        );
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["name"], "chiSquareIndependence");
        assert_eq!(json["diagnostics"]["kind"], "chiSquare");
        assert_eq!(json["diagnostics"]["tested"], 3);
    }
}
