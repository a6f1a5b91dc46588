//! Cross-platform signal/noise scoring of header, meta and script patterns.

use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, info};

use crate::dataset::Dataset;
use crate::stats::{AnalysisResult, AnalyzerKind, Pattern};

/// Patterns scoring below this and present on two or more platforms are
/// infrastructure noise.
pub const NOISE_THRESHOLD: f64 = 0.3;
pub const DISCRIMINATORY_THRESHOLD: f64 = 0.5;
pub const TOP_DISCRIMINATORY: usize = 20;

/// 1 - H/ln(K) over per-platform presence rates normalized to sum to one.
/// A pattern on a single platform scores 1, one spread evenly scores 0.
pub fn discriminative_score(rates: &[f64]) -> f64 {
    let k = rates.len();
    let total: f64 = rates.iter().filter(|r| r.is_finite() && **r > 0.0).sum();
    if k < 2 || total <= 0.0 {
        return 0.0;
    }
    let entropy: f64 = rates
        .iter()
        .filter(|r| r.is_finite() && **r > 0.0)
        .map(|r| {
            let p = r / total;
            -p * p.ln()
        })
        .sum();
    let score = 1.0 - entropy / (k as f64).ln();
    if score.is_finite() {
        score.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternDiscrimination {
    pub pattern: String,
    pub source: AnalyzerKind,
    pub discriminative_score: f64,
    pub frequency: f64,
    pub dominant_platform: Option<String>,
    pub platform_rates: BTreeMap<String, f64>,
    pub platforms_present: usize,
    pub noise: bool,
}

impl PatternDiscrimination {
    pub fn is_discriminatory(&self) -> bool {
        !self.noise && self.discriminative_score >= DISCRIMINATORY_THRESHOLD
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopDiscriminatoryPattern {
    pub pattern: String,
    pub source: AnalyzerKind,
    pub discriminative_score: f64,
    pub frequency: f64,
    pub dominant_platform: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityMetrics {
    pub signal_to_noise_ratio: f64,
    pub platform_coverage_score: f64,
    pub detection_confidence_boost: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformDiscriminationSummary {
    pub platforms: Vec<String>,
    pub total_patterns_analyzed: usize,
    pub discriminatory_patterns: usize,
    pub infrastructure_noise_filtered: usize,
    /// The one field expressed as a percentage.
    pub noise_reduction_percentage: f64,
    pub average_discrimination_score: f64,
    pub top_discriminatory_patterns: Vec<TopDiscriminatoryPattern>,
    pub platform_specificity_distribution: BTreeMap<String, usize>,
    pub quality_metrics: QualityMetrics,
}

struct PlatformIndex<'a> {
    platforms: Vec<String>,
    totals: Vec<usize>,
    site_platform: BTreeMap<&'a str, usize>,
}

impl<'a> PlatformIndex<'a> {
    fn new(dataset: &'a Dataset) -> Self {
        let platforms: Vec<String> = dataset.platforms().into_iter().collect();
        let mut totals = vec![0; platforms.len()];
        let mut site_platform = BTreeMap::new();
        for (id, site) in &dataset.sites {
            if let Some(column) = site
                .platform()
                .and_then(|label| platforms.iter().position(|p| p == label))
            {
                totals[column] += 1;
                site_platform.insert(id.as_str(), column);
            }
        }
        PlatformIndex {
            platforms,
            totals,
            site_platform,
        }
    }

    fn score(&self, source: AnalyzerKind, pattern: &Pattern) -> Option<PatternDiscrimination> {
        let mut present = vec![0usize; self.platforms.len()];
        for site in &pattern.sites {
            if let Some(&column) = self.site_platform.get(site.as_str()) {
                present[column] += 1;
            }
        }
        if present.iter().all(|&c| c == 0) {
            return None;
        }

        let rates: Vec<f64> = present
            .iter()
            .zip(&self.totals)
            .map(|(&p, &t)| if t == 0 { 0.0 } else { p as f64 / t as f64 })
            .collect();
        let score = discriminative_score(&rates);
        let platforms_present = present.iter().filter(|&&c| c > 0).count();
        let dominant_platform = rates
            .iter()
            .enumerate()
            .fold(None::<(usize, f64)>, |best, (i, &rate)| match best {
                Some((_, best_rate)) if best_rate >= rate => best,
                _ => Some((i, rate)),
            })
            .map(|(i, _)| self.platforms[i].clone());

        Some(PatternDiscrimination {
            pattern: format!("{}:{}", source_prefix(source), pattern.key),
            source,
            discriminative_score: score,
            frequency: pattern.frequency,
            dominant_platform,
            platform_rates: self.platforms.iter().cloned().zip(rates).collect(),
            platforms_present,
            noise: score < NOISE_THRESHOLD && platforms_present >= 2,
        })
    }
}

fn source_prefix(source: AnalyzerKind) -> &'static str {
    match source {
        AnalyzerKind::Headers => "header",
        AnalyzerKind::MetaTags => "meta",
        AnalyzerKind::Scripts => "script",
        other => other.as_str(),
    }
}

/// Score every pattern of the given results and summarize. Needs at least
/// two known platforms; otherwise the summary is empty.
pub fn score_patterns(dataset: &Dataset, results: &[&AnalysisResult]) -> Vec<PatternDiscrimination> {
    let index = PlatformIndex::new(dataset);
    if index.platforms.len() < 2 {
        return Vec::new();
    }
    let candidates: Vec<(AnalyzerKind, &Pattern)> = results
        .iter()
        .flat_map(|result| {
            let source = result.metadata.analyzer;
            result.patterns.values().map(move |p| (source, p))
        })
        .collect();
    candidates
        .into_par_iter()
        .filter_map(|(source, pattern)| index.score(source, pattern))
        .collect()
}

pub fn summarize(dataset: &Dataset, results: &[&AnalysisResult]) -> PlatformDiscriminationSummary {
    let start_time = Instant::now();
    let scored = score_patterns(dataset, results);
    let platforms: Vec<String> = dataset.platforms().into_iter().collect();
    debug!(action = "score", component = "discrimination", patterns = scored.len(), platforms = platforms.len(), "Scored patterns across platforms");

    let total = scored.len();
    let noise = scored.iter().filter(|p| p.noise).count();
    let discriminatory: Vec<&PatternDiscrimination> =
        scored.iter().filter(|p| p.is_discriminatory()).collect();

    let average_discrimination_score = if total == 0 {
        0.0
    } else {
        scored.iter().map(|p| p.discriminative_score).sum::<f64>() / total as f64
    };
    let noise_reduction_percentage = if total == 0 {
        0.0
    } else {
        (noise as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
    };

    let mut platform_specificity_distribution = BTreeMap::new();
    for pattern in &discriminatory {
        if let Some(platform) = &pattern.dominant_platform {
            *platform_specificity_distribution
                .entry(platform.clone())
                .or_insert(0) += 1;
        }
    }

    let mut ranked: Vec<&PatternDiscrimination> = scored.iter().filter(|p| !p.noise).collect();
    ranked.sort_by(|a, b| {
        b.discriminative_score
            .total_cmp(&a.discriminative_score)
            .then_with(|| b.frequency.total_cmp(&a.frequency))
            .then_with(|| a.pattern.cmp(&b.pattern))
    });
    let top_discriminatory_patterns = ranked
        .into_iter()
        .take(TOP_DISCRIMINATORY)
        .map(|p| TopDiscriminatoryPattern {
            pattern: p.pattern.clone(),
            source: p.source,
            discriminative_score: p.discriminative_score,
            frequency: p.frequency,
            dominant_platform: p.dominant_platform.clone(),
        })
        .collect();

    let signal_to_noise_ratio = if noise == 0 {
        discriminatory.len() as f64
    } else {
        discriminatory.len() as f64 / noise as f64
    };
    let platform_coverage_score = if platforms.is_empty() {
        0.0
    } else {
        platform_specificity_distribution.len() as f64 / platforms.len() as f64
    };
    let detection_confidence_boost = if discriminatory.is_empty() || total == 0 {
        0.0
    } else {
        let mean = discriminatory
            .iter()
            .map(|p| p.discriminative_score)
            .sum::<f64>()
            / discriminatory.len() as f64;
        mean * (1.0 - noise as f64 / total as f64)
    };

    info!(
        action = "complete",
        component = "discrimination",
        total_patterns = total,
        discriminatory = discriminatory.len(),
        noise_filtered = noise,
        duration_ms = start_time.elapsed().as_millis(),
        "Platform discrimination summary built"
    );

    PlatformDiscriminationSummary {
        platforms,
        total_patterns_analyzed: total,
        discriminatory_patterns: discriminatory.len(),
        infrastructure_noise_filtered: noise,
        noise_reduction_percentage,
        average_discrimination_score,
        top_discriminatory_patterns,
        platform_specificity_distribution,
        quality_metrics: QualityMetrics {
            signal_to_noise_ratio,
            platform_coverage_score,
            detection_confidence_boost: detection_confidence_boost.max(0.0),
        },
    }
}
