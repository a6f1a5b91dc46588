use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use super::counter::{count_patterns, SiteObservations};
use super::header::normalize_header_name;
use super::vendor::{TechnologyStack, VendorSpecific};
use super::Analyzer;
use crate::dataset::Dataset;
use crate::error::{AnalysisError, Result};
use crate::options::AnalysisOptions;
use crate::stats::{frequency, AnalysisResult, AnalyzerKind, AnalyzerSpecific};

pub const TOP_CORRELATIONS: usize = 20;

/// Both headers of a mutually exclusive pair must reach this frequency.
pub const EXCLUSIVE_MIN_FREQUENCY: f64 = 0.1;

const PAIR_SEPARATOR: char = '+';

pub fn pair_key(a: &str, b: &str) -> String {
    if a <= b {
        format!("{a}{PAIR_SEPARATOR}{b}")
    } else {
        format!("{b}{PAIR_SEPARATOR}{a}")
    }
}

/// Contingency statistics for two binary features over `n` sites.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PairCounts {
    pub n: usize,
    pub count_a: usize,
    pub count_b: usize,
    pub joint: usize,
}

impl PairCounts {
    pub fn expected_frequency(&self) -> f64 {
        frequency(self.count_a, self.n) * frequency(self.count_b, self.n)
    }

    pub fn lift(&self) -> f64 {
        let expected = self.expected_frequency();
        if expected > 0.0 {
            frequency(self.joint, self.n) / expected
        } else {
            0.0
        }
    }

    pub fn phi(&self) -> f64 {
        let n = self.n as f64;
        let (a, b, ab) = (self.count_a as f64, self.count_b as f64, self.joint as f64);
        let denominator = (a * (n - a) * b * (n - b)).sqrt();
        if denominator > 0.0 && denominator.is_finite() {
            ((n * ab - a * b) / denominator).clamp(-1.0, 1.0)
        } else {
            0.0
        }
    }

    /// Mutual information in nats over the 2×2 presence table.
    pub fn mutual_information(&self) -> f64 {
        if self.n == 0 {
            return 0.0;
        }
        let n = self.n as f64;
        let a = self.count_a as f64;
        let b = self.count_b as f64;
        let ab = self.joint as f64;
        let cells = [
            (ab, a, b),
            (a - ab, a, n - b),
            (b - ab, n - a, b),
            (n - a - b + ab, n - a, n - b),
        ];
        cells
            .iter()
            .filter(|(joint, row, col)| *joint > 0.0 && *row > 0.0 && *col > 0.0)
            .map(|(joint, row, col)| {
                let p = joint / n;
                p * (p / ((row / n) * (col / n))).ln()
            })
            .sum::<f64>()
            .max(0.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PairStats {
    pub header_a: String,
    pub header_b: String,
    pub joint_count: usize,
    pub joint_frequency: f64,
    pub expected_frequency: f64,
    pub lift: f64,
    pub phi: f64,
    pub mutual_information: f64,
    pub vendors_a: BTreeSet<String>,
    pub vendors_b: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExclusivePair {
    pub header_a: String,
    pub header_b: String,
    pub frequency_a: f64,
    pub frequency_b: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StackCooccurrence {
    pub vendor_a: String,
    pub vendor_b: String,
    pub site_count: usize,
    pub frequency: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CooccurrenceSpecific {
    pub features_considered: usize,
    pub pair_stats: BTreeMap<String, PairStats>,
    pub strongest_correlations: Vec<PairStats>,
    pub mutually_exclusive_pairs: Vec<ExclusivePair>,
    pub stack_cooccurrence: Vec<StackCooccurrence>,
}

/// Pairwise header correlation. Needs the vendor analyzer's output injected
/// before `analyze` runs.
#[derive(Debug, Clone, Default)]
pub struct CooccurrenceAnalyzer {
    vendor_data: Option<Arc<VendorSpecific>>,
}

impl CooccurrenceAnalyzer {
    pub fn with_vendor_data(vendor_data: Arc<VendorSpecific>) -> Self {
        CooccurrenceAnalyzer {
            vendor_data: Some(vendor_data),
        }
    }

    pub fn set_vendor_data(&mut self, vendor_data: Arc<VendorSpecific>) {
        self.vendor_data = Some(vendor_data);
    }

    pub fn has_vendor_data(&self) -> bool {
        self.vendor_data.is_some()
    }
}

fn stack_vendors(stack: &TechnologyStack) -> BTreeSet<&str> {
    [&stack.cms, &stack.ecommerce, &stack.framework, &stack.hosting]
        .into_iter()
        .flatten()
        .chain(&stack.cdn)
        .chain(&stack.analytics)
        .chain(&stack.security)
        .map(String::as_str)
        .collect()
}

fn stack_cooccurrence(vendor_data: &VendorSpecific, total_sites: usize) -> Vec<StackCooccurrence> {
    let mut counts: BTreeMap<(&str, &str), usize> = BTreeMap::new();
    for stack in vendor_data.technology_stacks.values() {
        let vendors: Vec<&str> = stack_vendors(stack).into_iter().collect();
        for (i, a) in vendors.iter().enumerate() {
            for b in &vendors[i + 1..] {
                *counts.entry((*a, *b)).or_insert(0) += 1;
            }
        }
    }

    let mut pairs: Vec<StackCooccurrence> = counts
        .into_iter()
        .map(|((a, b), site_count)| StackCooccurrence {
            vendor_a: a.to_string(),
            vendor_b: b.to_string(),
            site_count,
            frequency: frequency(site_count, total_sites),
        })
        .collect();
    pairs.sort_by(|x, y| {
        y.site_count
            .cmp(&x.site_count)
            .then_with(|| (&x.vendor_a, &x.vendor_b).cmp(&(&y.vendor_a, &y.vendor_b)))
    });
    pairs
}

impl Analyzer for CooccurrenceAnalyzer {
    fn kind(&self) -> AnalyzerKind {
        AnalyzerKind::Cooccurrence
    }

    fn analyze(&self, dataset: &Dataset, options: &AnalysisOptions) -> Result<AnalysisResult> {
        let vendor_data = self
            .vendor_data
            .as_deref()
            .ok_or(AnalysisError::MissingDependency {
                analyzer: "cooccurrence",
                dependency: "vendor data",
            })?;

        let start_time = Instant::now();
        let total_sites = dataset.total_sites();

        let mut header_counts: BTreeMap<String, usize> = BTreeMap::new();
        for site in dataset.sites.values() {
            let names: BTreeSet<String> = site.headers.keys().map(|n| normalize_header_name(n)).collect();
            for name in names.into_iter().filter(|n| !n.is_empty()) {
                *header_counts.entry(name).or_insert(0) += 1;
            }
        }
        let features: BTreeMap<String, usize> = header_counts
            .into_iter()
            .filter(|(_, count)| options.passes_threshold(*count))
            .collect();
        debug!(action = "start", component = "cooccurrence_analyzer", features = features.len(), "Counting header pairs");

        let (patterns, total_found) = count_patterns(dataset, options, |_, site| {
            let present: BTreeSet<String> = site
                .headers
                .keys()
                .map(|n| normalize_header_name(n))
                .filter(|n| features.contains_key(n))
                .collect();
            let present: Vec<&String> = present.iter().collect();
            let mut observations = SiteObservations::new();
            for (i, a) in present.iter().enumerate() {
                for b in &present[i + 1..] {
                    observations.observe(pair_key(a, b));
                }
            }
            observations
        });

        let vendors_of = |header: &str| {
            vendor_data
                .header_vendors
                .get(header)
                .cloned()
                .unwrap_or_default()
        };

        // Header names may contain the separator; keys are never split.
        let names: Vec<&String> = features.keys().collect();
        let mut pair_stats = BTreeMap::new();
        for (i, &a) in names.iter().enumerate() {
            for &b in &names[i + 1..] {
                let key = pair_key(a, b);
                let Some(pattern) = patterns.get(&key) else {
                    continue;
                };
                let counts = PairCounts {
                    n: total_sites,
                    count_a: features[a],
                    count_b: features[b],
                    joint: pattern.site_count,
                };
                pair_stats.insert(
                    key,
                    PairStats {
                        header_a: a.to_string(),
                        header_b: b.to_string(),
                        joint_count: counts.joint,
                        joint_frequency: pattern.frequency,
                        expected_frequency: counts.expected_frequency(),
                        lift: counts.lift(),
                        phi: counts.phi(),
                        mutual_information: counts.mutual_information(),
                        vendors_a: vendors_of(a),
                        vendors_b: vendors_of(b),
                    },
                );
            }
        }

        let mut strongest: Vec<PairStats> = pair_stats.values().cloned().collect();
        strongest.sort_by(|x, y| {
            y.phi
                .total_cmp(&x.phi)
                .then_with(|| (&x.header_a, &x.header_b).cmp(&(&y.header_a, &y.header_b)))
        });
        strongest.truncate(TOP_CORRELATIONS);

        // Pairs never seen together have no pattern, so look at the
        // frequent features directly.
        let frequent: Vec<(&String, f64)> = features
            .iter()
            .map(|(name, &count)| (name, frequency(count, total_sites)))
            .filter(|(_, freq)| *freq >= EXCLUSIVE_MIN_FREQUENCY)
            .collect();
        let mut seen_together: BTreeSet<String> = patterns.keys().cloned().collect();
        if options.min_occurrences > 1 {
            // Pairs below the threshold were dropped from `patterns` but did
            // co-occur.
            for site in dataset.sites.values() {
                let present: Vec<String> = site
                    .headers
                    .keys()
                    .map(|n| normalize_header_name(n))
                    .filter(|n| frequent.iter().any(|(f, _)| *f == n))
                    .collect();
                for (i, a) in present.iter().enumerate() {
                    for b in &present[i + 1..] {
                        seen_together.insert(pair_key(a, b));
                    }
                }
            }
        }
        let mut mutually_exclusive_pairs = Vec::new();
        for (i, (a, freq_a)) in frequent.iter().enumerate() {
            for (b, freq_b) in &frequent[i + 1..] {
                if !seen_together.contains(&pair_key(a, b)) {
                    mutually_exclusive_pairs.push(ExclusivePair {
                        header_a: a.to_string(),
                        header_b: b.to_string(),
                        frequency_a: *freq_a,
                        frequency_b: *freq_b,
                    });
                }
            }
        }

        let specific = CooccurrenceSpecific {
            features_considered: features.len(),
            pair_stats,
            strongest_correlations: strongest,
            mutually_exclusive_pairs,
            stack_cooccurrence: stack_cooccurrence(vendor_data, total_sites),
        };

        info!(
            action = "complete",
            component = "cooccurrence_analyzer",
            pairs_found = total_found,
            pairs_kept = patterns.len(),
            exclusive_pairs = specific.mutually_exclusive_pairs.len(),
            duration_ms = start_time.elapsed().as_millis(),
            "Co-occurrence analysis completed"
        );

        Ok(AnalysisResult::new(
            patterns,
            total_found,
            total_sites,
            options,
            AnalyzerSpecific::Cooccurrence(specific),
        ))
    }
}
