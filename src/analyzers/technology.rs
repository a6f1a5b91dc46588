use serde::Serialize;
use std::time::Instant;
use tracing::{debug, info};

use super::counter::{count_patterns, SiteObservations};
use super::Analyzer;
use crate::dataset::Dataset;
use crate::error::Result;
use crate::options::AnalysisOptions;
use crate::stats::{AnalysisResult, AnalyzerKind, AnalyzerSpecific};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TechnologySpecific {
    pub average_technologies_per_site: f64,
    pub sites_without_technologies: usize,
}

/// Counts the technologies the collection layer inferred for each site.
#[derive(Debug, Clone, Copy, Default)]
pub struct TechnologyAnalyzer;

impl TechnologyAnalyzer {
    pub fn new() -> Self {
        TechnologyAnalyzer
    }
}

impl Analyzer for TechnologyAnalyzer {
    fn kind(&self) -> AnalyzerKind {
        AnalyzerKind::Technologies
    }

    fn analyze(&self, dataset: &Dataset, options: &AnalysisOptions) -> Result<AnalysisResult> {
        let start_time = Instant::now();
        debug!(action = "start", component = "technology_analyzer", site_count = dataset.total_sites(), "Counting technology patterns");

        let (patterns, total_found) = count_patterns(dataset, options, |_, site| {
            let mut observations = SiteObservations::new();
            for technology in &site.technologies {
                let key = technology.trim().to_lowercase();
                if !key.is_empty() {
                    observations.observe_with_example(key, technology);
                }
            }
            observations
        });

        let mut specific = TechnologySpecific::default();
        let mut total_technologies = 0usize;
        for site in dataset.sites.values() {
            if site.technologies.is_empty() {
                specific.sites_without_technologies += 1;
            }
            total_technologies += site.technologies.len();
        }
        if !dataset.is_empty() {
            specific.average_technologies_per_site =
                total_technologies as f64 / dataset.total_sites() as f64;
        }

        info!(
            action = "complete",
            component = "technology_analyzer",
            patterns_found = total_found,
            patterns_kept = patterns.len(),
            duration_ms = start_time.elapsed().as_millis(),
            "Technology analysis completed"
        );

        Ok(AnalysisResult::new(
            patterns,
            total_found,
            dataset.total_sites(),
            options,
            AnalyzerSpecific::Technologies(specific),
        ))
    }
}
