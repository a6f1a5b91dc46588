use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;
use tracing::{debug, info};

use super::counter::{count_patterns, SiteObservations};
use super::Analyzer;
use crate::dataset::Dataset;
use crate::error::Result;
use crate::options::AnalysisOptions;
use crate::stats::{AnalysisResult, AnalyzerKind, AnalyzerSpecific};

/// Transport-level headers nearly every server sends. Skipped when semantic
/// filtering is on.
const UNIVERSAL_HEADERS: &[&str] = &[
    "accept-ranges",
    "age",
    "cache-control",
    "connection",
    "content-encoding",
    "content-language",
    "content-length",
    "content-type",
    "date",
    "etag",
    "expires",
    "keep-alive",
    "last-modified",
    "pragma",
    "transfer-encoding",
    "vary",
];

pub fn is_universal_header(name: &str) -> bool {
    UNIVERSAL_HEADERS.contains(&name)
}

pub fn normalize_header_name(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeaderSpecific {
    /// Distinct values observed per retained header.
    pub distinct_values: BTreeMap<String, usize>,
    pub sites_without_headers: usize,
    pub headers_skipped_by_filter: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HeaderAnalyzer;

impl HeaderAnalyzer {
    pub fn new() -> Self {
        HeaderAnalyzer
    }
}

impl Analyzer for HeaderAnalyzer {
    fn kind(&self) -> AnalyzerKind {
        AnalyzerKind::Headers
    }

    fn analyze(&self, dataset: &Dataset, options: &AnalysisOptions) -> Result<AnalysisResult> {
        let start_time = Instant::now();
        debug!(action = "start", component = "header_analyzer", site_count = dataset.total_sites(), "Counting header patterns");

        let (patterns, total_found) = count_patterns(dataset, options, |_, site| {
            let mut observations = SiteObservations::new();
            for (name, values) in &site.headers {
                let key = normalize_header_name(name);
                if key.is_empty() || (options.semantic_filtering && is_universal_header(&key)) {
                    continue;
                }
                if values.is_empty() {
                    observations.observe(key.clone());
                }
                for value in values {
                    observations.observe_with_example(key.clone(), value);
                }
            }
            observations
        });

        let mut specific = HeaderSpecific::default();
        let mut skipped = BTreeSet::new();
        let mut values_by_header: BTreeMap<String, BTreeSet<&str>> = BTreeMap::new();
        for site in dataset.sites.values() {
            if site.headers.is_empty() {
                specific.sites_without_headers += 1;
            }
            for (name, values) in &site.headers {
                let key = normalize_header_name(name);
                if options.semantic_filtering && is_universal_header(&key) {
                    skipped.insert(key);
                    continue;
                }
                if patterns.contains_key(&key) {
                    values_by_header
                        .entry(key)
                        .or_default()
                        .extend(values.iter().map(|v| v.trim()));
                }
            }
        }
        specific.distinct_values = values_by_header
            .into_iter()
            .map(|(key, values)| (key, values.len()))
            .collect();
        specific.headers_skipped_by_filter = skipped.len();

        info!(
            action = "complete",
            component = "header_analyzer",
            patterns_found = total_found,
            patterns_kept = patterns.len(),
            duration_ms = start_time.elapsed().as_millis(),
            "Header analysis completed"
        );

        Ok(AnalysisResult::new(
            patterns,
            total_found,
            dataset.total_sites(),
            options,
            AnalyzerSpecific::Headers(specific),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Site;

    #[test]
    fn header_names_are_case_folded() {
        let dataset = Dataset::from_sites([
            Site::new("a.com").with_header("Server", "nginx"),
            Site::new("b.com").with_header("server", "apache"),
        ]);
        let result = HeaderAnalyzer::new()
            .analyze(&dataset, &AnalysisOptions::default())
            .unwrap();
        assert_eq!(result.patterns["server"].site_count, 2);
        assert_eq!(result.patterns.len(), 1);
    }

    #[test]
    fn semantic_filtering_skips_universal_headers() {
        let dataset = Dataset::from_sites([Site::new("a.com")
            .with_header("date", "Mon, 01 Jan 2024 00:00:00 GMT")
            .with_header("x-powered-by", "PHP/8.2")]);
        let options = AnalysisOptions {
            semantic_filtering: true,
            ..AnalysisOptions::default()
        };
        let result = HeaderAnalyzer::new().analyze(&dataset, &options).unwrap();
        assert!(!result.patterns.contains_key("date"));
        assert!(result.patterns.contains_key("x-powered-by"));
        match &result.analyzer_specific {
            AnalyzerSpecific::Headers(specific) => {
                assert_eq!(specific.headers_skipped_by_filter, 1)
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn header_without_values_still_counts() {
        let mut site = Site::new("a.com");
        site.headers.insert("x-empty".into(), Default::default());
        let dataset = Dataset::from_sites([site]);
        let result = HeaderAnalyzer::new()
            .analyze(&dataset, &AnalysisOptions::default())
            .unwrap();
        assert_eq!(result.patterns["x-empty"].site_count, 1);
        assert!(result.patterns["x-empty"].examples.is_empty());
    }

    #[test]
    fn sites_without_headers_are_tallied() {
        let dataset = Dataset::from_sites([Site::new("a.com"), Site::new("b.com").with_header("server", "x")]);
        let result = HeaderAnalyzer::new()
            .analyze(&dataset, &AnalysisOptions::default())
            .unwrap();
        match result.analyzer_specific {
            AnalyzerSpecific::Headers(specific) => {
                assert_eq!(specific.sites_without_headers, 1);
                assert_eq!(specific.distinct_values["server"], 1);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }
}
