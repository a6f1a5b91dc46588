use regex::Regex;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::LazyLock;
use std::time::Instant;
use tracing::{debug, info};
use url::Url;

use super::counter::{count_patterns, SiteObservations};
use super::Analyzer;
use crate::dataset::Dataset;
use crate::domain;
use crate::error::Result;
use crate::options::AnalysisOptions;
use crate::stats::{AnalysisResult, AnalyzerKind, AnalyzerSpecific};

/// Path segments that change between deployments: versions, hashes, build ids.
static VOLATILE_SEGMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(v?\d+(\.\d+)*|[0-9a-f]{8,}|[\w-]*\d{6,}[\w-]*)$").expect("valid regex literal")
});

const PATH_DEPTH: usize = 2;

/// Stable directory prefix of a script path, e.g.
/// `/wp-includes/js/jquery/jquery.min.js?ver=3.7` -> `/wp-includes/js`.
pub fn path_pattern(path: &str) -> Option<String> {
    let path = path.split(['?', '#']).next().unwrap_or("");
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let (_, directories) = segments.split_last()?;

    let stable: Vec<String> = directories
        .iter()
        .map(|s| s.to_lowercase())
        .filter(|s| !VOLATILE_SEGMENT.is_match(s))
        .take(PATH_DEPTH)
        .collect();

    if stable.is_empty() {
        None
    } else {
        Some(format!("/{}", stable.join("/")))
    }
}

fn script_path(src: &str) -> Option<String> {
    let src = src.trim();
    if let Some(rest) = src.strip_prefix("//") {
        return Url::parse(&format!("https://{}", rest))
            .ok()
            .map(|u| u.path().to_string());
    }
    if src.starts_with("http://") || src.starts_with("https://") {
        return Url::parse(src).ok().map(|u| u.path().to_string());
    }
    if src.starts_with('/') {
        return Some(src.to_string());
    }
    None
}

fn site_host(site_id: &str) -> &str {
    site_id.split(['/', ':']).next().unwrap_or(site_id)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptSpecific {
    pub host_patterns: usize,
    pub path_patterns: usize,
    pub sites_without_scripts: usize,
    pub unclassified_scripts: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ScriptAnalyzer;

impl ScriptAnalyzer {
    pub fn new() -> Self {
        ScriptAnalyzer
    }
}

impl Analyzer for ScriptAnalyzer {
    fn kind(&self) -> AnalyzerKind {
        AnalyzerKind::Scripts
    }

    fn analyze(&self, dataset: &Dataset, options: &AnalysisOptions) -> Result<AnalysisResult> {
        let start_time = Instant::now();
        debug!(action = "start", component = "script_analyzer", site_count = dataset.total_sites(), "Counting script patterns");

        let (patterns, total_found) = count_patterns(dataset, options, |site_id, site| {
            let own_host = site_host(site_id);
            let mut observations = SiteObservations::new();
            for src in &site.scripts {
                if let Some(host) = domain::script_host(src) {
                    if host != own_host {
                        observations.observe_with_example(format!("host:{}", host), src);
                    }
                }
                if let Some(pattern) = script_path(src).as_deref().and_then(path_pattern) {
                    observations.observe_with_example(format!("path:{}", pattern), src);
                }
            }
            observations
        });

        let mut specific = ScriptSpecific {
            host_patterns: patterns.keys().filter(|k| k.starts_with("host:")).count(),
            path_patterns: patterns.keys().filter(|k| k.starts_with("path:")).count(),
            ..ScriptSpecific::default()
        };
        let mut unclassified = BTreeSet::new();
        for site in dataset.sites.values() {
            if site.scripts.is_empty() {
                specific.sites_without_scripts += 1;
            }
            for src in &site.scripts {
                let has_host = domain::script_host(src).is_some();
                let has_path = script_path(src).as_deref().and_then(path_pattern).is_some();
                if !has_host && !has_path {
                    unclassified.insert(src.as_str());
                }
            }
        }
        specific.unclassified_scripts = unclassified.len();

        info!(
            action = "complete",
            component = "script_analyzer",
            patterns_found = total_found,
            patterns_kept = patterns.len(),
            duration_ms = start_time.elapsed().as_millis(),
            "Script analysis completed"
        );

        Ok(AnalysisResult::new(
            patterns,
            total_found,
            dataset.total_sites(),
            options,
            AnalyzerSpecific::Scripts(specific),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Site;

    #[test]
    fn path_pattern_keeps_stable_directories() {
        assert_eq!(
            path_pattern("/wp-includes/js/jquery/jquery.min.js?ver=3.7").as_deref(),
            Some("/wp-includes/js")
        );
        assert_eq!(
            path_pattern("/_next/static/chunks/main.js").as_deref(),
            Some("/_next/static")
        );
        assert_eq!(
            path_pattern("/assets/3f9a8c7d12/v2/app.js").as_deref(),
            Some("/assets")
        );
        assert_eq!(path_pattern("/app.js"), None);
    }

    #[test]
    fn external_hosts_and_paths_become_keys() {
        let dataset = Dataset::from_sites([
            Site::new("shop-a.com")
                .with_script("https://cdn.shopify.com/s/files/1/theme.js")
                .with_script("//shop-a.com/assets/app.js"),
            Site::new("shop-b.com").with_script("https://cdn.shopify.com/s/files/2/theme.js"),
        ]);
        let result = ScriptAnalyzer::new()
            .analyze(&dataset, &AnalysisOptions::default())
            .unwrap();

        assert_eq!(result.patterns["host:cdn.shopify.com"].site_count, 2);
        assert_eq!(result.patterns["path:/s/files"].site_count, 2);
        assert!(!result.patterns.contains_key("host:shop-a.com"));
        assert_eq!(result.patterns["path:/assets"].site_count, 1);
    }

    #[test]
    fn inline_or_bare_scripts_are_unclassified() {
        let dataset = Dataset::from_sites([Site::new("a.com").with_script("app.js")]);
        let result = ScriptAnalyzer::new()
            .analyze(&dataset, &AnalysisOptions::default())
            .unwrap();
        assert!(result.patterns.is_empty());
        match result.analyzer_specific {
            AnalyzerSpecific::Scripts(specific) => assert_eq!(specific.unclassified_scripts, 1),
            other => panic!("unexpected payload {other:?}"),
        }
    }
}
