use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;
use std::time::Instant;
use tracing::{debug, info};

use super::counter::{count_patterns, SiteObservations};
use super::Analyzer;
use crate::dataset::Dataset;
use crate::error::Result;
use crate::options::AnalysisOptions;
use crate::stats::{AnalysisResult, AnalyzerKind, AnalyzerSpecific};

/// Meta names whose content names a product; these also produce a
/// `name:product` key.
const PRODUCT_META: &[&str] = &["generator", "application-name", "framework"];

/// Purely descriptive meta tags, skipped under semantic filtering.
const DESCRIPTIVE_META: &[&str] = &[
    "author",
    "description",
    "keywords",
    "robots",
    "theme-color",
    "viewport",
];
const DESCRIPTIVE_META_PREFIXES: &[&str] = &["og:", "twitter:", "fb:", "article:"];

static VERSION_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+v?\d[\w.\-]*.*$").expect("valid regex literal"));

pub fn is_descriptive_meta(name: &str) -> bool {
    DESCRIPTIVE_META.contains(&name)
        || DESCRIPTIVE_META_PREFIXES
            .iter()
            .any(|prefix| name.starts_with(prefix))
}

/// Product part of a generator-like meta value: `WordPress 6.4.2` becomes
/// `wordpress`, `Drupal 10 (https://www.drupal.org)` becomes `drupal`.
pub fn product_name(content: &str) -> Option<String> {
    let lowered = content.trim().to_lowercase();
    let cut = lowered
        .split(|c| c == ';' || c == '(' || c == '|' || c == ',')
        .next()
        .unwrap_or("");
    let cut = cut.split(" - ").next().unwrap_or("");
    let product = VERSION_SUFFIX.replace(cut, "");
    let product = product.trim().trim_end_matches(['!', '.', ':']).trim();
    (!product.is_empty()).then(|| product.to_string())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaSpecific {
    pub product_patterns: usize,
    pub sites_without_meta: usize,
    pub tags_skipped_by_filter: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MetaTagAnalyzer;

impl MetaTagAnalyzer {
    pub fn new() -> Self {
        MetaTagAnalyzer
    }
}

impl Analyzer for MetaTagAnalyzer {
    fn kind(&self) -> AnalyzerKind {
        AnalyzerKind::MetaTags
    }

    fn analyze(&self, dataset: &Dataset, options: &AnalysisOptions) -> Result<AnalysisResult> {
        let start_time = Instant::now();
        debug!(action = "start", component = "meta_analyzer", site_count = dataset.total_sites(), "Counting meta tag patterns");

        let (patterns, total_found) = count_patterns(dataset, options, |_, site| {
            let mut observations = SiteObservations::new();
            for (name, contents) in &site.meta_tags {
                let key = name.trim().to_lowercase();
                if key.is_empty() || (options.semantic_filtering && is_descriptive_meta(&key)) {
                    continue;
                }
                observations.observe(key.clone());
                for content in contents {
                    observations.observe_with_example(key.clone(), content);
                    if PRODUCT_META.contains(&key.as_str()) {
                        if let Some(product) = product_name(content) {
                            observations.observe_with_example(format!("{}:{}", key, product), content);
                        }
                    }
                }
            }
            observations
        });

        let mut specific = MetaSpecific {
            product_patterns: patterns
                .keys()
                .filter(|k| PRODUCT_META.iter().any(|p| k.starts_with(&format!("{}:", p))))
                .count(),
            ..MetaSpecific::default()
        };
        let mut skipped = std::collections::BTreeSet::new();
        for site in dataset.sites.values() {
            if site.meta_tags.is_empty() {
                specific.sites_without_meta += 1;
            }
            if options.semantic_filtering {
                skipped.extend(
                    site.meta_tags
                        .keys()
                        .map(|name| name.trim().to_lowercase())
                        .filter(|name| is_descriptive_meta(name)),
                );
            }
        }
        specific.tags_skipped_by_filter = skipped.len();

        info!(
            action = "complete",
            component = "meta_analyzer",
            patterns_found = total_found,
            patterns_kept = patterns.len(),
            duration_ms = start_time.elapsed().as_millis(),
            "Meta tag analysis completed"
        );

        Ok(AnalysisResult::new(
            patterns,
            total_found,
            dataset.total_sites(),
            options,
            AnalyzerSpecific::MetaTags(specific),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Site;

    #[test]
    fn product_name_strips_versions_and_urls() {
        assert_eq!(product_name("WordPress 6.4.2").as_deref(), Some("wordpress"));
        assert_eq!(
            product_name("Drupal 10 (https://www.drupal.org)").as_deref(),
            Some("drupal")
        );
        assert_eq!(
            product_name("Joomla! - Open Source Content Management").as_deref(),
            Some("joomla")
        );
        assert_eq!(product_name("   "), None);
    }

    #[test]
    fn generator_produces_name_and_product_keys() {
        let dataset = Dataset::from_sites([
            Site::new("a.com").with_meta("generator", "WordPress 6.4.2"),
            Site::new("b.com").with_meta("Generator", "WordPress 6.5"),
        ]);
        let result = MetaTagAnalyzer::new()
            .analyze(&dataset, &AnalysisOptions::default())
            .unwrap();
        assert_eq!(result.patterns["generator"].site_count, 2);
        assert_eq!(result.patterns["generator:wordpress"].site_count, 2);
        assert_eq!(
            result.patterns["generator:wordpress"].examples,
            vec!["WordPress 6.4.2", "WordPress 6.5"]
        );
    }

    #[test]
    fn semantic_filtering_drops_descriptive_tags() {
        let dataset = Dataset::from_sites([Site::new("a.com")
            .with_meta("og:title", "Home")
            .with_meta("viewport", "width=device-width")
            .with_meta("generator", "Ghost 5.0")]);
        let options = AnalysisOptions {
            semantic_filtering: true,
            ..AnalysisOptions::default()
        };
        let result = MetaTagAnalyzer::new().analyze(&dataset, &options).unwrap();
        assert!(!result.patterns.contains_key("og:title"));
        assert!(!result.patterns.contains_key("viewport"));
        assert!(result.patterns.contains_key("generator:ghost"));
    }
}
