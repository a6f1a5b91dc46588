//! Property-based checks of the frequency invariants across a full run.

use proptest::prelude::*;
use siteprint::{Aggregator, AnalysisOptions, Dataset, InMemorySource, Site};

const PLATFORMS: &[Option<&str>] = &[None, Some("WordPress"), Some("Drupal"), Some("Ghost")];
const HEADERS: &[&str] = &["server", "x-pingback", "cf-ray", "x-drupal-cache", "x-powered-by", "via"];
const VALUES: &[&str] = &["a", "b", "c"];

fn dataset_strategy() -> impl Strategy<Value = Dataset> {
    prop::collection::vec(
        (
            0usize..PLATFORMS.len(),
            prop::collection::vec((0usize..HEADERS.len(), 0usize..VALUES.len()), 0..6),
            prop::collection::vec(0usize..3, 0..3),
        ),
        0..24,
    )
    .prop_map(|rows| {
        Dataset::from_sites(rows.into_iter().enumerate().map(|(i, (platform, headers, scripts))| {
            let mut site = Site::new(format!("site{}.com", i));
            if let Some(cms) = PLATFORMS[platform] {
                site = site.with_cms(cms);
            }
            for (h, v) in headers {
                site = site.with_header(HEADERS[h], VALUES[v]);
            }
            for s in scripts {
                site = site.with_script(&format!("https://cdn{}.example.net/app.js", s));
            }
            site
        }))
    })
}

fn options_strategy() -> impl Strategy<Value = AnalysisOptions> {
    (1u32..4, any::<bool>(), 0usize..4, any::<bool>(), any::<bool>()).prop_map(
        |(min_occurrences, include_examples, max_examples, semantic_filtering, focus)| {
            AnalysisOptions {
                min_occurrences,
                include_examples,
                max_examples,
                semantic_filtering,
                focus_platform_discrimination: focus,
            }
        },
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn every_pattern_satisfies_frequency_invariants(
        dataset in dataset_strategy(),
        options in options_strategy(),
    ) {
        let total = dataset.total_sites();
        let results = Aggregator::new(InMemorySource::new(dataset)).analyze(&options).unwrap();

        prop_assert_eq!(results.summary.total_sites_analyzed, total);
        for result in results.results() {
            prop_assert_eq!(result.total_sites, total);
            prop_assert_eq!(&result.metadata.options, &options);
            for pattern in result.patterns.values() {
                prop_assert_eq!(pattern.site_count, pattern.sites.len());
                prop_assert!(pattern.frequency.is_finite());
                prop_assert!((0.0..=1.0).contains(&pattern.frequency));
                prop_assert!(pattern.examples.len() <= options.example_limit());
                if total == 0 {
                    prop_assert_eq!(pattern.frequency, 0.0);
                } else {
                    let expected = pattern.site_count as f64 / total as f64;
                    prop_assert!((pattern.frequency - expected).abs() < 1e-12);
                }
            }
        }
    }

    #[test]
    fn min_occurrences_filter_is_exact(dataset in dataset_strategy(), min in 1u32..5) {
        let loose = AnalysisOptions::default();
        let strict = AnalysisOptions { min_occurrences: min, ..AnalysisOptions::default() };
        let aggregator = Aggregator::new(InMemorySource::new(dataset));
        let all = aggregator.analyze(&loose).unwrap();
        let filtered = aggregator.analyze(&strict).unwrap();

        for (key, pattern) in &all.headers.patterns {
            let kept = filtered.headers.patterns.contains_key(key);
            prop_assert_eq!(kept, pattern.site_count >= min as usize);
        }
    }

    #[test]
    fn repeated_runs_are_identical(dataset in dataset_strategy(), options in options_strategy()) {
        let aggregator = Aggregator::new(InMemorySource::new(dataset));
        let first = aggregator.analyze(&options).unwrap();
        let second = aggregator.analyze(&options).unwrap();
        for (a, b) in first.results().iter().zip(second.results()) {
            prop_assert_eq!(&a.patterns, &b.patterns);
            prop_assert_eq!(&a.analyzer_specific, &b.analyzer_specific);
        }
        prop_assert_eq!(first.summary, second.summary);
    }
}
