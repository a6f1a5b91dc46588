use siteprint::analyzers::cooccurrence::CooccurrenceAnalyzer;
use siteprint::analyzers::semantic::{SemanticAnalyzer, SemanticSource};
use siteprint::analyzers::{Analyzer, HeaderAnalyzer};
use siteprint::dataset::ClassificationMetadata;
use siteprint::stats::AnalyzerSpecific;
use siteprint::validation::{SampleAdequacy, TOTAL_STAGES};
use siteprint::{
    Aggregator, AnalysisError, AnalysisOptions, AnalyzerKind, Dataset, InMemorySource, Site,
};

fn two_platforms(per_platform: usize) -> Vec<Site> {
    let mut sites = Vec::new();
    for i in 0..per_platform {
        sites.push(
            Site::new(format!("wp{}.com", i))
                .with_cms("WordPress")
                .with_header("server", "nginx")
                .with_header("x-pingback", "/xmlrpc.php"),
        );
        sites.push(
            Site::new(format!("drupal{}.org", i))
                .with_cms("Drupal")
                .with_header("server", "apache")
                .with_header("x-drupal-cache", "HIT"),
        );
    }
    sites
}

fn run(dataset: Dataset, options: &AnalysisOptions) -> siteprint::AggregatedResults {
    Aggregator::new(InMemorySource::new(dataset))
        .analyze(options)
        .unwrap()
}

#[test]
fn min_occurrences_keeps_only_common_header() {
    let dataset = Dataset::from_sites([
        Site::new("s1.com").with_header("x-a", "1"),
        Site::new("s2.com").with_header("x-a", "1"),
        Site::new("s3.com").with_header("x-b", "1"),
        Site::new("s4.com").with_header("x-b", "2"),
        Site::new("s5.com").with_header("x-b", "3"),
    ]);
    let options = AnalysisOptions {
        min_occurrences: 3,
        ..AnalysisOptions::default()
    };
    let result = HeaderAnalyzer::new().analyze(&dataset, &options).unwrap();

    assert_eq!(result.patterns.len(), 1);
    let pattern = &result.patterns["x-b"];
    assert_eq!(pattern.site_count, 3);
    assert!((pattern.frequency - 0.6).abs() < 1e-12);
}

#[test]
fn several_values_on_one_site_count_once() {
    let dataset = Dataset::from_sites([Site::new("a.com")
        .with_header("set-cookie", "a=1")
        .with_header("set-cookie", "b=2")
        .with_header("set-cookie", "c=3")]);
    let result = HeaderAnalyzer::new()
        .analyze(&dataset, &AnalysisOptions::default())
        .unwrap();
    let pattern = &result.patterns["set-cookie"];
    assert_eq!(pattern.site_count, 1);
    assert_eq!(pattern.frequency, 1.0);
    assert_eq!(pattern.examples.len(), 3);
}

#[test]
fn shared_header_across_known_and_unknown_platforms() {
    let dataset = Dataset::from_sites([
        Site::new("site1").with_cms("A").with_header("server", "nginx"),
        Site::new("site2").with_cms("B").with_header("server", "nginx"),
        Site::new("site3").with_header("server", "nginx"),
    ]);
    let results = run(dataset, &AnalysisOptions::default());
    let server = &results.headers.patterns["server"];
    assert_eq!(server.site_count, 3);
    assert_eq!(server.frequency, 1.0);
    let sites: Vec<&str> = server.sites.iter().map(String::as_str).collect();
    assert_eq!(sites, vec!["site1", "site2", "site3"]);
}

#[test]
fn single_site_pattern_is_never_validated() {
    let mut sites = two_platforms(50);
    sites[0] = sites[0].clone().with_header("x-rare", "1");
    let results = run(Dataset::from_sites(sites), &AnalysisOptions::default());
    assert_eq!(results.headers.patterns["x-rare"].site_count, 1);

    let AnalyzerSpecific::Validation(validation) = &results.validation.analyzer_specific else {
        panic!("validation payload expected");
    };
    assert!(!validation.validated_patterns.contains_key("x-rare"));
    assert!(!results.validation.patterns.contains_key("x-rare"));
    assert!(validation.statistical_metrics.sample_size_adequacy.inadequate >= 1);
    assert!(validation.validated_patterns.contains_key("x-pingback"));
    assert!(validation
        .validated_patterns
        .values()
        .all(|p| p.adequacy == SampleAdequacy::Adequate));
    assert_eq!(validation.stage_results.len(), TOTAL_STAGES);
    assert_eq!(validation.validation_summary.total_stages, TOTAL_STAGES);
}

#[test]
fn exclusive_header_outscores_infrastructure_header() {
    let mut sites = Vec::new();
    for i in 0..3 {
        sites.push(
            Site::new(format!("a{}.com", i))
                .with_cms("A")
                .with_header("x-only-a", "1")
                .with_header("server", "nginx"),
        );
        sites.push(Site::new(format!("b{}.com", i)).with_cms("B").with_header("server", "nginx"));
    }
    let options = AnalysisOptions {
        focus_platform_discrimination: true,
        ..AnalysisOptions::default()
    };
    let results = run(Dataset::from_sites(sites.clone()), &options);
    let summary = results.summary.platform_discrimination.unwrap();

    assert_eq!(summary.platforms, vec!["A", "B"]);
    assert!(summary.infrastructure_noise_filtered >= 1);
    assert_eq!(summary.top_discriminatory_patterns[0].pattern, "header:x-only-a");

    let dataset = Dataset::from_sites(sites);
    let headers = HeaderAnalyzer::new()
        .analyze(&dataset, &AnalysisOptions::default())
        .unwrap();
    let scored = siteprint::discrimination::score_patterns(&dataset, &[&headers]);
    let score = |key: &str| {
        scored
            .iter()
            .find(|p| p.pattern == key)
            .map(|p| (p.discriminative_score, p.noise))
            .unwrap()
    };
    let (exclusive, exclusive_noise) = score("header:x-only-a");
    let (shared, shared_noise) = score("header:server");
    assert!(exclusive > shared);
    assert!(!exclusive_noise);
    assert!(shared_noise);
}

#[test]
fn empty_dataset_is_all_zeroes() {
    let options = AnalysisOptions {
        focus_platform_discrimination: true,
        ..AnalysisOptions::default()
    };
    let results = run(Dataset::new(), &options);
    for result in results.results() {
        assert!(result.patterns.is_empty());
        assert_eq!(result.total_sites, 0);
    }
    assert_eq!(results.summary.total_sites_analyzed, 0);
    assert_eq!(results.summary.total_patterns_found, 0);
    let discrimination = results.summary.platform_discrimination.unwrap();
    assert_eq!(discrimination.total_patterns_analyzed, 0);
    assert_eq!(discrimination.noise_reduction_percentage, 0.0);
    assert_eq!(discrimination.average_discrimination_score, 0.0);
}

#[test]
fn results_agree_on_totals_and_options() {
    let options = AnalysisOptions {
        max_examples: 2,
        semantic_filtering: true,
        ..AnalysisOptions::default()
    };
    let results = run(Dataset::from_sites(two_platforms(10)), &options);
    for result in results.results() {
        assert_eq!(result.total_sites, 20);
        assert_eq!(result.metadata.options, options);
        assert_eq!(result.analyzer_specific.kind(), result.metadata.analyzer);
    }
    assert_eq!(
        results.summary.total_patterns_found,
        results.results().iter().map(|r| r.patterns.len()).sum::<usize>()
    );
}

#[test]
fn composite_signature_needs_every_feature() {
    let wordpress_on_cloudflare = |url: &str| {
        Site::new(url)
            .with_header("cf-ray", "8a1b2c3d4e5f-AMS")
            .with_script("https://example.org/wp-content/themes/x/app.js")
    };
    let dataset = Dataset::from_sites([
        wordpress_on_cloudflare("a.com"),
        wordpress_on_cloudflare("b.com"),
        Site::new("c.com").with_header("cf-ray", "x"),
    ]);
    let results = run(dataset, &AnalysisOptions::default());
    let AnalyzerSpecific::Vendor(vendor) = &results.vendor.analyzer_specific else {
        panic!("vendor payload expected");
    };
    let signature = vendor
        .technology_signatures
        .iter()
        .find(|s| s.name == "WordPress on Cloudflare")
        .unwrap();
    assert_eq!(signature.site_count, 2);
    assert!(!signature.sites.contains("c.com"));
}

#[test]
fn cooccurrence_without_vendor_data_fails_loudly() {
    let err = CooccurrenceAnalyzer::default()
        .analyze(&Dataset::from_sites(two_platforms(2)), &AnalysisOptions::default())
        .unwrap_err();
    assert!(matches!(
        err,
        AnalysisError::MissingDependency {
            analyzer: "cooccurrence",
            ..
        }
    ));
}

#[test]
fn semantic_source_follows_available_inputs() {
    let results = run(Dataset::from_sites(two_platforms(40)), &AnalysisOptions::default());
    let AnalyzerSpecific::Semantic(semantic) = &results.semantic.analyzer_specific else {
        panic!("semantic payload expected");
    };
    assert_eq!(semantic.source, SemanticSource::Validated);

    let mut classification = ClassificationMetadata::default();
    classification
        .header_categories
        .insert("x-pingback".to_string(), "cms".to_string());
    let classified = Dataset::from_sites(two_platforms(2)).with_classification(classification);
    let analyzer = SemanticAnalyzer::default();
    assert_eq!(analyzer.source_for(&classified), SemanticSource::RawClassification);
    assert_eq!(
        analyzer.source_for(&Dataset::from_sites(two_platforms(2))),
        SemanticSource::RuleBased
    );
}

#[test]
fn summary_lists_top_patterns_per_analyzer() {
    let results = Aggregator::new(InMemorySource::new(Dataset::from_sites(two_platforms(5))))
        .with_top_patterns(2)
        .analyze(&AnalysisOptions::default())
        .unwrap();
    assert_eq!(results.summary.top_patterns.len(), 8);
    let headers = &results.summary.top_patterns[&AnalyzerKind::Headers];
    assert_eq!(headers.len(), 2);
    assert_eq!(headers[0].key, "server");
}
