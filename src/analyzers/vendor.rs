//! Vendor and technology-stack inference against the static signature table.

use rayon::prelude::*;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use super::counter::{PatternCounter, SiteObservations};
use super::Analyzer;
use crate::dataset::{Dataset, Site};
use crate::error::Result;
use crate::options::AnalysisOptions;
use crate::signatures::{match_feature, SignatureTable, VendorCategory};
use crate::stats::{frequency, AnalysisResult, AnalyzerKind, AnalyzerSpecific};

/// Technology signatures below this confidence are not reported.
pub const MIN_SIGNATURE_CONFIDENCE: f64 = 0.6;
/// Stack confidence bonus per distinct vendor category matched.
const CATEGORY_BONUS: f64 = 0.1;

/// Namespaced, lowercased feature strings for one site.
pub fn site_features(site: &Site) -> BTreeSet<String> {
    let mut features = BTreeSet::new();
    for (name, values) in &site.headers {
        let name = name.trim().to_lowercase();
        if name.is_empty() {
            continue;
        }
        for value in values {
            let value = value.trim().to_lowercase();
            if !value.is_empty() {
                features.insert(format!("header:{}={}", name, value));
            }
        }
        features.insert(format!("header:{}", name));
    }
    for (name, contents) in &site.meta_tags {
        let name = name.trim().to_lowercase();
        if name.is_empty() {
            continue;
        }
        for content in contents {
            let content = content.trim().to_lowercase();
            if !content.is_empty() {
                features.insert(format!("meta:{}={}", name, content));
            }
        }
    }
    for src in &site.scripts {
        let src = src.trim().to_lowercase();
        if !src.is_empty() {
            features.insert(format!("script:{}", src));
        }
    }
    for technology in &site.technologies {
        let technology = technology.trim().to_lowercase();
        if !technology.is_empty() {
            features.insert(format!("tech:{}", technology));
        }
    }
    features
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TechnologyStack {
    pub cms: Option<String>,
    pub ecommerce: Option<String>,
    pub framework: Option<String>,
    pub hosting: Option<String>,
    pub cdn: Vec<String>,
    pub analytics: Vec<String>,
    pub security: Vec<String>,
    pub matched_features: usize,
    pub total_features: usize,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VendorStat {
    pub vendor: String,
    pub category: VendorCategory,
    pub site_count: usize,
    pub frequency: f64,
    /// Table patterns that matched on at least one site.
    pub matched_patterns: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectedSignature {
    pub name: String,
    pub description: String,
    pub required_features: Vec<String>,
    pub sites: BTreeSet<String>,
    pub site_count: usize,
    pub frequency: f64,
    pub confidence: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VendorSpecific {
    pub signature_table_version: String,
    pub vendor_stats: BTreeMap<String, VendorStat>,
    pub technology_stacks: BTreeMap<String, TechnologyStack>,
    pub technology_signatures: Vec<DetectedSignature>,
    pub category_distribution: BTreeMap<VendorCategory, usize>,
    /// Vendors each header name was attributed to on at least one site.
    pub header_vendors: BTreeMap<String, BTreeSet<String>>,
    pub sites_with_vendors: usize,
    pub vendor_coverage: f64,
}

#[derive(Debug)]
struct VendorHit {
    name: String,
    category: VendorCategory,
    table_index: usize,
    best_specificity: usize,
    features: Vec<String>,
    patterns: BTreeSet<String>,
}

#[derive(Debug)]
struct SiteVendors {
    features: BTreeSet<String>,
    hits: Vec<VendorHit>,
    matched_features: usize,
}

#[derive(Debug, Clone)]
pub struct VendorAnalyzer {
    table: Arc<SignatureTable>,
}

impl Default for VendorAnalyzer {
    fn default() -> Self {
        VendorAnalyzer::new(SignatureTable::builtin())
    }
}

impl VendorAnalyzer {
    pub fn new(table: Arc<SignatureTable>) -> Self {
        VendorAnalyzer { table }
    }

    pub fn table(&self) -> &SignatureTable {
        &self.table
    }

    fn detect_site(&self, site: &Site) -> SiteVendors {
        let features = site_features(site);
        let mut hits: Vec<VendorHit> = Vec::new();
        let mut matched_features = 0;

        for feature in &features {
            let Some(found) = self.table.lookup(feature) else {
                continue;
            };
            matched_features += 1;
            let table_index = self
                .table
                .vendors
                .iter()
                .position(|v| std::ptr::eq(v, found.vendor))
                .unwrap_or(usize::MAX);

            match hits.iter_mut().find(|hit| hit.table_index == table_index) {
                Some(hit) => {
                    hit.best_specificity = hit.best_specificity.max(found.specificity);
                    hit.features.push(feature.clone());
                    hit.patterns.insert(found.pattern.to_string());
                }
                None => hits.push(VendorHit {
                    name: found.vendor.name.clone(),
                    category: found.vendor.category,
                    table_index,
                    best_specificity: found.specificity,
                    features: vec![feature.clone()],
                    patterns: BTreeSet::from([found.pattern.to_string()]),
                }),
            }
        }

        hits.sort_by_key(|hit| hit.table_index);
        SiteVendors {
            features,
            hits,
            matched_features,
        }
    }

    fn build_stack(detected: &SiteVendors) -> TechnologyStack {
        let primary = |category: VendorCategory| {
            detected
                .hits
                .iter()
                .filter(|hit| hit.category == category)
                .fold(None::<&VendorHit>, |best, hit| match best {
                    Some(current)
                        if (current.best_specificity, current.features.len())
                            >= (hit.best_specificity, hit.features.len()) =>
                    {
                        Some(current)
                    }
                    _ => Some(hit),
                })
                .map(|hit| hit.name.clone())
        };
        let all = |category: VendorCategory| {
            let mut names: Vec<String> = detected
                .hits
                .iter()
                .filter(|hit| hit.category == category)
                .map(|hit| hit.name.clone())
                .collect();
            names.sort();
            names
        };

        let total_features = detected.features.len();
        let categories: BTreeSet<VendorCategory> =
            detected.hits.iter().map(|hit| hit.category).collect();
        let coverage = if total_features == 0 {
            0.0
        } else {
            detected.matched_features as f64 / total_features as f64
        };
        let confidence = if detected.hits.is_empty() {
            0.0
        } else {
            (coverage + CATEGORY_BONUS * categories.len() as f64).min(1.0)
        };

        TechnologyStack {
            cms: primary(VendorCategory::Cms),
            ecommerce: primary(VendorCategory::Ecommerce),
            framework: primary(VendorCategory::Framework),
            hosting: primary(VendorCategory::Hosting),
            cdn: all(VendorCategory::Cdn),
            analytics: all(VendorCategory::Analytics),
            security: all(VendorCategory::Security),
            matched_features: detected.matched_features,
            total_features,
            confidence,
        }
    }

    fn detect_signatures(
        &self,
        per_site: &[(&str, SiteVendors)],
        total_sites: usize,
    ) -> Vec<DetectedSignature> {
        let mut detected = Vec::new();
        for signature in &self.table.technology_signatures {
            let mut satisfying = BTreeSet::new();
            let mut partial = 0usize;
            for (site_id, site) in per_site {
                let present = signature
                    .required_features
                    .iter()
                    .filter(|required| {
                        site.features
                            .iter()
                            .any(|feature| match_feature(required, feature).is_some())
                    })
                    .count();
                if present > 0 {
                    partial += 1;
                }
                if present == signature.required_features.len() {
                    satisfying.insert(site_id.to_string());
                }
            }

            if satisfying.is_empty() {
                continue;
            }
            let confidence = signature.confidence * satisfying.len() as f64 / partial as f64;
            debug!(action = "evaluate", component = "technology_signature", signature = %signature.name, satisfying = satisfying.len(), partial, confidence, "Evaluated technology signature");
            if confidence < MIN_SIGNATURE_CONFIDENCE {
                continue;
            }

            detected.push(DetectedSignature {
                name: signature.name.clone(),
                description: signature.description.clone(),
                required_features: signature.required_features.clone(),
                site_count: satisfying.len(),
                frequency: frequency(satisfying.len(), total_sites),
                sites: satisfying,
                confidence,
            });
        }
        detected.sort_by(|a, b| {
            b.confidence
                .total_cmp(&a.confidence)
                .then_with(|| b.site_count.cmp(&a.site_count))
                .then_with(|| a.name.cmp(&b.name))
        });
        detected
    }
}

impl Analyzer for VendorAnalyzer {
    fn kind(&self) -> AnalyzerKind {
        AnalyzerKind::Vendor
    }

    fn analyze(&self, dataset: &Dataset, options: &AnalysisOptions) -> Result<AnalysisResult> {
        let start_time = Instant::now();
        let total_sites = dataset.total_sites();
        debug!(action = "start", component = "vendor_analyzer", site_count = total_sites, table_version = %self.table.version, "Detecting vendors");

        let per_site: Vec<(&str, SiteVendors)> = dataset
            .ordered_sites()
            .into_par_iter()
            .map(|(id, site)| (id, self.detect_site(site)))
            .collect();

        let mut counter = PatternCounter::new(options);
        let mut specific = VendorSpecific {
            signature_table_version: self.table.version.clone(),
            ..VendorSpecific::default()
        };
        let mut vendor_sites: BTreeMap<String, (VendorCategory, BTreeSet<String>, BTreeSet<String>)> =
            BTreeMap::new();

        for (site_id, detected) in &per_site {
            let mut observations = SiteObservations::new();
            let mut categories = BTreeSet::new();
            for hit in &detected.hits {
                for feature in &hit.features {
                    observations.observe_with_example(hit.name.clone(), feature);
                    if let Some(body) = feature.strip_prefix("header:") {
                        let header = body.split('=').next().unwrap_or(body);
                        specific
                            .header_vendors
                            .entry(header.to_string())
                            .or_default()
                            .insert(hit.name.clone());
                    }
                }
                categories.insert(hit.category);
                let entry = vendor_sites
                    .entry(hit.name.clone())
                    .or_insert_with(|| (hit.category, BTreeSet::new(), BTreeSet::new()));
                entry.1.insert(site_id.to_string());
                entry.2.extend(hit.patterns.iter().cloned());
            }
            for category in categories {
                *specific.category_distribution.entry(category).or_insert(0) += 1;
            }
            if !detected.hits.is_empty() {
                specific.sites_with_vendors += 1;
            }
            specific
                .technology_stacks
                .insert(site_id.to_string(), Self::build_stack(detected));
            counter.record_site(site_id, observations);
        }

        specific.vendor_stats = vendor_sites
            .into_iter()
            .map(|(vendor, (category, sites, matched_patterns))| {
                let stat = VendorStat {
                    vendor: vendor.clone(),
                    category,
                    site_count: sites.len(),
                    frequency: frequency(sites.len(), total_sites),
                    matched_patterns,
                };
                (vendor, stat)
            })
            .collect();
        specific.vendor_coverage = frequency(specific.sites_with_vendors, total_sites);
        specific.technology_signatures = self.detect_signatures(&per_site, total_sites);

        let (patterns, total_found) = counter.finish(total_sites, options);

        info!(
            action = "complete",
            component = "vendor_analyzer",
            vendors_found = total_found,
            vendors_kept = patterns.len(),
            signatures = specific.technology_signatures.len(),
            vendor_coverage = specific.vendor_coverage,
            duration_ms = start_time.elapsed().as_millis(),
            "Vendor analysis completed"
        );

        Ok(AnalysisResult::new(
            patterns,
            total_found,
            total_sites,
            options,
            AnalyzerSpecific::Vendor(Box::new(specific)),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vendor_payload(result: &AnalysisResult) -> &VendorSpecific {
        match &result.analyzer_specific {
            AnalyzerSpecific::Vendor(specific) => specific,
            other => panic!("unexpected payload {other:?}"),
        }
    }

    fn wordpress_on_cloudflare(url: &str) -> Site {
        Site::new(url)
            .with_header("cf-ray", "8a1b2c3d4e5f-AMS")
            .with_header("server", "cloudflare")
            .with_script("https://example.org/wp-content/themes/x/app.js")
    }

    #[test]
    fn features_are_namespaced_and_lowercased() {
        let site = Site::new("a.com")
            .with_header("Server", "NGINX")
            .with_meta("Generator", "WordPress 6.4")
            .with_script("/wp-includes/js/jquery.js")
            .with_technology("PHP");
        let features = site_features(&site);
        assert!(features.contains("header:server"));
        assert!(features.contains("header:server=nginx"));
        assert!(features.contains("meta:generator=wordpress 6.4"));
        assert!(features.contains("script:/wp-includes/js/jquery.js"));
        assert!(features.contains("tech:php"));
    }

    #[test]
    fn stack_picks_primary_and_lists() {
        let dataset = Dataset::from_sites([wordpress_on_cloudflare("a.com")
            .with_header("x-powered-by", "PHP/8.2")
            .with_script("https://www.googletagmanager.com/gtm.js?id=GTM-1")]);
        let result = VendorAnalyzer::default()
            .analyze(&dataset, &AnalysisOptions::default())
            .unwrap();
        let specific = vendor_payload(&result);
        let stack = &specific.technology_stacks["a.com"];
        assert_eq!(stack.cms.as_deref(), Some("WordPress"));
        assert_eq!(stack.framework.as_deref(), Some("PHP"));
        assert_eq!(stack.cdn, vec!["Cloudflare"]);
        assert_eq!(stack.analytics, vec!["Google Tag Manager"]);
        assert!(stack.confidence > 0.0 && stack.confidence <= 1.0);
        assert!(result.patterns.contains_key("Cloudflare"));
        assert!(specific.header_vendors["cf-ray"].contains("Cloudflare"));
    }

    #[test]
    fn stack_confidence_is_capped() {
        let site = Site::new("a.com")
            .with_header("cf-ray", "1")
            .with_header("x-shopify-stage", "production")
            .with_header("x-vercel-id", "abc")
            .with_header("x-sucuri-id", "1")
            .with_script("https://cdn.segment.com/analytics.js")
            .with_header("x-nextjs-cache", "HIT");
        let dataset = Dataset::from_sites([site]);
        let result = VendorAnalyzer::default()
            .analyze(&dataset, &AnalysisOptions::default())
            .unwrap();
        let stack = &vendor_payload(&result).technology_stacks["a.com"];
        assert_eq!(stack.confidence, 1.0);
    }

    #[test]
    fn signature_sites_have_every_required_feature() {
        let dataset = Dataset::from_sites([
            wordpress_on_cloudflare("a.com"),
            wordpress_on_cloudflare("b.com"),
            wordpress_on_cloudflare("c.com"),
            Site::new("d.com").with_header("cf-ray", "x"),
        ]);
        let result = VendorAnalyzer::default()
            .analyze(&dataset, &AnalysisOptions::default())
            .unwrap();
        let specific = vendor_payload(&result);
        let signature = specific
            .technology_signatures
            .iter()
            .find(|s| s.name == "WordPress on Cloudflare")
            .expect("signature detected");

        assert!(signature.confidence >= MIN_SIGNATURE_CONFIDENCE);
        assert_eq!(signature.site_count, signature.sites.len());
        assert!(!signature.sites.contains("d.com"));
        for site_id in &signature.sites {
            let features = site_features(&dataset.sites[site_id]);
            for required in &signature.required_features {
                assert!(
                    features.iter().any(|f| match_feature(required, f).is_some()),
                    "{site_id} lacks {required}"
                );
            }
        }
    }

    #[test]
    fn weak_signatures_are_not_reported() {
        // One complete site out of four partial ones: 0.9 * 1/4 < 0.6.
        let dataset = Dataset::from_sites([
            wordpress_on_cloudflare("a.com"),
            Site::new("b.com").with_header("cf-ray", "x"),
            Site::new("c.com").with_header("cf-ray", "y"),
            Site::new("d.com").with_header("cf-ray", "z"),
        ]);
        let result = VendorAnalyzer::default()
            .analyze(&dataset, &AnalysisOptions::default())
            .unwrap();
        assert!(vendor_payload(&result)
            .technology_signatures
            .iter()
            .all(|s| s.name != "WordPress on Cloudflare"));
    }

    #[test]
    fn empty_dataset_yields_empty_payload() {
        let result = VendorAnalyzer::default()
            .analyze(&Dataset::new(), &AnalysisOptions::default())
            .unwrap();
        let specific = vendor_payload(&result);
        assert!(result.patterns.is_empty());
        assert_eq!(specific.vendor_coverage, 0.0);
        assert!(specific.technology_signatures.is_empty());
    }
}
