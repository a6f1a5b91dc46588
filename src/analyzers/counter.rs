use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};

use crate::dataset::{Dataset, Site};
use crate::options::AnalysisOptions;
use crate::stats::Pattern;

/// Distinct pattern keys one site exhibits, each with the example values
/// seen for it on that site (in encounter order, deduplicated).
#[derive(Debug, Default)]
pub struct SiteObservations {
    keys: BTreeMap<String, Vec<String>>,
}

impl SiteObservations {
    pub fn new() -> Self {
        SiteObservations::default()
    }

    /// Record a key without an example value.
    pub fn observe(&mut self, key: String) {
        self.keys.entry(key).or_default();
    }

    pub fn observe_with_example(&mut self, key: String, example: &str) {
        let examples = self.keys.entry(key).or_default();
        let example = example.trim();
        if !example.is_empty() && !examples.iter().any(|e| e == example) {
            examples.push(example.to_string());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }
}

#[derive(Debug, Default)]
struct CounterEntry {
    sites: BTreeSet<String>,
    examples: Vec<String>,
}

/// Accumulates site sets per key. Each site increments a key at most once
/// no matter how many values it carried for it.
#[derive(Debug)]
pub struct PatternCounter {
    example_limit: usize,
    entries: BTreeMap<String, CounterEntry>,
}

impl PatternCounter {
    pub fn new(options: &AnalysisOptions) -> Self {
        PatternCounter {
            example_limit: options.example_limit(),
            entries: BTreeMap::new(),
        }
    }

    pub fn record_site(&mut self, site_id: &str, observations: SiteObservations) {
        for (key, values) in observations.keys {
            let entry = self.entries.entry(key).or_default();
            entry.sites.insert(site_id.to_string());
            for value in values {
                if entry.examples.len() >= self.example_limit {
                    break;
                }
                if !entry.examples.contains(&value) {
                    entry.examples.push(value);
                }
            }
        }
    }

    /// Apply the `min_occurrences` filter. Returns the surviving patterns and
    /// the number of distinct keys seen before filtering.
    pub fn finish(
        self,
        total_sites: usize,
        options: &AnalysisOptions,
    ) -> (BTreeMap<String, Pattern>, usize) {
        let total_found = self.entries.len();
        let patterns = self
            .entries
            .into_iter()
            .filter(|(_, entry)| options.passes_threshold(entry.sites.len()))
            .map(|(key, entry)| {
                let pattern = Pattern::new(key.clone(), entry.sites, entry.examples, total_sites);
                (key, pattern)
            })
            .collect();
        (patterns, total_found)
    }
}

/// Extract observations for every site on the rayon pool, then merge them
/// sequentially in dataset order.
pub fn count_patterns<F>(
    dataset: &Dataset,
    options: &AnalysisOptions,
    extract: F,
) -> (BTreeMap<String, Pattern>, usize)
where
    F: Fn(&str, &Site) -> SiteObservations + Sync,
{
    let per_site: Vec<(&str, SiteObservations)> = dataset
        .ordered_sites()
        .into_par_iter()
        .map(|(id, site)| (id, extract(id, site)))
        .collect();

    let mut counter = PatternCounter::new(options);
    for (id, observations) in per_site {
        counter.record_site(id, observations);
    }
    counter.finish(dataset.total_sites(), options)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observations(pairs: &[(&str, &str)]) -> SiteObservations {
        let mut obs = SiteObservations::new();
        for (key, value) in pairs {
            obs.observe_with_example(key.to_string(), value);
        }
        obs
    }

    #[test]
    fn multiple_values_count_once_per_site() {
        let options = AnalysisOptions::default();
        let mut counter = PatternCounter::new(&options);
        counter.record_site(
            "a.com",
            observations(&[("x-cache", "HIT"), ("x-cache", "MISS"), ("x-cache", "STALE")]),
        );
        let (patterns, total) = counter.finish(1, &options);
        assert_eq!(total, 1);
        assert_eq!(patterns["x-cache"].site_count, 1);
        assert_eq!(patterns["x-cache"].examples, vec!["HIT", "MISS", "STALE"]);
    }

    #[test]
    fn examples_are_capped_and_deduplicated() {
        let options = AnalysisOptions {
            max_examples: 2,
            ..AnalysisOptions::default()
        };
        let mut counter = PatternCounter::new(&options);
        counter.record_site("a.com", observations(&[("server", "nginx")]));
        counter.record_site("b.com", observations(&[("server", "nginx")]));
        counter.record_site("c.com", observations(&[("server", "apache")]));
        counter.record_site("d.com", observations(&[("server", "caddy")]));
        let (patterns, _) = counter.finish(4, &options);
        assert_eq!(patterns["server"].examples, vec!["nginx", "apache"]);
        assert_eq!(patterns["server"].site_count, 4);
    }

    #[test]
    fn disabled_examples_stay_empty() {
        let options = AnalysisOptions {
            include_examples: false,
            ..AnalysisOptions::default()
        };
        let mut counter = PatternCounter::new(&options);
        counter.record_site("a.com", observations(&[("server", "nginx")]));
        let (patterns, _) = counter.finish(1, &options);
        assert!(patterns["server"].examples.is_empty());
    }

    #[test]
    fn threshold_filter_reports_pre_filter_total() {
        let options = AnalysisOptions {
            min_occurrences: 2,
            ..AnalysisOptions::default()
        };
        let mut counter = PatternCounter::new(&options);
        counter.record_site("a.com", observations(&[("rare", "1"), ("common", "1")]));
        counter.record_site("b.com", observations(&[("common", "2")]));
        let (patterns, total) = counter.finish(2, &options);
        assert_eq!(total, 2);
        assert_eq!(patterns.len(), 1);
        assert!(patterns.contains_key("common"));
    }
}
