//! Static vendor signature table.
//!
//! Patterns are namespaced feature strings (`header:cf-ray`,
//! `header:server=nginx`, `meta:generator=wordpress`, `script:/wp-content/`,
//! `tech:shopify`). A site feature matches a pattern when both share the
//! namespace and the feature body equals, starts with, or contains the
//! pattern body. The table is parsed once and never mutated.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tracing::{info, warn};

use crate::error::{AnalysisError, Result};

// Include default signatures at compile time
const DEFAULT_SIGNATURES: &str = include_str!("../data/vendor_signatures.json");

/// File name looked up in the working directory before the embedded table.
pub const SIGNATURE_FILE_NAME: &str = "vendor_signatures.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VendorCategory {
    Cdn,
    Cms,
    Ecommerce,
    Analytics,
    Framework,
    Security,
    Hosting,
}

impl VendorCategory {
    /// Categories whose vendors name the platform a site is built on.
    pub fn is_platform(self) -> bool {
        matches!(self, VendorCategory::Cms | VendorCategory::Ecommerce)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VendorSignature {
    pub name: String,
    pub category: VendorCategory,
    pub patterns: Vec<String>,
}

/// A named combination of features that must co-occur on one site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TechnologySignature {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub required_features: Vec<String>,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureTable {
    pub version: String,
    pub vendors: Vec<VendorSignature>,
    #[serde(default)]
    pub technology_signatures: Vec<TechnologySignature>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum MatchKind {
    Substring,
    Prefix,
    Exact,
}

#[derive(Debug, Clone, Copy)]
pub struct VendorMatch<'a> {
    pub vendor: &'a VendorSignature,
    pub pattern: &'a str,
    pub kind: MatchKind,
    /// Length of the matched pattern body.
    pub specificity: usize,
}

impl VendorMatch<'_> {
    fn beats(&self, other: &VendorMatch<'_>) -> bool {
        (self.specificity, self.kind) > (other.specificity, other.kind)
    }
}

/// Match one namespaced pattern against one namespaced feature.
pub fn match_feature(pattern: &str, feature: &str) -> Option<MatchKind> {
    let (pattern_kind, pattern_body) = pattern.split_once(':')?;
    let (feature_kind, feature_body) = feature.split_once(':')?;
    if pattern_kind != feature_kind || pattern_body.is_empty() {
        return None;
    }

    if feature_body == pattern_body {
        Some(MatchKind::Exact)
    } else if feature_body.starts_with(pattern_body) {
        Some(MatchKind::Prefix)
    } else if feature_body.contains(pattern_body) {
        Some(MatchKind::Substring)
    } else {
        None
    }
}

fn pattern_body_len(pattern: &str) -> usize {
    pattern
        .split_once(':')
        .map(|(_, body)| body.len())
        .unwrap_or(0)
}

impl SignatureTable {
    pub fn empty() -> Self {
        SignatureTable {
            version: "empty".to_string(),
            vendors: Vec::new(),
            technology_signatures: Vec::new(),
        }
    }

    /// The embedded table, parsed on first use.
    pub fn builtin() -> Arc<SignatureTable> {
        static BUILTIN: OnceLock<Arc<SignatureTable>> = OnceLock::new();
        BUILTIN
            .get_or_init(|| match SignatureTable::parse(DEFAULT_SIGNATURES) {
                Ok(table) => Arc::new(table),
                Err(e) => {
                    warn!(action = "parse", component = "embedded_signatures", error = %e, "Invalid embedded signature table");
                    Arc::new(SignatureTable::empty())
                }
            })
            .clone()
    }

    /// Parse and normalize a JSON signature table.
    ///
    /// Pattern strings are lowercased. Vendors without usable patterns and
    /// technology signatures without required features or with an
    /// out-of-range confidence are dropped with a warning.
    pub fn parse(content: &str) -> Result<SignatureTable> {
        let mut table: SignatureTable = serde_json::from_str(content)?;

        for vendor in &mut table.vendors {
            vendor.patterns = vendor
                .patterns
                .iter()
                .map(|p| p.trim().to_lowercase())
                .filter(|p| p.contains(':') && pattern_body_len(p) > 0)
                .collect();
        }
        table.vendors.retain(|vendor| {
            let keep = !vendor.patterns.is_empty();
            if !keep {
                warn!(action = "parse", component = "vendor_signature", vendor = %vendor.name, "Vendor has no usable patterns");
            }
            keep
        });

        for signature in &mut table.technology_signatures {
            signature.required_features = signature
                .required_features
                .iter()
                .map(|p| p.trim().to_lowercase())
                .collect();
        }
        table.technology_signatures.retain(|signature| {
            let keep = !signature.required_features.is_empty()
                && signature.required_features.iter().all(|p| pattern_body_len(p) > 0)
                && (0.0..=1.0).contains(&signature.confidence);
            if !keep {
                warn!(action = "parse", component = "technology_signature", signature = %signature.name, "Dropping invalid technology signature");
            }
            keep
        });

        Ok(table)
    }

    /// Best vendor match for a feature: the longest pattern wins, then the
    /// stronger match kind, then table order.
    pub fn lookup(&self, feature: &str) -> Option<VendorMatch<'_>> {
        let mut best: Option<VendorMatch<'_>> = None;
        for vendor in &self.vendors {
            for pattern in &vendor.patterns {
                let Some(kind) = match_feature(pattern, feature) else {
                    continue;
                };
                let candidate = VendorMatch {
                    vendor,
                    pattern: pattern.as_str(),
                    kind,
                    specificity: pattern_body_len(pattern),
                };
                let replace = best
                    .as_ref()
                    .map_or(true, |current| candidate.beats(current));
                if replace {
                    best = Some(candidate);
                }
            }
        }
        best
    }

    /// Vendor attributed to a bare header name.
    pub fn vendor_for_header(&self, header: &str) -> Option<&VendorSignature> {
        self.lookup(&format!("header:{}", header.to_lowercase()))
            .map(|m| m.vendor)
    }
}

fn read_table(path: &Path) -> Result<SignatureTable> {
    let content = fs::read_to_string(path).map_err(|source| AnalysisError::SignatureFile {
        path: path.to_path_buf(),
        source,
    })?;
    SignatureTable::parse(&content)
}

/// Load the signature table: an explicit file, else `vendor_signatures.json`
/// in the working directory, else the embedded defaults.
pub fn load_signature_table(signature_file_path: Option<&Path>) -> Result<Arc<SignatureTable>> {
    let start_time = Instant::now();
    info!(
        action = "start",
        component = "signature_loading",
        "Starting vendor signature loading"
    );

    let table = if let Some(path) = signature_file_path {
        info!(action = "load", component = "signature_file", file_path = ?path, "Loading signatures from specified file");
        if !path.exists() {
            return Err(AnalysisError::SignatureFile {
                path: path.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "signature file not found"),
            });
        }
        Arc::new(read_table(path)?)
    } else {
        let default_file = Path::new(SIGNATURE_FILE_NAME);
        if default_file.exists() {
            info!(action = "load", component = "default_signature_file", file_path = ?default_file, "Loading signatures from default file");
            match read_table(default_file) {
                Ok(table) => Arc::new(table),
                Err(e) => {
                    warn!(action = "parse", component = "default_signature_file", error = %e, "Falling back to embedded signatures");
                    SignatureTable::builtin()
                }
            }
        } else {
            info!(
                action = "load",
                component = "embedded_signatures",
                "Using embedded default signatures"
            );
            SignatureTable::builtin()
        }
    };

    info!(
        action = "complete",
        component = "signature_loading",
        version = %table.version,
        vendor_count = table.vendors.len(),
        signature_count = table.technology_signatures.len(),
        duration_ms = start_time.elapsed().as_millis(),
        "Loaded vendor signatures"
    );
    Ok(table)
}

/// Write the embedded defaults to `vendor_signatures.json` inside `dir`.
pub fn init_default_signatures(dir: &Path) -> Result<PathBuf> {
    let target = dir.join(SIGNATURE_FILE_NAME);

    if target.exists() {
        return Err(AnalysisError::SignatureFile {
            path: target,
            source: std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "remove it first if you want to reinitialize",
            ),
        });
    }

    fs::write(&target, DEFAULT_SIGNATURES).map_err(|source| AnalysisError::SignatureFile {
        path: target.clone(),
        source,
    })?;
    Ok(target)
}
