use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use std::time::Instant;
use tracing::info;

use crate::aggregator::{Aggregator, DEFAULT_TOP_PATTERNS};
use crate::signatures::load_signature_table;
use crate::snapshot::SnapshotLoader;
use crate::stats::{AggregatedResults, AnalyzerSpecific};
use crate::utils::{format_number, format_percent};
use crate::Args;

/// Load the snapshot, run every analyzer and write the JSON report if asked.
pub fn analyze_snapshot(args: &Args) -> Result<AggregatedResults> {
    let total_start_time = Instant::now();
    let snapshot = args
        .snapshot
        .as_deref()
        .context("no snapshot path given")?;
    info!(action = "start", component = "cli", snapshot = ?snapshot, "Starting snapshot analysis");

    let table = load_signature_table(args.signatures.as_deref())?;
    let aggregator = Aggregator::new(SnapshotLoader::new(snapshot))
        .with_signature_table(table)
        .with_top_patterns(args.top.unwrap_or(DEFAULT_TOP_PATTERNS));
    let results = aggregator
        .analyze(&args.analysis_options())
        .with_context(|| format!("Failed to analyze {}", snapshot.display()))?;

    if let Some(output) = &args.output {
        write_report(output, &results)?;
    }

    info!(
        action = "complete",
        component = "cli",
        duration_ms = total_start_time.elapsed().as_millis(),
        "Analysis completed successfully"
    );
    Ok(results)
}

pub fn write_report(path: &Path, results: &AggregatedResults) -> Result<()> {
    let json = serde_json::to_string_pretty(results)?;
    fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
    info!(action = "write", component = "report", file_path = ?path, "Wrote JSON report");
    Ok(())
}

pub fn print_analysis_results(results: &AggregatedResults, args: &Args) {
    let summary = &results.summary;
    println!("\n--- Site Fingerprint Analysis ---");
    println!(
        "Sites analyzed: {}",
        format_number(summary.total_sites_analyzed)
    );
    println!(
        "Patterns found: {}",
        format_number(summary.total_patterns_found)
    );

    if let AnalyzerSpecific::Validation(validation) = &results.validation.analyzer_specific {
        let v = &validation.validation_summary;
        println!(
            "Validation: {} ({} of {} candidates validated, quality {:.2})",
            if v.overall_passed { "passed" } else { "failed" },
            format_number(v.validated_count),
            format_number(v.candidate_count),
            v.quality_score
        );
    }

    let limit = args.top.unwrap_or(10);
    for (kind, top) in &summary.top_patterns {
        if top.is_empty() {
            continue;
        }
        println!("\nTop {} {} patterns:", top.len().min(limit), kind.as_str());
        for pattern in top.iter().take(limit) {
            println!(
                "- {}: {} sites ({})",
                pattern.key,
                format_number(pattern.site_count),
                format_percent(pattern.frequency)
            );
        }
    }

    if let Some(discrimination) = &summary.platform_discrimination {
        println!(
            "\nPlatform discrimination across {} platforms: {} of {} patterns discriminatory, {:.1}% noise removed",
            discrimination.platforms.len(),
            format_number(discrimination.discriminatory_patterns),
            format_number(discrimination.total_patterns_analyzed),
            discrimination.noise_reduction_percentage
        );
        for pattern in discrimination.top_discriminatory_patterns.iter().take(limit) {
            println!(
                "- {} (score {:.2})",
                pattern.pattern, pattern.discriminative_score
            );
        }
    }
}
