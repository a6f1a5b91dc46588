use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "siteprint",
    about = "Find the headers, meta tags and scripts that fingerprint website platforms",
    version,
    long_about = None
)]
pub struct Args {
    /// SQLite snapshot of captured sites
    #[arg(short, long)]
    pub snapshot: Option<PathBuf>,

    /// Minimum number of sites a pattern must appear on
    #[arg(short, long, default_value_t = 1)]
    pub min_occurrences: u32,

    /// Example values kept per pattern
    #[arg(long, default_value_t = 5)]
    pub max_examples: usize,

    /// Do not collect example values
    #[arg(long)]
    pub no_examples: bool,

    /// Enable semantic header filtering
    #[arg(long)]
    pub semantic_filtering: bool,

    /// Add a platform discrimination summary
    #[arg(long)]
    pub platform_discrimination: bool,

    /// Path to custom vendor signature file
    #[arg(long)]
    pub signatures: Option<PathBuf>,

    /// Write the full JSON report to this file
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Number of top patterns to show per analyzer
    #[arg(short, long)]
    pub top: Option<usize>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Number of worker threads
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Initialize vendor_signatures.json with the default signatures
    #[arg(long)]
    pub init_signatures: bool,
}

impl Args {
    pub fn analysis_options(&self) -> crate::options::AnalysisOptions {
        crate::options::AnalysisOptions {
            min_occurrences: self.min_occurrences,
            include_examples: !self.no_examples,
            max_examples: self.max_examples,
            semantic_filtering: self.semantic_filtering,
            focus_platform_discrimination: self.platform_discrimination,
        }
    }
}
