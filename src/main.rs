use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;
use tracing::{error, info};

use siteprint::cli::print_analysis_results;
use siteprint::utils::{setup_logging, validate_args};
use siteprint::{analyze_snapshot, init_default_signatures, Args};

fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(args.verbose);
    validate_args(&args)?;

    if args.init_signatures {
        let path = init_default_signatures(Path::new("."))?;
        println!("Created {} with default signatures", path.display());
        return Ok(());
    }

    let worker_count = args
        .workers
        .unwrap_or_else(|| std::cmp::min(num_cpus::get(), 8));
    rayon::ThreadPoolBuilder::new()
        .num_threads(worker_count)
        .build_global()
        .context("Failed to configure worker pool")?;
    info!(action = "configure", component = "worker_pool", worker_count, "Using workers for analysis");

    match analyze_snapshot(&args) {
        Ok(results) => {
            print_analysis_results(&results, &args);
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Analysis failed");
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    }
}
