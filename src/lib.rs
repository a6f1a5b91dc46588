pub mod aggregator;
pub mod analyzers;
pub mod args;
pub mod cli;
pub mod dataset;
pub mod discrimination;
pub mod domain;
pub mod error;
pub mod options;
pub mod signatures;
pub mod snapshot;
pub mod stats;
pub mod utils;
pub mod validation;

pub use aggregator::Aggregator;
pub use args::Args;
pub use cli::analyze_snapshot;
pub use dataset::{Dataset, DatasetSource, InMemorySource, Site};
pub use error::{AnalysisError, Result};
pub use options::AnalysisOptions;
pub use signatures::{init_default_signatures, load_signature_table, SignatureTable};
pub use snapshot::{DatasetCache, LoadOptions, SnapshotLoader};
pub use stats::{AggregatedResults, AnalysisResult, AnalyzerKind, Pattern};
