//! Frequency analyzers. Each one reads the shared dataset and produces its
//! own [`AnalysisResult`]; none of them mutate anything shared.

pub mod cooccurrence;
pub mod counter;
pub mod header;
pub mod meta;
pub mod script;
pub mod semantic;
pub mod technology;
pub mod vendor;

use crate::dataset::Dataset;
use crate::error::Result;
use crate::options::AnalysisOptions;
use crate::stats::{AnalysisResult, AnalyzerKind};

pub use cooccurrence::CooccurrenceAnalyzer;
pub use header::HeaderAnalyzer;
pub use meta::MetaTagAnalyzer;
pub use script::ScriptAnalyzer;
pub use semantic::SemanticAnalyzer;
pub use technology::TechnologyAnalyzer;
pub use vendor::VendorAnalyzer;

pub trait Analyzer: Send + Sync {
    fn kind(&self) -> AnalyzerKind;

    fn analyze(&self, dataset: &Dataset, options: &AnalysisOptions) -> Result<AnalysisResult>;
}
