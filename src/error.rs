use std::path::PathBuf;

/// Errors surfaced by the analysis engine.
///
/// Malformed site records, statistical edge cases and empty datasets are
/// reported as data inside results and never show up here.
#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error("invalid analysis options: {reason}")]
    InvalidOptions { reason: String },

    #[error("{analyzer} analyzer requires {dependency} before analyze() is called")]
    MissingDependency {
        analyzer: &'static str,
        dependency: &'static str,
    },

    #[error("{analyzer} analyzer failed: {source}")]
    AnalyzerFailed {
        analyzer: &'static str,
        #[source]
        source: Box<AnalysisError>,
    },

    #[error("cross-analyzer consistency violated: {reason}")]
    ConsistencyViolation { reason: String },

    #[error("snapshot not found at {0:?}")]
    SnapshotNotFound(PathBuf),

    #[error("failed to read snapshot: {0}")]
    DatasetLoad(#[from] rusqlite::Error),

    #[error("invalid signature table: {0}")]
    SignatureTable(#[from] serde_json::Error),

    #[error("failed to read signature table {path:?}: {source}")]
    SignatureFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl AnalysisError {
    /// Wrap an analyzer's error so the caller can tell which stage failed.
    pub fn in_analyzer(analyzer: &'static str, source: AnalysisError) -> Self {
        match source {
            already @ AnalysisError::AnalyzerFailed { .. } => already,
            other => AnalysisError::AnalyzerFailed {
                analyzer,
                source: Box::new(other),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, AnalysisError>;
