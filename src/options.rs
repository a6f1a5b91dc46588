use serde::{Deserialize, Serialize};

use crate::error::{AnalysisError, Result};

/// Run-wide options. Every analyzer echoes this exact value in its metadata.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AnalysisOptions {
    pub min_occurrences: u32,
    pub include_examples: bool,
    pub max_examples: usize,
    pub semantic_filtering: bool,
    pub focus_platform_discrimination: bool,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        AnalysisOptions {
            min_occurrences: 1,
            include_examples: true,
            max_examples: 5,
            semantic_filtering: false,
            focus_platform_discrimination: false,
        }
    }
}

impl AnalysisOptions {
    pub fn validate(&self) -> Result<()> {
        if self.min_occurrences == 0 {
            return Err(AnalysisError::InvalidOptions {
                reason: "minOccurrences must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// How many examples a pattern may carry under these options.
    pub fn example_limit(&self) -> usize {
        if self.include_examples {
            self.max_examples
        } else {
            0
        }
    }

    pub fn passes_threshold(&self, site_count: usize) -> bool {
        site_count >= self.min_occurrences as usize
    }
}
