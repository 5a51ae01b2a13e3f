use crate::error::Result;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for the parse -> map -> aggregate -> reconcile pipeline.
///
/// Every field has a default, so a partial JSON document is a valid config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// How many leading rows are searched for the header
    pub header_scan_rows: usize,
    /// Minimum number of text cells a header row must carry
    pub min_header_string_cells: usize,
    /// Sample values per column sent to the AI classifier
    pub sample_values_per_column: usize,
    /// Data rows echoed back in the preview
    pub preview_rows: usize,
    pub ai_timeout_secs: u64,
    pub session_ttl_secs: i64,
    pub discrepancy_tolerance: Decimal,
    /// When true, AI-suggested category aliases are not used at confirm
    /// unless the caller passes them back explicitly.
    pub require_review_for_ai_categories: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            header_scan_rows: 20,
            min_header_string_cells: 2,
            sample_values_per_column: 5,
            preview_rows: 10,
            ai_timeout_secs: 30,
            session_ttl_secs: 3600,
            discrepancy_tolerance: Decimal::new(1, 2),
            require_review_for_ai_categories: true,
        }
    }
}

impl PipelineConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn ai_timeout(&self) -> Duration {
        Duration::from_secs(self.ai_timeout_secs)
    }

    pub fn session_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.session_ttl_secs)
    }
}
