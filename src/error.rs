use crate::schema::{MappingIssue, OverlapRecord};
use chrono::NaiveDate;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum RoyaltyError {
    #[error("Unreadable spreadsheet '{filename}': {details}")]
    UnreadableFile { filename: String, details: String },

    #[error("Could not detect a header row in the first {scanned} rows")]
    HeaderNotFound { scanned: usize },

    #[error("Column mapping cannot be used for calculation: {}", format_issues(.issues))]
    InvalidMapping { issues: Vec<MappingIssue> },

    #[error("Category values have no contract category: {}", .values.join(", "))]
    UnmappedCategories { values: Vec<String> },

    #[error("Contract {contract_id} uses category rates but no column is mapped to product_category")]
    CategoryColumnMissing { contract_id: String },

    #[error("Category '{category}' is not configured on contract {contract_id}")]
    UnknownContractCategory {
        contract_id: String,
        category: String,
    },

    #[error("Period {start} to {end} overlaps {} existing record(s) for contract {contract_id}", .overlapping.len())]
    PeriodConflict {
        contract_id: String,
        start: NaiveDate,
        end: NaiveDate,
        overlapping: Vec<OverlapRecord>,
    },

    #[error("Amounts overflow while computing {0}; check the mapped columns")]
    AmountOverflow(String),

    #[error("Invalid reporting period: {0}")]
    InvalidPeriod(String),

    #[error("Contract not found: {0}")]
    ContractNotFound(String),

    #[error("Upload session {0} was not found or has expired")]
    SessionNotFound(Uuid),

    #[error("Upload session {upload_id} belongs to contract {expected}, not {actual}")]
    SessionContractMismatch {
        upload_id: Uuid,
        expected: String,
        actual: String,
    },

    #[error("AI classifier failed: {0}")]
    ClassifierFailed(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[cfg(feature = "gemini")]
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Recovery class of an error, so callers can render the right options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The file itself is unusable; upload a different file
    Parse,
    /// The mapping or period needs a human fix before retrying the same step
    Validation,
    /// Needs a decision: override the existing period or go back
    Conflict,
    NotFound,
    /// A collaborator (store, AI, network) failed
    Collaborator,
}

impl RoyaltyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RoyaltyError::UnreadableFile { .. }
            | RoyaltyError::HeaderNotFound { .. } => ErrorKind::Parse,
            RoyaltyError::InvalidMapping { .. }
            | RoyaltyError::UnmappedCategories { .. }
            | RoyaltyError::CategoryColumnMissing { .. }
            | RoyaltyError::UnknownContractCategory { .. }
            | RoyaltyError::AmountOverflow(_)
            | RoyaltyError::InvalidPeriod(_)
            | RoyaltyError::SessionContractMismatch { .. } => ErrorKind::Validation,
            RoyaltyError::PeriodConflict { .. } => ErrorKind::Conflict,
            RoyaltyError::ContractNotFound(_) | RoyaltyError::SessionNotFound(_) => {
                ErrorKind::NotFound
            }
            RoyaltyError::ClassifierFailed(_)
            | RoyaltyError::Storage(_)
            | RoyaltyError::SerializationError(_)
            | RoyaltyError::IoError(_) => ErrorKind::Collaborator,
            #[cfg(feature = "gemini")]
            RoyaltyError::Http(_) => ErrorKind::Collaborator,
        }
    }
}

fn format_issues(issues: &[MappingIssue]) -> String {
    issues
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, RoyaltyError>;
