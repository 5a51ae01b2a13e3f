//! # Royalty Report Reconciler
//!
//! Turns licensee royalty spreadsheets of unknown shape into normalized sales
//! periods checked against a contract's royalty terms.
//!
//! ## Pipeline
//!
//! - **Extract**: read xlsx/xls/csv bytes, find the header row past any
//!   preamble, and set aside total rows and trailing notes
//! - **Classify columns**: saved licensee mapping, then synonyms, then one
//!   batched AI call for whatever is left
//! - **Reconcile categories**: map the report's category labels onto the
//!   contract's categories (category-rate contracts only)
//! - **Aggregate & calculate**: sum net sales (per category when needed) and
//!   apply flat, category or tiered rates plus any minimum guarantee
//! - **Reconcile**: discrepancy against the licensee's own figure, and
//!   overlap/range/frequency checks on the reporting period
//!
//! ## Example
//!
//! ```rust,ignore
//! use royalty_report_reconciler::*;
//! use chrono::NaiveDate;
//! use std::sync::Arc;
//!
//! let contracts = Arc::new(InMemoryContractStore::new());
//! contracts.insert(contract).await;
//! let pipeline = RoyaltyPipeline::in_memory(
//!     PipelineConfig::default(),
//!     contracts,
//!     Arc::new(DisabledClassifier),
//! );
//!
//! let q1 = (
//!     NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
//!     NaiveDate::from_ymd_opt(2024, 3, 31).unwrap(),
//! );
//! let preview = pipeline
//!     .preview_upload("LIC-001", &bytes, "q1.xlsx", q1.0, q1.1)
//!     .await?;
//!
//! let period = pipeline
//!     .confirm_upload(ConfirmRequest {
//!         contract_id: "LIC-001".to_string(),
//!         upload_id: preview.upload_id,
//!         column_mapping: preview.classification.mapping.clone(),
//!         category_mapping: None,
//!         period_start: q1.0,
//!         period_end: q1.1,
//!         save_mapping: true,
//!         override_duplicate: false,
//!     })
//!     .await?;
//! ```

pub mod aggregator;
pub mod ai;
pub mod categories;
pub mod classifier;
pub mod config;
pub mod contract;
pub mod error;
pub mod extractor;
pub mod pipeline;
pub mod reconciliation;
pub mod schema;
pub mod session;
pub mod store;
pub mod utils;

#[cfg(feature = "gemini")]
pub mod llm;

pub use aggregator::{aggregate, calculate_royalty};
pub use ai::{AiClassifier, AiStatus, DisabledClassifier};
pub use categories::{CategoryReconciler, CategoryResolution};
pub use classifier::{ColumnClassification, ColumnClassifier, SavedMappingFit};
pub use config::PipelineConfig;
pub use contract::*;
pub use error::{ErrorKind, Result, RoyaltyError};
pub use extractor::{extract, Cell, RawSheet, SheetFormat};
pub use pipeline::{ConfirmRequest, DraftCalculation, RoyaltyPipeline, UploadPreview};
pub use reconciliation::{compute_discrepancy, PeriodCheckReport};
pub use schema::*;
pub use session::{DirectorySessionStore, InMemorySessionStore, UploadSession, UploadSessionStore};
pub use store::{
    ContractStore, InMemoryContractStore, InMemoryMappingStore, InMemorySalesPeriodStore,
    MappingStore, SalesPeriodStore,
};
