//! The three entry points callers use: preview an upload, confirm it, and
//! check a period on its own.

use crate::aggregator::{aggregate, calculate_royalty};
use crate::ai::{AiClassifier, AiStatus};
use crate::categories::{CategoryReconciler, CategoryResolution};
use crate::classifier::{ColumnClassification, ColumnClassifier, SavedMappingFit};
use crate::config::PipelineConfig;
use crate::contract::Contract;
use crate::error::{Result, RoyaltyError};
use crate::extractor::{extract, RawSheet, SheetFormat};
use crate::reconciliation::{compute_discrepancy, PeriodCheckReport};
use crate::schema::{
    AggregatedSales, CategoryMapping, CategoryProvenance, ColumnMapping, Discrepancy,
    LicenseeColumnMapping, MappingIssue, RoyaltyCalculation, SalesPeriod, SemanticField,
};
use crate::session::{load_for_contract, InMemorySessionStore, UploadSession, UploadSessionStore};
use crate::store::{
    ContractStore, InMemoryMappingStore, InMemorySalesPeriodStore, MappingStore, SalesPeriodStore,
};
use crate::utils::validate_period;
use chrono::{DateTime, NaiveDate, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

/// Figures computed from the suggested mappings, shown before anything is confirmed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DraftCalculation {
    pub sales: AggregatedSales,
    pub royalty: RoyaltyCalculation,
    pub discrepancy: Discrepancy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadPreview {
    pub upload_id: Uuid,
    pub contract_id: String,
    pub source_filename: String,
    pub sheet_name: Option<String>,
    pub format: SheetFormat,
    pub header_row_index: usize,
    pub metadata_rows: Vec<usize>,
    pub summary_rows: Vec<usize>,
    pub total_rows: usize,
    pub data_rows: usize,
    pub columns: Vec<String>,
    pub sample_rows: Vec<Vec<String>>,
    pub classification: ColumnClassification,
    /// Problems a reviewer must fix in the mapping before confirming
    pub mapping_issues: Vec<MappingIssue>,
    pub categories: Option<CategoryResolution>,
    pub period_check: PeriodCheckReport,
    pub draft: Option<DraftCalculation>,
    pub warnings: Vec<String>,
    pub expires_at: DateTime<Utc>,
}

/// Everything the reviewer settled on for one upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmRequest {
    pub contract_id: String,
    pub upload_id: Uuid,
    pub column_mapping: ColumnMapping,
    /// Report category -> contract category, as confirmed by the reviewer
    #[serde(default)]
    pub category_mapping: Option<BTreeMap<String, String>>,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    #[serde(default)]
    pub save_mapping: bool,
    #[serde(default)]
    pub override_duplicate: bool,
}

pub struct RoyaltyPipeline {
    config: PipelineConfig,
    contracts: Arc<dyn ContractStore>,
    mappings: Arc<dyn MappingStore>,
    periods: Arc<dyn SalesPeriodStore>,
    sessions: Arc<dyn UploadSessionStore>,
    ai: Arc<dyn AiClassifier>,
}

impl RoyaltyPipeline {
    pub fn new(
        config: PipelineConfig,
        contracts: Arc<dyn ContractStore>,
        mappings: Arc<dyn MappingStore>,
        periods: Arc<dyn SalesPeriodStore>,
        sessions: Arc<dyn UploadSessionStore>,
        ai: Arc<dyn AiClassifier>,
    ) -> Self {
        Self {
            config,
            contracts,
            mappings,
            periods,
            sessions,
            ai,
        }
    }

    /// A pipeline with in-memory mapping, sales period and session stores.
    pub fn in_memory(
        config: PipelineConfig,
        contracts: Arc<dyn ContractStore>,
        ai: Arc<dyn AiClassifier>,
    ) -> Self {
        Self::new(
            config,
            contracts,
            Arc::new(InMemoryMappingStore::new()),
            Arc::new(InMemorySalesPeriodStore::new()),
            Arc::new(InMemorySessionStore::new()),
            ai,
        )
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    async fn load_contract(&self, contract_id: &str) -> Result<Contract> {
        self.contracts
            .get_contract(contract_id)
            .await?
            .ok_or_else(|| RoyaltyError::ContractNotFound(contract_id.to_string()))
    }

    /// Category provenances trusted at confirm without the reviewer restating them.
    fn trusted_provenances(&self) -> Vec<CategoryProvenance> {
        let mut trusted = vec![
            CategoryProvenance::Exact,
            CategoryProvenance::Saved,
            CategoryProvenance::Manual,
        ];
        if !self.config.require_review_for_ai_categories {
            trusted.push(CategoryProvenance::Ai);
        }
        trusted
    }

    /// Extracts, classifies and reconciles an upload without persisting anything
    /// except the short-lived session.
    pub async fn preview_upload(
        &self,
        contract_id: &str,
        bytes: &[u8],
        filename: &str,
        period_start: NaiveDate,
        period_end: NaiveDate,
    ) -> Result<UploadPreview> {
        info!(
            "Previewing '{}' for contract {} ({} to {})",
            filename, contract_id, period_start, period_end
        );
        validate_period(period_start, period_end)?;
        let contract = self.load_contract(contract_id).await?;
        let sheet = extract(bytes, filename, &self.config)?;

        let (saved_mapping, saved_aliases, existing) = futures::try_join!(
            self.mappings.get_column_mapping(&contract.licensee_name),
            self.mappings.get_category_aliases(&contract.licensee_name),
            self.periods
                .find_overlapping(&contract.id, period_start, period_end),
        )?;

        let classifier = ColumnClassifier::new(
            self.ai.as_ref(),
            self.config.ai_timeout(),
            self.config.sample_values_per_column,
        );
        let classification = classifier
            .classify(
                &sheet.columns,
                &sheet.column_samples(self.config.sample_values_per_column),
                saved_mapping.as_ref(),
                contract.is_category_based(),
            )
            .await;

        let categories = self
            .reconcile_categories(&contract, &sheet, &classification.mapping, &saved_aliases)
            .await;

        let period_check = PeriodCheckReport::build(&contract, period_start, period_end, &existing);
        let mapping_issues = classification.mapping.issues();

        let mut warnings = period_check.warnings();
        let excluded = sheet.excluded_numeric_rows();
        if !excluded.is_empty() {
            warnings.push(format!(
                "Rows {:?} hold numbers but do not fit the table layout; they were left out of the totals",
                excluded
            ));
        }
        warnings.extend(mapping_issues.iter().map(|i| i.to_string()));
        if let SavedMappingFit::Partial { missing_columns } = &classification.saved_mapping_fit {
            warnings.push(format!(
                "The saved mapping for this licensee expected columns that are missing: {}",
                missing_columns.join(", ")
            ));
        }
        if let AiStatus::Degraded { reason } = &classification.ai_status {
            warnings.push(format!(
                "Automatic column classification was unavailable ({}); review unmapped columns",
                reason
            ));
        }
        if let Some(resolution) = &categories {
            if let AiStatus::Degraded { reason } = &resolution.ai_status {
                warnings.push(format!(
                    "Automatic category matching was unavailable ({}); map categories manually",
                    reason
                ));
            }
            let unmapped = resolution.mapping.unmapped();
            if !unmapped.is_empty() {
                warnings.push(format!(
                    "Categories without a contract category: {}",
                    unmapped.join(", ")
                ));
            }
        }

        let draft = if mapping_issues.is_empty() {
            let trusted = categories
                .as_ref()
                .map(|r| r.mapping.retain_trusted(&self.trusted_provenances()));
            match self.calculate(&sheet, &classification.mapping, trusted.as_ref(), &contract) {
                Ok(draft) => Some(draft),
                Err(e) => {
                    warnings.push(format!("Draft calculation not available: {}", e));
                    None
                }
            }
        } else {
            None
        };

        let session = UploadSession::new(
            contract.id.clone(),
            filename,
            sheet,
            classification.mapping.clone(),
            categories.clone(),
            self.config.session_ttl(),
        );
        let sheet = &session.sheet;
        let preview = UploadPreview {
            upload_id: session.upload_id,
            contract_id: contract.id.clone(),
            source_filename: filename.to_string(),
            sheet_name: sheet.sheet_name.clone(),
            format: sheet.format,
            header_row_index: sheet.header_row_index,
            metadata_rows: sheet.metadata_rows.clone(),
            summary_rows: sheet.summary_rows.clone(),
            total_rows: sheet.total_rows,
            data_rows: sheet.data_rows,
            columns: sheet.columns.clone(),
            sample_rows: sheet.preview_rows(self.config.preview_rows),
            classification,
            mapping_issues,
            categories,
            period_check,
            draft,
            warnings,
            expires_at: session.expires_at,
        };
        self.sessions.put(session).await?;

        info!(
            "Preview {} ready: {} columns, {} data rows, {} warnings",
            preview.upload_id,
            preview.columns.len(),
            preview.data_rows,
            preview.warnings.len()
        );
        Ok(preview)
    }

    async fn reconcile_categories(
        &self,
        contract: &Contract,
        sheet: &RawSheet,
        mapping: &ColumnMapping,
        saved_aliases: &BTreeMap<String, String>,
    ) -> Option<CategoryResolution> {
        if !contract.is_category_based() {
            return None;
        }
        let category_columns = mapping.columns_for(SemanticField::ProductCategory);
        let [column] = category_columns.as_slice() else {
            return None;
        };

        let values = sheet.distinct_values(column);
        let reconciler = CategoryReconciler::new(self.ai.as_ref(), self.config.ai_timeout());
        let hint = sheet.hint_text();
        Some(
            reconciler
                .reconcile(
                    &values,
                    &contract.category_names(),
                    saved_aliases,
                    Some(hint),
                )
                .await,
        )
    }

    fn calculate(
        &self,
        sheet: &RawSheet,
        mapping: &ColumnMapping,
        categories: Option<&CategoryMapping>,
        contract: &Contract,
    ) -> Result<DraftCalculation> {
        let sales = aggregate(sheet, mapping, categories, contract)?;
        let royalty = calculate_royalty(&sales, contract)?;
        let discrepancy = compute_discrepancy(
            royalty.calculated_royalty,
            sales.licensee_reported_royalty,
            self.config.discrepancy_tolerance,
        )?;
        Ok(DraftCalculation {
            sales,
            royalty,
            discrepancy,
        })
    }

    /// Aggregates with the confirmed mappings and persists the sales period.
    ///
    /// The overlap check is repeated inside the store's write. The session
    /// survives a conflict so the caller can retry with `override_duplicate`.
    pub async fn confirm_upload(&self, request: ConfirmRequest) -> Result<SalesPeriod> {
        info!(
            "Confirming upload {} for contract {} ({} to {}, override: {})",
            request.upload_id,
            request.contract_id,
            request.period_start,
            request.period_end,
            request.override_duplicate
        );
        validate_period(request.period_start, request.period_end)?;
        let session =
            load_for_contract(self.sessions.as_ref(), request.upload_id, &request.contract_id)
                .await?;
        let contract = self.load_contract(&request.contract_id).await?;

        let categories = if contract.is_category_based() {
            let mut mapping = session
                .suggested_categories
                .as_ref()
                .map(|r| r.mapping.retain_trusted(&self.trusted_provenances()))
                .unwrap_or_default();
            for (report, target) in request.category_mapping.iter().flatten() {
                mapping.insert(report.clone(), Some(target.clone()), CategoryProvenance::Manual);
            }
            Some(mapping)
        } else {
            None
        };

        let draft = self.calculate(
            &session.sheet,
            &request.column_mapping,
            categories.as_ref(),
            &contract,
        )?;

        let record = SalesPeriod {
            id: Uuid::new_v4(),
            contract_id: contract.id.clone(),
            period_start: request.period_start,
            period_end: request.period_end,
            net_sales: draft.sales.net_sales,
            category_breakdown: draft.sales.category_sales.clone(),
            calculated_royalty: draft.royalty.calculated_royalty,
            licensee_reported_royalty: draft.sales.licensee_reported_royalty,
            discrepancy_amount: draft.discrepancy.discrepancy_amount,
            has_discrepancy: draft.discrepancy.has_discrepancy,
            minimum_applied: draft.royalty.minimum_applied,
            upload_id: Some(session.upload_id),
            source_filename: Some(session.source_filename.clone()),
            supersedes: Vec::new(),
            created_at: Utc::now(),
        };
        let stored = self
            .periods
            .commit(record, request.override_duplicate)
            .await?;

        if request.save_mapping {
            if let Err(e) = self
                .save_mappings(&contract, &request.column_mapping, categories.as_ref())
                .await
            {
                warn!(
                    "Sales period {} stored but saving the mapping for '{}' failed: {}",
                    stored.id, contract.licensee_name, e
                );
            }
        }

        self.sessions.remove(session.upload_id).await?;
        info!(
            "Confirmed sales period {}: net sales {}, royalty {}, discrepancy {:?}",
            stored.id, stored.net_sales, stored.calculated_royalty, stored.discrepancy_amount
        );
        Ok(stored)
    }

    async fn save_mappings(
        &self,
        contract: &Contract,
        column_mapping: &ColumnMapping,
        categories: Option<&CategoryMapping>,
    ) -> Result<()> {
        let licensee = &contract.licensee_name;
        self.mappings
            .put_column_mapping(LicenseeColumnMapping {
                licensee_name: licensee.clone(),
                column_mapping: column_mapping.clone(),
                updated_at: Utc::now(),
            })
            .await?;
        let aliases = categories.map(CategoryMapping::aliases).unwrap_or_default();
        if !aliases.is_empty() {
            self.mappings.put_category_aliases(licensee, aliases).await?;
        }
        Ok(())
    }

    /// Advisory overlap, contract range and frequency findings for a period.
    pub async fn check_period(
        &self,
        contract_id: &str,
        period_start: NaiveDate,
        period_end: NaiveDate,
    ) -> Result<PeriodCheckReport> {
        validate_period(period_start, period_end)?;
        let contract = self.load_contract(contract_id).await?;
        let existing = self
            .periods
            .find_overlapping(&contract.id, period_start, period_end)
            .await?;
        Ok(PeriodCheckReport::build(
            &contract,
            period_start,
            period_end,
            &existing,
        ))
    }

    pub async fn purge_expired_sessions(&self) -> Result<usize> {
        let purged = self.sessions.purge_expired().await?;
        if purged > 0 {
            info!("Purged {} expired upload sessions", purged);
        }
        Ok(purged)
    }
}
