//! Maps detected column headers onto [`SemanticField`]s.
//!
//! Resolution order per column, first match wins:
//! 1. the licensee's saved mapping (exact header match),
//! 2. the synonym table (synonym phrase contained in the header),
//! 3. one batched AI call for everything still unresolved.

use crate::ai::{call_with_timeout, AiClassifier, AiStatus, ColumnClassificationRequest, ColumnSample};
use crate::schema::{ColumnMapping, ColumnProvenance, LicenseeColumnMapping, SemanticField};
use crate::utils::normalize_label;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

/// Tie-break order when synonyms of several fields match one header.
pub const FIELD_PRIORITY: [SemanticField; 8] = [
    SemanticField::RoyaltyRate,
    SemanticField::LicenseeReportedRoyalty,
    SemanticField::NetSales,
    SemanticField::Returns,
    SemanticField::GrossSales,
    SemanticField::ProductCategory,
    SemanticField::Territory,
    SemanticField::Metadata,
];

pub fn synonyms(field: SemanticField) -> &'static [&'static str] {
    match field {
        SemanticField::NetSales => &[
            "net sales",
            "net revenue",
            "net amount",
            "net receipts",
            "net invoiced",
            "net proceeds",
        ],
        SemanticField::GrossSales => &[
            "gross sales",
            "gross revenue",
            "gross amount",
            "gross receipts",
            "total sales",
            "sales amount",
            "invoiced amount",
        ],
        SemanticField::Returns => &[
            "returns",
            "allowances",
            "deductions",
            "credits",
            "refunds",
            "chargebacks",
            "discounts",
        ],
        SemanticField::ProductCategory => &[
            "category",
            "product line",
            "product type",
            "product group",
            "division",
            "collection",
        ],
        SemanticField::RoyaltyRate => &[
            "royalty rate",
            "royalty %",
            "royalty percent",
            "rate %",
            "rate (%)",
        ],
        SemanticField::LicenseeReportedRoyalty => &[
            "royalty due",
            "royalty owed",
            "royalty amount",
            "royalty payable",
            "royalty paid",
            "royalty earned",
            "total royalty",
            "royalties",
            "amount owed",
            "amount due",
        ],
        SemanticField::Territory => &["territory", "region", "country", "market"],
        SemanticField::Metadata => &[
            "sku",
            "upc",
            "item",
            "style",
            "description",
            "product name",
            "customer",
            "retailer",
            "invoice",
            "units",
            "quantity",
            "qty",
            "date",
            "period",
            "licensee",
        ],
        SemanticField::Ignore => &[],
    }
}

/// Synonym step: a synonym phrase must appear inside the normalized header.
///
/// Only this direction is tested, so abbreviations ("Amt Owed") or word-order
/// changes never match here and fall through to AI classification.
pub fn synonym_match(column: &str) -> Option<SemanticField> {
    let header = normalize_label(column);
    if header.is_empty() {
        return None;
    }
    FIELD_PRIORITY
        .into_iter()
        .find(|field| synonyms(*field).iter().any(|s| header.contains(s)))
}

/// Saved step: exact header match against the licensee's previous mapping.
pub fn saved_match(saved: Option<&ColumnMapping>, column: &str) -> Option<SemanticField> {
    let saved = saved?;
    saved
        .iter()
        .find(|(name, _)| name.as_str() == column)
        .map(|(_, field)| *field)
}

/// How well a saved mapping lines up with the current header set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "fit", rename_all = "snake_case")]
pub enum SavedMappingFit {
    NoSavedMapping,
    Full,
    /// Columns the saved mapping relied on that are gone from this sheet
    Partial { missing_columns: Vec<String> },
}

impl SavedMappingFit {
    pub fn assess(saved: Option<&ColumnMapping>, columns: &[String]) -> Self {
        let Some(saved) = saved else {
            return SavedMappingFit::NoSavedMapping;
        };
        let present: HashSet<&str> = columns.iter().map(String::as_str).collect();
        let missing: Vec<String> = saved
            .iter()
            .filter(|(name, field)| **field != SemanticField::Ignore && !present.contains(name.as_str()))
            .map(|(name, _)| name.clone())
            .collect();
        if missing.is_empty() {
            SavedMappingFit::Full
        } else {
            SavedMappingFit::Partial {
                missing_columns: missing,
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnClassification {
    pub mapping: ColumnMapping,
    pub provenance: BTreeMap<String, ColumnProvenance>,
    /// The provenance that assigned the most columns
    pub mapping_source: ColumnProvenance,
    pub saved_mapping_fit: SavedMappingFit,
    pub ai_status: AiStatus,
}

pub struct ColumnClassifier<'a> {
    ai: &'a dyn AiClassifier,
    timeout: Duration,
    sample_limit: usize,
}

impl<'a> ColumnClassifier<'a> {
    pub fn new(ai: &'a dyn AiClassifier, timeout: Duration, sample_limit: usize) -> Self {
        Self {
            ai,
            timeout,
            sample_limit,
        }
    }

    /// Classifies `columns` (in sheet order).
    ///
    /// `category_based` is false for flat and tiered contracts; category
    /// matches are then downgraded to `metadata`.
    pub async fn classify(
        &self,
        columns: &[String],
        samples: &BTreeMap<String, Vec<String>>,
        saved: Option<&LicenseeColumnMapping>,
        category_based: bool,
    ) -> ColumnClassification {
        let saved_mapping = saved.map(|s| &s.column_mapping);
        let saved_mapping_fit = SavedMappingFit::assess(saved_mapping, columns);
        if let SavedMappingFit::Partial { missing_columns } = &saved_mapping_fit {
            warn!(
                "Saved mapping for '{}' no longer fits this sheet (missing: {}); reusing only exact header matches",
                saved.map(|s| s.licensee_name.as_str()).unwrap_or_default(),
                missing_columns.join(", ")
            );
        }

        let mut mapping = ColumnMapping::ignoring_all(columns);
        let mut provenance: BTreeMap<String, ColumnProvenance> = columns
            .iter()
            .map(|c| (c.clone(), ColumnProvenance::Unresolved))
            .collect();

        for column in columns {
            let resolved = saved_match(saved_mapping, column)
                .map(|f| (f, ColumnProvenance::Saved))
                .or_else(|| synonym_match(column).map(|f| (f, ColumnProvenance::Exact)));
            if let Some((field, source)) = resolved {
                debug!("Column '{}' -> {} ({:?})", column, field, source);
                mapping.assign(column.clone(), field);
                provenance.insert(column.clone(), source);
            }
        }

        let unresolved: Vec<&String> = columns
            .iter()
            .filter(|c| provenance.get(*c) == Some(&ColumnProvenance::Unresolved))
            .collect();

        let ai_status = if unresolved.is_empty() {
            AiStatus::NotNeeded
        } else {
            self.classify_with_ai(&unresolved, samples, &mut mapping, &mut provenance)
                .await
        };

        if !category_based {
            let category_columns: Vec<String> = mapping
                .columns_for(SemanticField::ProductCategory)
                .into_iter()
                .map(String::from)
                .collect();
            for column in category_columns {
                debug!(
                    "Column '{}' looks like a category but the contract has no category rates; treating as metadata",
                    column
                );
                mapping.assign(column, SemanticField::Metadata);
            }
        }

        let mapping_source = dominant_source(&provenance);
        info!(
            "Classified {} columns (source: {:?}, net_sales mapped: {})",
            columns.len(),
            mapping_source,
            mapping.has(SemanticField::NetSales)
        );

        ColumnClassification {
            mapping,
            provenance,
            mapping_source,
            saved_mapping_fit,
            ai_status,
        }
    }

    async fn classify_with_ai(
        &self,
        unresolved: &[&String],
        samples: &BTreeMap<String, Vec<String>>,
        mapping: &mut ColumnMapping,
        provenance: &mut BTreeMap<String, ColumnProvenance>,
    ) -> AiStatus {
        let request = ColumnClassificationRequest {
            columns: unresolved
                .iter()
                .map(|c| ColumnSample {
                    header: (*c).clone(),
                    samples: samples
                        .get(*c)
                        .map(|v| v.iter().take(self.sample_limit).cloned().collect())
                        .unwrap_or_default(),
                })
                .collect(),
            candidate_fields: SemanticField::ALL.to_vec(),
        };

        let response = match call_with_timeout(
            self.timeout,
            "column classification",
            self.ai.classify_columns(&request),
        )
        .await
        {
            Ok(response) => response,
            Err(reason) => return AiStatus::Degraded { reason },
        };

        let wanted: HashSet<&str> = unresolved.iter().map(|c| c.as_str()).collect();
        for suggestion in response.assignments {
            if !wanted.contains(suggestion.column.as_str()) {
                debug!("Ignoring AI answer for unknown column '{}'", suggestion.column);
                continue;
            }
            let field = match SemanticField::from_tag(&suggestion.field) {
                Some(field) => field,
                None => {
                    warn!(
                        "AI returned unknown field '{}' for column '{}'; using ignore",
                        suggestion.field, suggestion.column
                    );
                    SemanticField::Ignore
                }
            };
            if field != SemanticField::Ignore {
                mapping.assign(suggestion.column.clone(), field);
                provenance.insert(suggestion.column, ColumnProvenance::Ai);
            }
        }

        AiStatus::Succeeded
    }
}

fn dominant_source(provenance: &BTreeMap<String, ColumnProvenance>) -> ColumnProvenance {
    [
        ColumnProvenance::Saved,
        ColumnProvenance::Exact,
        ColumnProvenance::Ai,
    ]
    .into_iter()
    .map(|p| (p, provenance.values().filter(|v| **v == p).count()))
    .filter(|(_, count)| *count > 0)
    // max_by_key keeps the last maximum, so iterate in reverse priority.
    .rev()
    .max_by_key(|(_, count)| *count)
    .map(|(p, _)| p)
    .unwrap_or(ColumnProvenance::Unresolved)
}
