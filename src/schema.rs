use crate::utils::normalize_label;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// The fixed semantic schema every spreadsheet column is mapped onto.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum SemanticField {
    #[schemars(description = "Net sales after returns and allowances. The royalty base.")]
    NetSales,

    #[schemars(description = "Gross sales before any deductions.")]
    GrossSales,

    #[schemars(description = "Returns, allowances, credits or other deductions from gross sales.")]
    Returns,

    #[schemars(description = "Product category, product line or division label for the row.")]
    ProductCategory,

    #[schemars(description = "The royalty percentage the licensee applied to the row.")]
    RoyaltyRate,

    #[schemars(
        description = "The royalty amount the licensee calculated and claims to owe (royalty due, amount owed)."
    )]
    LicenseeReportedRoyalty,

    #[schemars(description = "Sales territory, region or country.")]
    Territory,

    #[schemars(
        description = "Informational columns such as SKU, product name, description, units or dates."
    )]
    Metadata,

    #[schemars(description = "Columns that carry nothing useful for royalty reporting.")]
    Ignore,
}

impl SemanticField {
    pub const ALL: [SemanticField; 9] = [
        SemanticField::NetSales,
        SemanticField::GrossSales,
        SemanticField::Returns,
        SemanticField::ProductCategory,
        SemanticField::RoyaltyRate,
        SemanticField::LicenseeReportedRoyalty,
        SemanticField::Territory,
        SemanticField::Metadata,
        SemanticField::Ignore,
    ];

    pub fn as_tag(&self) -> &'static str {
        match self {
            SemanticField::NetSales => "net_sales",
            SemanticField::GrossSales => "gross_sales",
            SemanticField::Returns => "returns",
            SemanticField::ProductCategory => "product_category",
            SemanticField::RoyaltyRate => "royalty_rate",
            SemanticField::LicenseeReportedRoyalty => "licensee_reported_royalty",
            SemanticField::Territory => "territory",
            SemanticField::Metadata => "metadata",
            SemanticField::Ignore => "ignore",
        }
    }

    /// Parses a field tag leniently (case and surrounding whitespace are ignored).
    pub fn from_tag(tag: &str) -> Option<Self> {
        let tag = tag.trim().to_lowercase();
        Self::ALL.into_iter().find(|field| field.as_tag() == tag)
    }

    /// Fields that must come from at most one column for a calculation to be unambiguous.
    pub fn is_single_source(&self) -> bool {
        matches!(
            self,
            SemanticField::NetSales
                | SemanticField::GrossSales
                | SemanticField::Returns
                | SemanticField::ProductCategory
                | SemanticField::LicenseeReportedRoyalty
        )
    }
}

impl fmt::Display for SemanticField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_tag())
    }
}

/// How a column's field assignment was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnProvenance {
    /// Reused from the licensee's previously confirmed mapping
    Saved,
    /// Matched a synonym phrase
    Exact,
    /// Suggested by the AI classifier
    Ai,
    /// Nothing matched; the column defaults to `ignore`
    Unresolved,
}

/// Assignment of every detected column to exactly one semantic field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ColumnMapping(BTreeMap<String, SemanticField>);

impl ColumnMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a mapping where every column starts as `ignore`.
    pub fn ignoring_all<S: AsRef<str>>(columns: &[S]) -> Self {
        Self(
            columns
                .iter()
                .map(|c| (c.as_ref().to_string(), SemanticField::Ignore))
                .collect(),
        )
    }

    pub fn assign(&mut self, column: impl Into<String>, field: SemanticField) {
        self.0.insert(column.into(), field);
    }

    pub fn field(&self, column: &str) -> SemanticField {
        self.0.get(column).copied().unwrap_or(SemanticField::Ignore)
    }

    pub fn columns_for(&self, field: SemanticField) -> Vec<&str> {
        self.0
            .iter()
            .filter(|(_, f)| **f == field)
            .map(|(c, _)| c.as_str())
            .collect()
    }

    pub fn has(&self, field: SemanticField) -> bool {
        self.0.values().any(|f| *f == field)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &SemanticField)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Problems that would block a calculation with this mapping.
    pub fn issues(&self) -> Vec<MappingIssue> {
        let mut issues = Vec::new();

        for field in SemanticField::ALL {
            if !field.is_single_source() {
                continue;
            }
            let columns = self.columns_for(field);
            if columns.len() > 1 {
                issues.push(MappingIssue::AmbiguousField {
                    field,
                    columns: columns.into_iter().map(String::from).collect(),
                });
            }
        }

        let derivable =
            self.has(SemanticField::GrossSales) && self.has(SemanticField::Returns);
        if !self.has(SemanticField::NetSales) && !derivable {
            issues.push(MappingIssue::NetSalesUnmapped);
        }

        issues
    }
}

impl FromIterator<(String, SemanticField)> for ColumnMapping {
    fn from_iter<I: IntoIterator<Item = (String, SemanticField)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum MappingIssue {
    NetSalesUnmapped,
    AmbiguousField {
        field: SemanticField,
        columns: Vec<String>,
    },
}

impl fmt::Display for MappingIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MappingIssue::NetSalesUnmapped => write!(
                f,
                "no column is mapped to net_sales (and net sales cannot be derived from gross_sales and returns)"
            ),
            MappingIssue::AmbiguousField { field, columns } => write!(
                f,
                "{} is mapped from more than one column: {}",
                field,
                columns.join(", ")
            ),
        }
    }
}

/// A licensee's previously confirmed column mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LicenseeColumnMapping {
    pub licensee_name: String,
    pub column_mapping: ColumnMapping,
    pub updated_at: DateTime<Utc>,
}

/// How a report category value was resolved to a contract category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CategoryProvenance {
    /// Case-insensitive match on a contract category name
    Exact,
    /// A licensee alias saved on an earlier confirmation
    Saved,
    /// Suggested by the AI classifier; must be reviewed before use
    Ai,
    /// Supplied by a human reviewer
    Manual,
    /// Nothing usable was found
    Unmapped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryAssignment {
    pub contract_category: Option<String>,
    pub provenance: CategoryProvenance,
}

/// Report-side category label -> contract-side category name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CategoryMapping(BTreeMap<String, CategoryAssignment>);

impl CategoryMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a mapping from reviewer-confirmed pairs.
    pub fn confirmed(pairs: &BTreeMap<String, String>) -> Self {
        Self(
            pairs
                .iter()
                .map(|(report, contract)| {
                    (
                        report.clone(),
                        CategoryAssignment {
                            contract_category: Some(contract.clone()),
                            provenance: CategoryProvenance::Manual,
                        },
                    )
                })
                .collect(),
        )
    }

    pub fn insert(
        &mut self,
        report_category: impl Into<String>,
        contract_category: Option<String>,
        provenance: CategoryProvenance,
    ) {
        self.0.insert(
            report_category.into(),
            CategoryAssignment {
                contract_category,
                provenance,
            },
        );
    }

    pub fn get(&self, report_category: &str) -> Option<&CategoryAssignment> {
        self.0.get(report_category).or_else(|| {
            let wanted = normalize_label(report_category);
            self.0
                .iter()
                .find(|(k, _)| normalize_label(k) == wanted)
                .map(|(_, v)| v)
        })
    }

    /// The contract category a report value resolves to, if any.
    pub fn resolve(&self, report_category: &str) -> Option<&str> {
        self.get(report_category)
            .and_then(|a| a.contract_category.as_deref())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &CategoryAssignment)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn unmapped(&self) -> Vec<&str> {
        self.0
            .iter()
            .filter(|(_, a)| a.contract_category.is_none())
            .map(|(k, _)| k.as_str())
            .collect()
    }

    /// Keeps only entries whose provenance the caller trusts without review.
    pub fn retain_trusted(&self, trusted: &[CategoryProvenance]) -> Self {
        Self(
            self.0
                .iter()
                .filter(|(_, a)| trusted.contains(&a.provenance))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    /// Pairs worth remembering as licensee aliases (mapped, and not identical to the target).
    pub fn aliases(&self) -> BTreeMap<String, String> {
        self.0
            .iter()
            .filter_map(|(report, a)| {
                let contract = a.contract_category.as_ref()?;
                if report.trim().eq_ignore_ascii_case(contract.trim()) {
                    None
                } else {
                    Some((report.clone(), contract.clone()))
                }
            })
            .collect()
    }
}

/// Normalized sales figures for one upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedSales {
    pub net_sales: Decimal,
    /// Contract category -> net sales. Present only for category-rate contracts.
    pub category_sales: Option<BTreeMap<String, Decimal>>,
    pub licensee_reported_royalty: Option<Decimal>,
    pub gross_sales: Option<Decimal>,
    pub returns: Option<Decimal>,
    pub rows_aggregated: usize,
    /// Sheet row indices below the header that were not data-shaped
    pub rows_skipped: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoyaltyCalculation {
    /// Royalty before any minimum guarantee floor
    pub computed_royalty: Decimal,
    /// Royalty owed for the period after the floor
    pub calculated_royalty: Decimal,
    pub category_royalties: Option<BTreeMap<String, Decimal>>,
    pub minimum_applied: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Discrepancy {
    /// calculated - reported. Positive means under-reported by the licensee.
    pub discrepancy_amount: Option<Decimal>,
    pub has_discrepancy: bool,
}

/// The persisted outcome of a confirmed upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SalesPeriod {
    pub id: Uuid,
    pub contract_id: String,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub net_sales: Decimal,
    pub category_breakdown: Option<BTreeMap<String, Decimal>>,
    pub calculated_royalty: Decimal,
    pub licensee_reported_royalty: Option<Decimal>,
    pub discrepancy_amount: Option<Decimal>,
    pub has_discrepancy: bool,
    pub minimum_applied: bool,
    pub upload_id: Option<Uuid>,
    pub source_filename: Option<String>,
    /// Ids of earlier records this one replaced through an override
    #[serde(default)]
    pub supersedes: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl SalesPeriod {
    pub fn overlaps(&self, start: NaiveDate, end: NaiveDate) -> bool {
        self.period_start <= end && self.period_end >= start
    }

    pub fn summary(&self) -> OverlapRecord {
        OverlapRecord {
            id: self.id,
            period_start: self.period_start,
            period_end: self.period_end,
            net_sales: self.net_sales,
            calculated_royalty: self.calculated_royalty,
            created_at: self.created_at,
        }
    }
}

/// An existing record whose period intersects a requested one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverlapRecord {
    pub id: Uuid,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub net_sales: Decimal,
    pub calculated_royalty: Decimal,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_tags_round_trip_through_parser() {
        for field in SemanticField::ALL {
            assert_eq!(SemanticField::from_tag(field.as_tag()), Some(field));
        }
        assert_eq!(
            SemanticField::from_tag("  Net_Sales "),
            Some(SemanticField::NetSales)
        );
        assert_eq!(SemanticField::from_tag("royalty"), None);
    }

    #[test]
    fn test_field_serializes_as_snake_case_tag() {
        let json = serde_json::to_string(&SemanticField::LicenseeReportedRoyalty).unwrap();
        assert_eq!(json, "\"licensee_reported_royalty\"");
    }

    #[test]
    fn test_mapping_issues() {
        let mut mapping = ColumnMapping::ignoring_all(&["Product", "Net", "Net 2"]);
        assert_eq!(mapping.issues(), vec![MappingIssue::NetSalesUnmapped]);

        mapping.assign("Net", SemanticField::NetSales);
        assert!(mapping.issues().is_empty());

        mapping.assign("Net 2", SemanticField::NetSales);
        let issues = mapping.issues();
        assert_eq!(issues.len(), 1);
        assert!(matches!(
            &issues[0],
            MappingIssue::AmbiguousField { field: SemanticField::NetSales, columns } if columns.len() == 2
        ));
    }

    #[test]
    fn test_net_sales_derivable_from_gross_and_returns() {
        let mut mapping = ColumnMapping::new();
        mapping.assign("Gross", SemanticField::GrossSales);
        assert_eq!(mapping.issues(), vec![MappingIssue::NetSalesUnmapped]);
        mapping.assign("Returns", SemanticField::Returns);
        assert!(mapping.issues().is_empty());
    }

    #[test]
    fn test_category_mapping_lookup_is_case_insensitive() {
        let mut mapping = CategoryMapping::new();
        mapping.insert(
            "Tops & Bottoms",
            Some("Apparel".to_string()),
            CategoryProvenance::Ai,
        );
        mapping.insert("Footwear", Some("Footwear".to_string()), CategoryProvenance::Exact);
        mapping.insert("Misc", None, CategoryProvenance::Unmapped);

        assert_eq!(mapping.resolve("tops & bottoms "), Some("Apparel"));
        assert_eq!(mapping.resolve("Misc"), None);
        assert_eq!(mapping.unmapped(), vec!["Misc"]);

        let aliases = mapping.aliases();
        assert_eq!(aliases.len(), 1);
        assert_eq!(aliases.get("Tops & Bottoms").map(String::as_str), Some("Apparel"));

        let trusted = mapping.retain_trusted(&[CategoryProvenance::Exact]);
        assert_eq!(trusted.len(), 1);
        assert_eq!(trusted.resolve("Tops & Bottoms"), None);
    }
}
