//! Sums classified data rows into [`AggregatedSales`] and applies the
//! contract's rate structure.
//!
//! Money is summed first and multiplied by the rate afterwards; rounding to
//! cents happens once, on the final figures.

use crate::categories::exact_match;
use crate::contract::{tiered_royalty, Contract, RateStructure};
use crate::error::{Result, RoyaltyError};
use crate::extractor::RawSheet;
use crate::schema::{
    AggregatedSales, CategoryMapping, ColumnMapping, MappingIssue, RoyaltyCalculation,
    SemanticField,
};
use crate::utils::round_money;
use log::{debug, info};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet};

const BLANK_CATEGORY: &str = "(blank)";

/// Sheet column positions for the fields the calculation reads.
#[derive(Debug, Clone, Copy, Default)]
struct SalesColumns {
    net: Option<usize>,
    gross: Option<usize>,
    returns: Option<usize>,
    category: Option<usize>,
    reported: Option<usize>,
}

impl SalesColumns {
    fn resolve(sheet: &RawSheet, mapping: &ColumnMapping) -> Result<Self> {
        let issues = mapping.issues();
        if !issues.is_empty() {
            return Err(RoyaltyError::InvalidMapping { issues });
        }

        let position = |field: SemanticField| {
            mapping
                .columns_for(field)
                .first()
                .and_then(|name| sheet.column_index(name))
        };
        let columns = SalesColumns {
            net: position(SemanticField::NetSales),
            gross: position(SemanticField::GrossSales),
            returns: position(SemanticField::Returns),
            category: position(SemanticField::ProductCategory),
            reported: position(SemanticField::LicenseeReportedRoyalty),
        };

        // The mapping may name columns this sheet does not have.
        if columns.net.is_none() && (columns.gross.is_none() || columns.returns.is_none()) {
            return Err(RoyaltyError::InvalidMapping {
                issues: vec![MappingIssue::NetSalesUnmapped],
            });
        }
        Ok(columns)
    }
}

/// Sheet values go up to `Decimal::MAX`, so every sum is checked.
fn checked(value: Option<Decimal>, what: &str) -> Result<Decimal> {
    value.ok_or_else(|| RoyaltyError::AmountOverflow(what.to_string()))
}

fn number_at(sheet: &RawSheet, row: usize, col: Option<usize>) -> Decimal {
    col.and_then(|c| sheet.cell(row, c).as_number())
        .unwrap_or(Decimal::ZERO)
}

/// Aggregates the data rows of `sheet` under a confirmed mapping.
///
/// For category-rate contracts every data row must resolve to a configured
/// category; unresolved values fail the whole aggregation.
pub fn aggregate(
    sheet: &RawSheet,
    mapping: &ColumnMapping,
    categories: Option<&CategoryMapping>,
    contract: &Contract,
) -> Result<AggregatedSales> {
    let columns = SalesColumns::resolve(sheet, mapping)?;
    let contract_categories = contract.category_names();

    let mut buckets: Option<BTreeMap<String, Decimal>> = if contract.is_category_based() {
        if columns.category.is_none() {
            return Err(RoyaltyError::CategoryColumnMissing {
                contract_id: contract.id.clone(),
            });
        }
        Some(
            contract_categories
                .iter()
                .map(|c| (c.clone(), Decimal::ZERO))
                .collect(),
        )
    } else {
        None
    };

    let mut net_total = Decimal::ZERO;
    let mut gross_total = Decimal::ZERO;
    let mut returns_total = Decimal::ZERO;
    let mut reported_total = Decimal::ZERO;
    let mut unmapped: BTreeSet<String> = BTreeSet::new();

    for (row, _) in sheet.iter_data_rows() {
        let gross = number_at(sheet, row, columns.gross);
        let returns = number_at(sheet, row, columns.returns);
        let net = match columns.net {
            Some(_) => number_at(sheet, row, columns.net),
            None => checked(gross.checked_sub(returns), "net sales")?,
        };

        if let (Some(buckets), Some(col)) = (buckets.as_mut(), columns.category) {
            let label = sheet.cell(row, col).display();
            let label = label.trim();
            let target = categories
                .and_then(|m| m.resolve(label))
                .or_else(|| exact_match(label, &contract_categories).map(String::as_str));
            match target {
                Some(target) => {
                    let key = exact_match(target, &contract_categories).ok_or_else(|| {
                        RoyaltyError::UnknownContractCategory {
                            contract_id: contract.id.clone(),
                            category: target.to_string(),
                        }
                    })?;
                    if let Some(bucket) = buckets.get_mut(key) {
                        *bucket = checked(bucket.checked_add(net), "category sales")?;
                    }
                }
                None => {
                    let label = if label.is_empty() { BLANK_CATEGORY } else { label };
                    unmapped.insert(label.to_string());
                }
            }
        }

        net_total = checked(net_total.checked_add(net), "net sales")?;
        gross_total = checked(gross_total.checked_add(gross), "gross sales")?;
        returns_total = checked(returns_total.checked_add(returns), "returns")?;
        reported_total = checked(
            reported_total.checked_add(number_at(sheet, row, columns.reported)),
            "reported royalty",
        )?;
    }

    if !unmapped.is_empty() {
        return Err(RoyaltyError::UnmappedCategories {
            values: unmapped.into_iter().collect(),
        });
    }

    let mut rows_skipped: Vec<usize> = sheet
        .summary_rows
        .iter()
        .chain(sheet.text_rows.iter())
        .copied()
        .collect();
    rows_skipped.sort_unstable();
    if !rows_skipped.is_empty() {
        debug!("Rows excluded from aggregation: {:?}", rows_skipped);
    }

    let sales = AggregatedSales {
        net_sales: net_total,
        category_sales: buckets,
        licensee_reported_royalty: columns.reported.map(|_| reported_total),
        gross_sales: columns.gross.map(|_| gross_total),
        returns: columns.returns.map(|_| returns_total),
        rows_aggregated: sheet.data_rows,
        rows_skipped,
    };
    info!(
        "Aggregated {} rows: net sales {}, reported royalty {:?}",
        sales.rows_aggregated, sales.net_sales, sales.licensee_reported_royalty
    );
    Ok(sales)
}

/// Applies the contract's rates and minimum guarantee to aggregated sales.
pub fn calculate_royalty(sales: &AggregatedSales, contract: &Contract) -> Result<RoyaltyCalculation> {
    let (computed_royalty, category_royalties) = match &contract.rate_structure {
        RateStructure::Flat { rate } => (
            round_money(checked(sales.net_sales.checked_mul(*rate), "royalty")?),
            None,
        ),
        RateStructure::Category { rates } => {
            let by_category = sales.category_sales.as_ref().ok_or_else(|| {
                RoyaltyError::CategoryColumnMissing {
                    contract_id: contract.id.clone(),
                }
            })?;
            let mut raw_total = Decimal::ZERO;
            let mut royalties = BTreeMap::new();
            for (category, rate) in rates {
                let net = by_category.get(category).copied().unwrap_or(Decimal::ZERO);
                let royalty = checked(net.checked_mul(*rate), "royalty")?;
                raw_total = checked(raw_total.checked_add(royalty), "royalty")?;
                royalties.insert(category.clone(), round_money(royalty));
            }
            (round_money(raw_total), Some(royalties))
        }
        RateStructure::Tiered { tiers } => (
            checked(tiered_royalty(tiers, sales.net_sales), "royalty")?,
            None,
        ),
    };

    let (calculated_royalty, minimum_applied) = match contract.period_minimum() {
        Some(minimum) if computed_royalty < round_money(minimum) => {
            debug!(
                "Minimum guarantee {} applies over computed royalty {}",
                round_money(minimum),
                computed_royalty
            );
            (round_money(minimum), true)
        }
        _ => (computed_royalty, false),
    };

    Ok(RoyaltyCalculation {
        computed_royalty,
        calculated_royalty,
        category_royalties,
        minimum_applied,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::contract::{GuaranteeFrequency, MinimumGuarantee, RateTier, ReportingFrequency};
    use crate::extractor::extract;
    use crate::schema::CategoryProvenance;
    use rust_decimal_macros::dec;

    fn sheet(csv: &str) -> RawSheet {
        extract(csv.as_bytes(), "report.csv", &PipelineConfig::default()).unwrap()
    }

    fn mapping(pairs: &[(&str, SemanticField)]) -> ColumnMapping {
        pairs.iter().map(|(c, f)| (c.to_string(), *f)).collect()
    }

    fn flat_contract(rate: Decimal) -> Contract {
        Contract {
            id: "flat-1".to_string(),
            licensee_name: "Acme".to_string(),
            rate_structure: RateStructure::Flat { rate },
            start_date: None,
            end_date: None,
            reporting_frequency: Some(ReportingFrequency::Quarterly),
            minimum_guarantee: None,
        }
    }

    fn category_contract() -> Contract {
        let mut rates = BTreeMap::new();
        rates.insert("Apparel".to_string(), dec!(0.10));
        rates.insert("Accessories".to_string(), dec!(0.12));
        rates.insert("Footwear".to_string(), dec!(0.08));
        Contract {
            id: "cat-1".to_string(),
            licensee_name: "Acme".to_string(),
            rate_structure: RateStructure::Category { rates },
            start_date: None,
            end_date: None,
            reporting_frequency: Some(ReportingFrequency::Quarterly),
            minimum_guarantee: None,
        }
    }

    fn category_mapping() -> ColumnMapping {
        mapping(&[
            ("Product", SemanticField::Metadata),
            ("Category", SemanticField::ProductCategory),
            ("Net Sales", SemanticField::NetSales),
            ("Royalty Due", SemanticField::LicenseeReportedRoyalty),
        ])
    }

    #[test]
    fn test_flat_rate_from_gross_minus_returns() {
        let sheet = sheet("Product,Gross Sales,Returns,Royalty Due\nTee,87500,4200,6384\n");
        let mapping = mapping(&[
            ("Product", SemanticField::Metadata),
            ("Gross Sales", SemanticField::GrossSales),
            ("Returns", SemanticField::Returns),
            ("Royalty Due", SemanticField::LicenseeReportedRoyalty),
        ]);
        let contract = flat_contract(dec!(0.08));
        let sales = aggregate(&sheet, &mapping, None, &contract).unwrap();
        assert_eq!(sales.net_sales, dec!(83300));
        assert_eq!(sales.gross_sales, Some(dec!(87500)));
        assert_eq!(sales.returns, Some(dec!(4200)));
        assert_eq!(sales.licensee_reported_royalty, Some(dec!(6384)));

        let royalty = calculate_royalty(&sales, &contract).unwrap();
        assert_eq!(royalty.calculated_royalty, dec!(6664.00));
        assert!(!royalty.minimum_applied);
    }

    #[test]
    fn test_multi_row_flat_aggregation_excludes_total_row() {
        let sheet = sheet(
            "Product,Net Sales\n\
             Tee,\"$49,900.00\"\n\
             Hoodie,35300\n\
             Cap,14200\n\
             TOTAL,123456\n",
        );
        let mapping = mapping(&[
            ("Product", SemanticField::Metadata),
            ("Net Sales", SemanticField::NetSales),
        ]);
        let contract = flat_contract(dec!(0.08));
        let sales = aggregate(&sheet, &mapping, None, &contract).unwrap();
        assert_eq!(sales.net_sales, dec!(99400));
        assert_eq!(sales.rows_aggregated, 3);
        assert_eq!(sales.rows_skipped, vec![4]);
        assert_eq!(sales.licensee_reported_royalty, None);
        assert_eq!(
            calculate_royalty(&sales, &contract).unwrap().calculated_royalty,
            dec!(7952.00)
        );
    }

    #[test]
    fn test_royalty_is_sum_then_multiply() {
        // Per-row rounding would give 3 x 0.01 = 0.03.
        let sheet = sheet("Product,Net Sales\nA,0.05\nB,0.05\nC,0.05\n");
        let mapping = mapping(&[
            ("Product", SemanticField::Metadata),
            ("Net Sales", SemanticField::NetSales),
        ]);
        let contract = flat_contract(dec!(0.10));
        let sales = aggregate(&sheet, &mapping, None, &contract).unwrap();
        let royalty = calculate_royalty(&sales, &contract).unwrap();
        assert_eq!(royalty.calculated_royalty, dec!(0.02));
    }

    #[test]
    fn test_flat_contract_ignores_category_labels() {
        let sheet = sheet("Category,Net Sales\nApparel,100\nMystery,50\n");
        let mapping = mapping(&[
            ("Category", SemanticField::ProductCategory),
            ("Net Sales", SemanticField::NetSales),
        ]);
        let sales = aggregate(&sheet, &mapping, None, &flat_contract(dec!(0.1))).unwrap();
        assert_eq!(sales.net_sales, dec!(150));
        assert!(sales.category_sales.is_none());
    }

    #[test]
    fn test_category_rates_with_underreported_accessories() {
        let sheet = sheet(
            "Product,Category,Net Sales,Royalty Due\n\
             Tee,Apparel,60000,6000\n\
             Jeans,Apparel,40000,4000\n\
             Sneaker,Footwear,50000,4000\n\
             Belt,Accessories,36150,3615\n\
             Wallet,Accessories,25000,2500\n",
        );
        let contract = category_contract();
        let sales = aggregate(&sheet, &category_mapping(), None, &contract).unwrap();
        let breakdown = sales.category_sales.clone().unwrap();
        assert_eq!(breakdown["Accessories"], dec!(61150));
        assert_eq!(breakdown["Apparel"], dec!(100000));
        assert_eq!(sales.licensee_reported_royalty, Some(dec!(20115)));

        let royalty = calculate_royalty(&sales, &contract).unwrap();
        let per_category = royalty.category_royalties.unwrap();
        assert_eq!(per_category["Accessories"], dec!(7338.00));
        assert_eq!(per_category["Apparel"], dec!(10000.00));
        assert_eq!(per_category["Footwear"], dec!(4000.00));
        assert_eq!(royalty.calculated_royalty, dec!(21338.00));
        assert_eq!(royalty.calculated_royalty - dec!(20115), dec!(1223.00));
    }

    #[test]
    fn test_zero_category_retained() {
        let sheet = sheet("Category,Net Sales\nApparel,1000\nFootwear,0\n");
        let mapping = mapping(&[
            ("Category", SemanticField::ProductCategory),
            ("Net Sales", SemanticField::NetSales),
        ]);
        let contract = category_contract();
        let sales = aggregate(&sheet, &mapping, None, &contract).unwrap();
        let breakdown = sales.category_sales.clone().unwrap();
        assert_eq!(breakdown.len(), 3);
        assert_eq!(breakdown["Accessories"], Decimal::ZERO);
        assert_eq!(breakdown["Footwear"], Decimal::ZERO);
        assert_eq!(breakdown.values().copied().sum::<Decimal>(), sales.net_sales);

        let royalty = calculate_royalty(&sales, &contract).unwrap();
        assert_eq!(royalty.category_royalties.unwrap()["Accessories"], Decimal::ZERO);
    }

    #[test]
    fn test_category_buckets_are_isolated() {
        let mapping = mapping(&[
            ("Category", SemanticField::ProductCategory),
            ("Net Sales", SemanticField::NetSales),
        ]);
        let contract = category_contract();
        let before = aggregate(
            &sheet("Category,Net Sales\nApparel,1000\nFootwear,500\n"),
            &mapping,
            None,
            &contract,
        )
        .unwrap();
        let after = aggregate(
            &sheet("Category,Net Sales\nApparel,1000\nFootwear,500\nApparel,250\n"),
            &mapping,
            None,
            &contract,
        )
        .unwrap();

        let before_royalty = calculate_royalty(&before, &contract).unwrap();
        let after_royalty = calculate_royalty(&after, &contract).unwrap();
        let (b, a) = (
            before.category_sales.unwrap(),
            after.category_sales.unwrap(),
        );
        assert_eq!(b["Footwear"], a["Footwear"]);
        assert_eq!(a["Apparel"] - b["Apparel"], dec!(250));
        assert_eq!(
            before_royalty.category_royalties.unwrap()["Footwear"],
            after_royalty.category_royalties.unwrap()["Footwear"]
        );
    }

    #[test]
    fn test_aliases_resolve_and_unmapped_values_fail() {
        let sheet = sheet(
            "Category,Net Sales\n\
             Tops & Bottoms,1000\n\
             Hard Accessories,400\n\
             Footwear,300\n",
        );
        let mapping = mapping(&[
            ("Category", SemanticField::ProductCategory),
            ("Net Sales", SemanticField::NetSales),
        ]);
        let contract = category_contract();

        let mut aliases = CategoryMapping::new();
        aliases.insert("Tops & Bottoms", Some("Apparel".into()), CategoryProvenance::Manual);
        aliases.insert(
            "Hard Accessories",
            Some("Accessories".into()),
            CategoryProvenance::Manual,
        );
        let sales = aggregate(&sheet, &mapping, Some(&aliases), &contract).unwrap();
        let breakdown = sales.category_sales.unwrap();
        assert_eq!(breakdown["Apparel"], dec!(1000));
        assert_eq!(breakdown["Accessories"], dec!(400));
        assert_eq!(breakdown["Footwear"], dec!(300));

        let mut partial = CategoryMapping::new();
        partial.insert("Tops & Bottoms", Some("Apparel".into()), CategoryProvenance::Manual);
        partial.insert("Hard Accessories", None, CategoryProvenance::Unmapped);
        let err = aggregate(&sheet, &mapping, Some(&partial), &contract).unwrap_err();
        match err {
            RoyaltyError::UnmappedCategories { values } => {
                assert_eq!(values, vec!["Hard Accessories".to_string()])
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_alias_to_unknown_category_is_rejected() {
        let sheet = sheet("Category,Net Sales\nGadgets,10\n");
        let mapping = mapping(&[
            ("Category", SemanticField::ProductCategory),
            ("Net Sales", SemanticField::NetSales),
        ]);
        let mut aliases = CategoryMapping::new();
        aliases.insert("Gadgets", Some("Electronics".into()), CategoryProvenance::Manual);
        let err = aggregate(&sheet, &mapping, Some(&aliases), &category_contract()).unwrap_err();
        assert!(matches!(err, RoyaltyError::UnknownContractCategory { .. }));
    }

    #[test]
    fn test_category_contract_without_category_column() {
        let sheet = sheet("Product,Net Sales\nTee,10\n");
        let mapping = mapping(&[
            ("Product", SemanticField::Metadata),
            ("Net Sales", SemanticField::NetSales),
        ]);
        let err = aggregate(&sheet, &mapping, None, &category_contract()).unwrap_err();
        assert!(matches!(err, RoyaltyError::CategoryColumnMissing { .. }));
    }

    #[test]
    fn test_missing_net_sales_is_invalid_mapping() {
        let sheet = sheet("Product,Gross Sales\nTee,10\n");
        let mapping = mapping(&[
            ("Product", SemanticField::Metadata),
            ("Gross Sales", SemanticField::GrossSales),
        ]);
        let err = aggregate(&sheet, &mapping, None, &flat_contract(dec!(0.1))).unwrap_err();
        assert!(matches!(err, RoyaltyError::InvalidMapping { .. }));
    }

    #[test]
    fn test_tiered_and_minimum_guarantee() {
        let sheet = sheet("Product,Net Sales\nTee,150000\n");
        let mapping = mapping(&[
            ("Product", SemanticField::Metadata),
            ("Net Sales", SemanticField::NetSales),
        ]);
        let mut contract = flat_contract(Decimal::ZERO);
        contract.rate_structure = RateStructure::Tiered {
            tiers: vec![
                RateTier {
                    min_sales: dec!(0),
                    max_sales: Some(dec!(100000)),
                    rate: dec!(0.05),
                },
                RateTier {
                    min_sales: dec!(100000),
                    max_sales: None,
                    rate: dec!(0.07),
                },
            ],
        };
        let sales = aggregate(&sheet, &mapping, None, &contract).unwrap();
        let royalty = calculate_royalty(&sales, &contract).unwrap();
        assert_eq!(royalty.calculated_royalty, dec!(10500.00));

        contract.minimum_guarantee = Some(MinimumGuarantee {
            amount: dec!(50000),
            frequency: GuaranteeFrequency::Annual,
        });
        let royalty = calculate_royalty(&sales, &contract).unwrap();
        assert_eq!(royalty.computed_royalty, dec!(10500.00));
        assert_eq!(royalty.calculated_royalty, dec!(12500.00));
        assert!(royalty.minimum_applied);

        contract.minimum_guarantee = Some(MinimumGuarantee {
            amount: dec!(5000),
            frequency: GuaranteeFrequency::PerPeriod,
        });
        let royalty = calculate_royalty(&sales, &contract).unwrap();
        assert!(!royalty.minimum_applied);
        assert_eq!(royalty.calculated_royalty, dec!(10500.00));
    }

    #[test]
    fn test_sales_too_large_to_sum_are_rejected() {
        let sheet = sheet(
            "Product,Net Sales\n\
             Tee,50000000000000000000000000000\n\
             Hoodie,50000000000000000000000000000\n",
        );
        let mapping = mapping(&[
            ("Product", SemanticField::Metadata),
            ("Net Sales", SemanticField::NetSales),
        ]);
        let err = aggregate(&sheet, &mapping, None, &flat_contract(dec!(0.08))).unwrap_err();
        assert!(matches!(err, RoyaltyError::AmountOverflow(_)));
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }

    #[test]
    fn test_royalty_too_large_to_compute_is_rejected() {
        let sheet = sheet("Product,Net Sales\nTee,70000000000000000000000000000\n");
        let mapping = mapping(&[
            ("Product", SemanticField::Metadata),
            ("Net Sales", SemanticField::NetSales),
        ]);
        let contract = flat_contract(dec!(2));
        let sales = aggregate(&sheet, &mapping, None, &contract).unwrap();
        let err = calculate_royalty(&sales, &contract).unwrap_err();
        assert!(matches!(err, RoyaltyError::AmountOverflow(_)));
    }
}
