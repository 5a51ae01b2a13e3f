use crate::utils::round_money;
use chrono::NaiveDate;
use log::warn;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The royalty terms of a licensing contract, as far as this crate needs them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    pub id: String,
    pub licensee_name: String,
    pub rate_structure: RateStructure,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub reporting_frequency: Option<ReportingFrequency>,
    pub minimum_guarantee: Option<MinimumGuarantee>,
}

impl Contract {
    pub fn is_category_based(&self) -> bool {
        matches!(self.rate_structure, RateStructure::Category { .. })
    }

    /// Configured category names (empty unless the contract is category-based).
    pub fn category_names(&self) -> Vec<String> {
        match &self.rate_structure {
            RateStructure::Category { rates } => rates.keys().cloned().collect(),
            _ => Vec::new(),
        }
    }

    /// The minimum royalty owed for a single reporting period, if any.
    pub fn period_minimum(&self) -> Option<Decimal> {
        let guarantee = self.minimum_guarantee.as_ref()?;
        match guarantee.frequency {
            GuaranteeFrequency::PerPeriod => Some(guarantee.amount),
            GuaranteeFrequency::Annual => {
                let Some(frequency) = self.reporting_frequency else {
                    warn!(
                        "Contract {} has an annual minimum but no reporting frequency; no per-period floor applied",
                        self.id
                    );
                    return None;
                };
                Some(guarantee.amount / Decimal::from(frequency.periods_per_year()))
            }
        }
    }
}

/// Rates are fractions: 0.08 means 8%.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RateStructure {
    Flat { rate: Decimal },
    Category { rates: BTreeMap<String, Decimal> },
    Tiered { tiers: Vec<RateTier> },
}

/// A `[min_sales, max_sales)` band. An absent `max_sales` is open-ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateTier {
    pub min_sales: Decimal,
    pub max_sales: Option<Decimal>,
    pub rate: Decimal,
}

impl RateTier {
    fn contains(&self, amount: Decimal) -> bool {
        amount >= self.min_sales && self.max_sales.map_or(true, |max| amount < max)
    }
}

/// The rate of the band that total net sales falls into; applies to the whole total.
pub fn tiered_rate(tiers: &[RateTier], net_sales: Decimal) -> Decimal {
    if let Some(tier) = tiers.iter().find(|t| t.contains(net_sales)) {
        return tier.rate;
    }
    // Below the lowest band, or in a gap: the highest band starting at or below the amount.
    tiers
        .iter()
        .filter(|t| t.min_sales <= net_sales)
        .max_by(|a, b| a.min_sales.cmp(&b.min_sales))
        .or_else(|| tiers.iter().min_by(|a, b| a.min_sales.cmp(&b.min_sales)))
        .map(|t| t.rate)
        .unwrap_or(Decimal::ZERO)
}

/// `None` when the product overflows.
pub fn tiered_royalty(tiers: &[RateTier], net_sales: Decimal) -> Option<Decimal> {
    net_sales
        .checked_mul(tiered_rate(tiers, net_sales))
        .map(round_money)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportingFrequency {
    Monthly,
    Quarterly,
    SemiAnnually,
    Annually,
}

impl ReportingFrequency {
    pub fn months(&self) -> u32 {
        match self {
            ReportingFrequency::Monthly => 1,
            ReportingFrequency::Quarterly => 3,
            ReportingFrequency::SemiAnnually => 6,
            ReportingFrequency::Annually => 12,
        }
    }

    pub fn periods_per_year(&self) -> u32 {
        12 / self.months()
    }

    /// Inclusive day-span window a period of this frequency is expected to fall in.
    pub fn expected_days(&self) -> (i64, i64) {
        match self {
            ReportingFrequency::Monthly => (20, 45),
            ReportingFrequency::Quarterly => (45, 135),
            ReportingFrequency::SemiAnnually => (135, 225),
            ReportingFrequency::Annually => (300, 430),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinimumGuarantee {
    pub amount: Decimal,
    pub frequency: GuaranteeFrequency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuaranteeFrequency {
    /// The amount is the floor for every reporting period
    PerPeriod,
    /// The amount is a yearly floor, pro-rated across reporting periods
    Annual,
}
