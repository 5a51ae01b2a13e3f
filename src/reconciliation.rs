//! Discrepancy against the licensee's own figure, and the advisory checks on
//! a requested reporting period.

use crate::contract::{Contract, ReportingFrequency};
use crate::error::{Result, RoyaltyError};
use crate::schema::{Discrepancy, OverlapRecord, SalesPeriod};
use crate::utils::{period_days, standard_period_end};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// `calculated - reported`; flagged only when the gap strictly exceeds `tolerance`.
pub fn compute_discrepancy(
    calculated: Decimal,
    reported: Option<Decimal>,
    tolerance: Decimal,
) -> Result<Discrepancy> {
    match reported {
        Some(reported) => {
            let amount = calculated
                .checked_sub(reported)
                .ok_or_else(|| RoyaltyError::AmountOverflow("discrepancy".to_string()))?;
            Ok(Discrepancy {
                discrepancy_amount: Some(amount),
                has_discrepancy: amount.abs() > tolerance,
            })
        }
        None => Ok(Discrepancy {
            discrepancy_amount: None,
            has_discrepancy: false,
        }),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OverlapInfo {
    pub has_overlap: bool,
    pub records: Vec<OverlapRecord>,
}

impl OverlapInfo {
    pub fn from_existing(existing: &[SalesPeriod], start: NaiveDate, end: NaiveDate) -> Self {
        let records: Vec<OverlapRecord> = existing
            .iter()
            .filter(|p| p.overlaps(start, end))
            .map(SalesPeriod::summary)
            .collect();
        Self {
            has_overlap: !records.is_empty(),
            records,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RangeInfo {
    pub starts_before_contract: bool,
    pub ends_after_contract: bool,
    pub contract_start: Option<NaiveDate>,
    pub contract_end: Option<NaiveDate>,
}

impl RangeInfo {
    pub fn check(contract: &Contract, start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            starts_before_contract: contract.start_date.is_some_and(|s| start < s),
            ends_after_contract: contract.end_date.is_some_and(|e| end > e),
            contract_start: contract.start_date,
            contract_end: contract.end_date,
        }
    }

    pub fn outside_contract(&self) -> bool {
        self.starts_before_contract || self.ends_after_contract
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrequencyInfo {
    pub frequency: Option<ReportingFrequency>,
    pub period_days: i64,
    /// Inclusive day-span window for the declared frequency
    pub expected_days: Option<(i64, i64)>,
    pub unusual_length: bool,
    /// Standard period end for this start date, when the requested end is close to but not on it
    pub suggested_end: Option<NaiveDate>,
}

impl FrequencyInfo {
    pub fn check(contract: &Contract, start: NaiveDate, end: NaiveDate) -> Self {
        let days = period_days(start, end);
        let Some(frequency) = contract.reporting_frequency else {
            return Self {
                frequency: None,
                period_days: days,
                expected_days: None,
                unusual_length: false,
                suggested_end: None,
            };
        };

        let (min, max) = frequency.expected_days();
        let suggested_end = standard_period_end(start, frequency.months()).filter(|standard| {
            let standard_days = period_days(start, *standard);
            *standard != end && (days - standard_days).abs() <= standard_days / 2
        });

        Self {
            frequency: Some(frequency),
            period_days: days,
            expected_days: Some((min, max)),
            unusual_length: days < min || days > max,
            suggested_end,
        }
    }
}

/// Advisory findings for a requested period. Only the overlap blocks a confirm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodCheckReport {
    pub contract_id: String,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub overlap: OverlapInfo,
    pub range: RangeInfo,
    pub frequency: FrequencyInfo,
}

impl PeriodCheckReport {
    pub fn build(
        contract: &Contract,
        start: NaiveDate,
        end: NaiveDate,
        existing: &[SalesPeriod],
    ) -> Self {
        Self {
            contract_id: contract.id.clone(),
            period_start: start,
            period_end: end,
            overlap: OverlapInfo::from_existing(existing, start, end),
            range: RangeInfo::check(contract, start, end),
            frequency: FrequencyInfo::check(contract, start, end),
        }
    }

    pub fn is_clear(&self) -> bool {
        self.warnings().is_empty()
    }

    /// Human-readable warnings, in the order overlap, range, frequency.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        for record in &self.overlap.records {
            warnings.push(format!(
                "A sales period from {} to {} already exists (net sales {}, royalty {})",
                record.period_start, record.period_end, record.net_sales, record.calculated_royalty
            ));
        }

        if self.range.starts_before_contract {
            if let Some(start) = self.range.contract_start {
                warnings.push(format!(
                    "Period starts {} before the contract start date {}",
                    self.period_start, start
                ));
            }
        }
        if self.range.ends_after_contract {
            if let Some(end) = self.range.contract_end {
                warnings.push(format!(
                    "Period ends {} after the contract end date {}",
                    self.period_end, end
                ));
            }
        }

        if let (true, Some(frequency), Some((min, max))) = (
            self.frequency.unusual_length,
            self.frequency.frequency,
            self.frequency.expected_days,
        ) {
            warnings.push(format!(
                "Period covers {} days; {:?} reporting periods usually cover {} to {} days",
                self.frequency.period_days, frequency, min, max
            ));
        }
        if let Some(suggested) = self.frequency.suggested_end {
            warnings.push(format!("Did you mean to end the period on {}?", suggested));
        }

        warnings
    }
}
