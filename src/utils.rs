use crate::error::{Result, RoyaltyError};
use chrono::{Days, Months, NaiveDate};
use rust_decimal::{Decimal, RoundingStrategy};
use std::str::FromStr;

/// Rounds a money amount to cents, half away from zero.
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Parses a spreadsheet money cell: `$1,234.50`, `(200.00)`, `1,234-`, `€ 12`.
///
/// Any letter in the text rejects it, so SKUs such as `AB-1200` never read as numbers.
pub fn parse_amount(raw: &str) -> Option<Decimal> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }

    let (paren_negative, s) = match s.strip_prefix('(').and_then(|r| r.strip_suffix(')')) {
        Some(inner) => (true, inner.trim()),
        None => (false, s),
    };
    let (trailing_negative, s) = match s.strip_suffix('-') {
        Some(inner) => (true, inner.trim()),
        None => (false, s),
    };

    let mut cleaned = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '0'..='9' | '.' | '-' | '+' => cleaned.push(ch),
            ',' | ' ' | '\u{a0}' | '$' | '€' | '£' | '¥' => {}
            _ => return None,
        }
    }
    if !cleaned.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }

    let mut amount = Decimal::from_str(&cleaned).ok()?;
    if (paren_negative || trailing_negative) && amount > Decimal::ZERO {
        amount = -amount;
    }
    Some(amount)
}

const DATE_FORMATS: [&str; 8] = [
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%m/%d/%Y",
    "%m/%d/%y",
    "%d.%m.%Y",
    "%b %d, %Y",
    "%B %d, %Y",
    "%d-%b-%Y",
];

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let s = raw.trim();
    // Datetime strings such as "2024-03-31T00:00:00"
    let s = s.split('T').next().unwrap_or(s);
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
}

/// Converts an Excel serial day number (1900 date system) to a date.
pub fn excel_serial_to_date(serial: f64) -> Option<NaiveDate> {
    if !serial.is_finite() || serial < 1.0 {
        return None;
    }
    // The 1899-12-30 epoch absorbs Excel's fictitious 1900-02-29.
    let epoch = NaiveDate::from_ymd_opt(1899, 12, 30)?;
    epoch.checked_add_days(Days::new(serial.trunc() as u64))
}

/// Lowercases, trims and collapses all whitespace runs to one space.
pub fn normalize_label(label: &str) -> String {
    label
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Inclusive number of days covered by a period.
pub fn period_days(start: NaiveDate, end: NaiveDate) -> i64 {
    (end - start).num_days() + 1
}

/// The day before `start + months`, e.g. 2024-01-01 + 3 months -> 2024-03-31.
pub fn standard_period_end(start: NaiveDate, months: u32) -> Option<NaiveDate> {
    start
        .checked_add_months(Months::new(months))?
        .checked_sub_days(Days::new(1))
}

pub fn validate_period(start: NaiveDate, end: NaiveDate) -> Result<()> {
    if end < start {
        return Err(RoyaltyError::InvalidPeriod(format!(
            "period end {} is before period start {}",
            end, start
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_amount_formats() {
        assert_eq!(parse_amount("$87,500.00"), Some(dec!(87500.00)));
        assert_eq!(parse_amount("  4200 "), Some(dec!(4200)));
        assert_eq!(parse_amount("(1,250.50)"), Some(dec!(-1250.50)));
        assert_eq!(parse_amount("300-"), Some(dec!(-300)));
        assert_eq!(parse_amount("-12.5"), Some(dec!(-12.5)));
        assert_eq!(parse_amount("€ 1 000"), Some(dec!(1000)));
    }

    #[test]
    fn test_parse_amount_rejects_text() {
        assert_eq!(parse_amount(""), None);
        assert_eq!(parse_amount("AB-1200"), None);
        assert_eq!(parse_amount("Total"), None);
        assert_eq!(parse_amount("$"), None);
        assert_eq!(parse_amount("8%"), None);
    }

    #[test]
    fn test_round_money_half_away_from_zero() {
        assert_eq!(round_money(dec!(0.005)), dec!(0.01));
        assert_eq!(round_money(dec!(-0.005)), dec!(-0.01));
        assert_eq!(round_money(dec!(6664.0)), dec!(6664.00));
    }

    #[test]
    fn test_parse_date_and_excel_serial() {
        assert_eq!(
            parse_date("2024-03-31"),
            NaiveDate::from_ymd_opt(2024, 3, 31)
        );
        assert_eq!(parse_date("3/31/2024"), NaiveDate::from_ymd_opt(2024, 3, 31));
        assert_eq!(parse_date("Q1 2024"), None);
        assert_eq!(
            excel_serial_to_date(45382.0),
            NaiveDate::from_ymd_opt(2024, 3, 31)
        );
    }

    #[test]
    fn test_normalize_label() {
        assert_eq!(normalize_label("  Net\n  Sales\tUSD "), "net sales usd");
    }

    #[test]
    fn test_standard_period_end_and_days() {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        assert_eq!(
            standard_period_end(start, 3),
            NaiveDate::from_ymd_opt(2024, 3, 31)
        );
        assert_eq!(
            period_days(start, NaiveDate::from_ymd_opt(2024, 3, 31).unwrap()),
            91
        );
        assert_eq!(
            standard_period_end(NaiveDate::from_ymd_opt(2023, 12, 1).unwrap(), 3),
            NaiveDate::from_ymd_opt(2024, 2, 29)
        );
    }

    #[test]
    fn test_validate_period_rejects_reversed_range() {
        let a = NaiveDate::from_ymd_opt(2024, 3, 31).unwrap();
        let b = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        assert!(validate_period(b, a).is_ok());
        assert!(validate_period(a, b).is_err());
    }
}
