//! Obligation arithmetic shared by discovery seeding and the runtime matcher
//!
//! Everything here is a pure function of its inputs: tolerance windows per
//! pattern case, the next-date roll, forecast amount ranges, and the
//! composite score used to rank candidate patterns for an ambiguous
//! transaction.

use chrono::{Duration, NaiveDate};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;

use crate::models::{AmountBehaviour, Obligation, PatternCase};

/// Matching tolerance in whole days for a pattern case
///
/// Intervals below 10 days are rejected at discovery, so the custom formula
/// covers every cadence shorter than monthly.
pub fn tolerance_days(case: PatternCase, interval_days: i64) -> i64 {
    match case {
        PatternCase::FixedMonthly | PatternCase::VariableMonthly | PatternCase::FlexibleMonthly => {
            3
        }
        PatternCase::BiMonthly => 5,
        PatternCase::Quarterly => 7,
        PatternCase::CustomInterval => ((interval_days as f64 * 0.15).round() as i64).max(2),
    }
}

/// Next expected date, anchored on the prior obligation's expected date
///
/// The anchor is the prior *expected* date, never the fulfilment date, so
/// the schedule cannot drift when payments land early or late.
pub fn next_expected_date(prior_expected: NaiveDate, interval_days: i64) -> NaiveDate {
    prior_expected + Duration::days(interval_days)
}

/// Forecast amount range for the next obligation
///
/// `window` holds the amounts of the most recent inlier transactions
/// (typically three, newest first). The range is for budgeting and outlier
/// flagging only; matching never enforces amounts.
pub fn estimate_amount_range(
    window: &[Decimal],
    behaviour: AmountBehaviour,
    representative: Decimal,
) -> (Decimal, Decimal) {
    if window.is_empty() || behaviour == AmountBehaviour::Fixed {
        return (representative, representative);
    }

    let min = window.iter().min().copied().unwrap_or(representative);
    let max = window.iter().max().copied().unwrap_or(representative);

    match behaviour {
        AmountBehaviour::Fixed => (representative, representative),
        AmountBehaviour::Variable => {
            let mean = window.iter().sum::<Decimal>() / Decimal::from(window.len());
            let sigma = stddev(window, mean);

            let floor = min * Decimal::new(95, 2);
            let cap = max * Decimal::new(105, 2);
            let lower = (mean - sigma).max(floor).round_dp(2);
            let upper = (mean + sigma).min(cap).round_dp(2);
            (lower, upper)
        }
        AmountBehaviour::HighlyVariable => (min, max),
    }
}

/// Composite score for pattern priority on ambiguity; lower is tighter
///
/// `|date - expected| / tolerance + max(0, distance(amount, [min, max])) / max`
/// Ties are broken on the lowest pattern id by the caller.
pub fn ambiguity_score(date: NaiveDate, amount: Decimal, obligation: &Obligation) -> f64 {
    let tolerance = obligation.tolerance_days.max(1) as f64;
    let date_term = (date - obligation.expected_date).num_days().abs() as f64 / tolerance;

    let amount_term = match (obligation.expected_min_amount, obligation.expected_max_amount) {
        (Some(min), Some(max)) if max > Decimal::ZERO => {
            let distance = if amount < min {
                min - amount
            } else if amount > max {
                amount - max
            } else {
                Decimal::ZERO
            };
            (distance / max).to_f64().unwrap_or(0.0)
        }
        _ => 0.0,
    };

    date_term + amount_term
}

fn stddev(values: &[Decimal], mean: Decimal) -> Decimal {
    if values.len() < 2 {
        return Decimal::ZERO;
    }
    let variance = values
        .iter()
        .map(|v| {
            let d = (*v - mean).to_f64().unwrap_or(0.0);
            d * d
        })
        .sum::<f64>()
        / values.len() as f64;
    Decimal::from_f64(variance.sqrt()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ObligationStatus;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn obligation(expected: NaiveDate, tolerance: i64, min: Decimal, max: Decimal) -> Obligation {
        Obligation {
            id: 1,
            pattern_id: 1,
            expected_date: expected,
            tolerance_days: tolerance,
            expected_min_amount: Some(min),
            expected_max_amount: Some(max),
            status: ObligationStatus::Expected,
            fulfilled_by_transaction_id: None,
            fulfilled_at: None,
            days_early: None,
            created_at: Utc::now(),
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_tolerance_by_case() {
        assert_eq!(tolerance_days(PatternCase::FixedMonthly, 30), 3);
        assert_eq!(tolerance_days(PatternCase::VariableMonthly, 31), 3);
        assert_eq!(tolerance_days(PatternCase::FlexibleMonthly, 29), 3);
        assert_eq!(tolerance_days(PatternCase::BiMonthly, 60), 5);
        assert_eq!(tolerance_days(PatternCase::Quarterly, 90), 7);
        // 0.15 * 28 = 4.2 -> 4
        assert_eq!(tolerance_days(PatternCase::CustomInterval, 28), 4);
        // 0.15 * 11 = 1.65 -> 2, still floored at 2
        assert_eq!(tolerance_days(PatternCase::CustomInterval, 11), 2);
        assert_eq!(tolerance_days(PatternCase::CustomInterval, 400), 60);
    }

    #[test]
    fn test_next_expected_anchors_on_expected() {
        let next = next_expected_date(date(2025, 12, 30), 30);
        assert_eq!(next, date(2026, 1, 29));
    }

    #[test]
    fn test_amount_range_fixed() {
        let window = vec![dec!(16500), dec!(16500), dec!(16500)];
        let (lo, hi) = estimate_amount_range(&window, AmountBehaviour::Fixed, dec!(16500));
        assert_eq!(lo, dec!(16500));
        assert_eq!(hi, dec!(16500));
    }

    #[test]
    fn test_amount_range_variable_clamped() {
        let window = vec![dec!(4000), dec!(5000), dec!(4000)];
        let (lo, hi) = estimate_amount_range(&window, AmountBehaviour::Variable, dec!(4000));
        // mean 4333.33, sigma ~471; lower clamped up to 0.95 * 4000
        assert!(lo >= dec!(3800));
        assert!(hi <= dec!(5250));
        assert!(lo < hi);
    }

    #[test]
    fn test_amount_range_highly_variable() {
        let window = vec![dec!(900), dec!(3200), dec!(1500)];
        let (lo, hi) = estimate_amount_range(&window, AmountBehaviour::HighlyVariable, dec!(1500));
        assert_eq!(lo, dec!(900));
        assert_eq!(hi, dec!(3200));
    }

    #[test]
    fn test_amount_range_empty_window_falls_back() {
        let (lo, hi) = estimate_amount_range(&[], AmountBehaviour::Variable, dec!(199));
        assert_eq!(lo, dec!(199));
        assert_eq!(hi, dec!(199));
    }

    #[test]
    fn test_ambiguity_score_prefers_tighter_date() {
        let obl = obligation(date(2026, 1, 15), 3, dec!(4000), dec!(5000));
        let exact = ambiguity_score(date(2026, 1, 15), dec!(4500), &obl);
        let edge = ambiguity_score(date(2026, 1, 18), dec!(4500), &obl);
        assert!(exact < edge);
        assert_eq!(exact, 0.0);
    }

    #[test]
    fn test_ambiguity_score_penalises_amount_outside_band() {
        let obl = obligation(date(2026, 1, 15), 3, dec!(4000), dec!(5000));
        let inside = ambiguity_score(date(2026, 1, 15), dec!(4200), &obl);
        let outside = ambiguity_score(date(2026, 1, 15), dec!(9000), &obl);
        assert!(inside < outside);
    }
}
