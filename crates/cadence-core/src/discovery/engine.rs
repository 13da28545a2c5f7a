//! Deterministic pattern discovery engine
//!
//! Turns one candidate cluster into at most one pattern candidate. Every
//! stage can reject the cluster with a reason; nothing here is learned or
//! probabilistic, so identical inputs always produce identical output.
//!
//! Interval-in-days between observed transactions is the authoritative
//! signal throughout. Calendar-month bucketing is deliberately absent: a
//! payroll landing on Oct 31 and then Dec 1 is a clean ~30-day series even
//! though it skips November entirely.

use std::collections::HashSet;

use chrono::{Datelike, NaiveDate};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::debug;

use super::cluster::{amount_tolerance, circle_day, Cluster};
use super::{DiscoveryConfig, SkipReason};
use crate::models::{AmountBehaviour, PatternCase, Transaction};

/// A validated candidate recurring pattern, ready for persistence
#[derive(Debug, Clone)]
pub struct PatternCandidate {
    pub pattern_case: PatternCase,
    pub amount_behaviour: AmountBehaviour,
    pub interval_days: i64,
    /// Median of the inlier amount band
    pub representative_amount: Decimal,
    /// Full observed range, outliers included
    pub amount_min: Decimal,
    pub amount_max: Decimal,
    pub day_of_month_hint: Option<u32>,
    pub confidence: f64,
    /// Every transaction in the cluster; outliers stay linked
    pub transactions: Vec<Transaction>,
    /// Amounts of the most recent inlier transactions (up to three)
    pub recent_inlier_amounts: Vec<Decimal>,
    pub last_transaction_date: NaiveDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IntervalClass {
    Monthly,
    BiMonthly,
    Quarterly,
    Custom,
}

/// Run the discovery pipeline over one cluster
pub fn evaluate_cluster(
    cluster: &Cluster,
    config: &DiscoveryConfig,
) -> std::result::Result<PatternCandidate, SkipReason> {
    // Stage 0: sort, dedupe, and require enough observations. Upstream
    // guarantees unique source messages, so duplicates here are defects
    // rather than data.
    let mut txns = cluster.transactions.clone();
    txns.sort_by_key(|t| (t.occurred_at, t.id));
    let mut seen = HashSet::new();
    txns.retain(|t| seen.insert(t.id));

    if txns.len() < config.min_transactions {
        return Err(SkipReason::ClusterTooSmall);
    }

    let dates: Vec<NaiveDate> = txns.iter().map(|t| t.date()).collect();

    // Stage 2: frequent-purchase gate. More than the allowed transaction
    // count inside any rolling 30-day window marks a shopping relationship,
    // not an obligation. Calendar months are a forbidden signal here;
    // the window slides over observed dates.
    let mut start = 0;
    for end in 0..dates.len() {
        while (dates[end] - dates[start]).num_days() > config.rolling_window_days {
            start += 1;
        }
        if end - start + 1 > config.max_per_rolling_window {
            return Err(SkipReason::TooFrequent);
        }
    }

    let raw_intervals = day_intervals(&dates);
    let intervals: Vec<i64> = raw_intervals
        .iter()
        .copied()
        .filter(|d| *d >= config.min_interval_days)
        .collect();
    if intervals.len() < 2 {
        return Err(SkipReason::TooFrequent);
    }

    // Stage 3: interval stability on the full cluster
    if stable_interval(&intervals).is_none() {
        return Err(SkipReason::UnstableInterval);
    }

    // Stage 5: dominant amount band. Outliers are withheld from amount
    // statistics but remain part of the pattern.
    let mut inlier_idx = largest_amount_band(&txns, config);
    // Back to date order; band selection sorts by amount
    inlier_idx.sort_unstable();
    let inlier_share = inlier_idx.len() as f64 / txns.len() as f64;
    if inlier_share < config.inlier_share_floor {
        return Err(SkipReason::NoDominantAmountBand);
    }

    let inliers: Vec<&Transaction> = inlier_idx.iter().map(|i| &txns[*i]).collect();
    let inlier_dates: Vec<NaiveDate> = inliers.iter().map(|t| t.date()).collect();

    // Stage 6: recompute interval statistics without the outlier dates;
    // the cluster must stay stable on its own inliers.
    let inlier_intervals: Vec<i64> = day_intervals(&inlier_dates)
        .into_iter()
        .filter(|d| *d >= config.min_interval_days)
        .collect();
    if inlier_intervals.len() < 2 {
        return Err(SkipReason::UnstableWithoutOutliers);
    }
    let interval_days = match stable_interval(&inlier_intervals) {
        Some(days) => days,
        None => return Err(SkipReason::UnstableWithoutOutliers),
    };

    // Stage 4 on the settled interval
    let class = match classify_interval(interval_days, config) {
        Some(class) => class,
        None => return Err(SkipReason::IntervalOutOfRange),
    };

    // Stage 7: amount behaviour from the inlier band
    let inlier_amounts: Vec<Decimal> = inliers.iter().map(|t| t.amount).collect();
    let amount_cv = decimal_cv(&inlier_amounts);
    let behaviour = if amount_cv <= config.cv_fixed_threshold {
        AmountBehaviour::Fixed
    } else if amount_cv <= config.cv_variable_threshold {
        AmountBehaviour::Variable
    } else {
        AmountBehaviour::HighlyVariable
    };

    let pattern_case = match class {
        IntervalClass::Monthly => match behaviour {
            AmountBehaviour::Fixed => PatternCase::FixedMonthly,
            AmountBehaviour::Variable => PatternCase::VariableMonthly,
            AmountBehaviour::HighlyVariable => PatternCase::FlexibleMonthly,
        },
        IntervalClass::BiMonthly => PatternCase::BiMonthly,
        IntervalClass::Quarterly => PatternCase::Quarterly,
        IntervalClass::Custom => PatternCase::CustomInterval,
    };

    // Stage 8: weighted confidence
    let interval_values: Vec<f64> = inlier_intervals.iter().map(|d| *d as f64).collect();
    let interval_cv = cv(&interval_values);

    let days: Vec<u32> = inlier_dates.iter().map(|d| circle_day(d.day())).collect();
    let day_median = circular_median_day(&days);
    let day_sigma = circular_day_stddev(&days, day_median);

    let case_strength = match pattern_case {
        PatternCase::FixedMonthly
        | PatternCase::BiMonthly
        | PatternCase::Quarterly
        | PatternCase::CustomInterval => 1.0,
        PatternCase::VariableMonthly | PatternCase::FlexibleMonthly => 0.6,
    };

    let confidence = 0.35 * clip01(1.0 - interval_cv)
        + 0.25 * clip01(1.0 - amount_cv)
        + 0.20 * clip01(1.0 - day_sigma / 10.0)
        + 0.15 * (txns.len() as f64 / 6.0).min(1.0)
        + 0.05 * case_strength;

    debug!(
        interval_days,
        case = %pattern_case,
        behaviour = %behaviour,
        confidence = format!("{:.3}", confidence).as_str(),
        inliers = inliers.len(),
        total = txns.len(),
        "Evaluated cluster"
    );

    if confidence < config.min_confidence {
        return Err(SkipReason::LowConfidence);
    }

    // Stage 9: emit
    let representative_amount = decimal_median(&inlier_amounts);
    let all_amounts: Vec<Decimal> = txns.iter().map(|t| t.amount).collect();
    let amount_min = all_amounts.iter().min().copied().unwrap_or_default();
    let amount_max = all_amounts.iter().max().copied().unwrap_or_default();

    // Day hints are meaningful only where the schedule stays anchored to a
    // day of the month; a 28-day cadence drifts through the calendar.
    let day_of_month_hint = match class {
        IntervalClass::Custom => None,
        _ => Some(day_median),
    };

    let recent_inlier_amounts: Vec<Decimal> = inliers
        .iter()
        .rev()
        .take(3)
        .map(|t| t.amount)
        .collect();

    Ok(PatternCandidate {
        pattern_case,
        amount_behaviour: behaviour,
        interval_days,
        representative_amount,
        amount_min,
        amount_max,
        day_of_month_hint,
        confidence,
        last_transaction_date: *dates.last().unwrap(),
        transactions: txns,
        recent_inlier_amounts,
    })
}

fn day_intervals(dates: &[NaiveDate]) -> Vec<i64> {
    dates
        .windows(2)
        .map(|w| (w[1] - w[0]).num_days())
        .collect()
}

/// Median interval rounded to whole days, if the spread passes the
/// stability gate `sigma <= max(3, 0.15 * median)`
///
/// A gap sitting near an integer multiple of the base cadence is a missed
/// cycle, not a different schedule; it folds back to the base before the
/// spread is judged.
fn stable_interval(intervals: &[i64]) -> Option<i64> {
    let raw: Vec<f64> = intervals.iter().map(|d| *d as f64).collect();
    let base = median_f64(&raw);
    if base <= 0.0 {
        return None;
    }
    let gate = (0.15 * base).max(3.0);

    let folded: Vec<f64> = raw
        .iter()
        .map(|d| {
            let k = (d / base).round();
            if k >= 2.0 && (d - k * base).abs() <= gate {
                d / k
            } else {
                *d
            }
        })
        .collect();

    let median = median_f64(&folded);
    let sigma = population_stddev(&folded);

    if sigma <= (0.15 * median).max(3.0) {
        Some(median.round() as i64)
    } else {
        None
    }
}

/// Deterministic interval classification; ranges are checked tightest
/// first, so a boundary value lands in the shorter cadence
fn classify_interval(interval_days: i64, config: &DiscoveryConfig) -> Option<IntervalClass> {
    match interval_days {
        27..=33 => Some(IntervalClass::Monthly),
        55..=65 => Some(IntervalClass::BiMonthly),
        85..=95 => Some(IntervalClass::Quarterly),
        d if d >= config.min_interval_days && d <= config.max_interval_days => {
            Some(IntervalClass::Custom)
        }
        _ => None,
    }
}

/// Indices of the largest single amount band, by the splitter's tolerance;
/// on a tie the lower-amount band wins
fn largest_amount_band(txns: &[Transaction], config: &DiscoveryConfig) -> Vec<usize> {
    let mut order: Vec<usize> = (0..txns.len()).collect();
    order.sort_by(|a, b| txns[*a].amount.cmp(&txns[*b].amount));

    let mut bands: Vec<Vec<usize>> = Vec::new();
    let mut current = vec![order[0]];
    let mut sum = txns[order[0]].amount;

    for idx in &order[1..] {
        let centroid = sum / Decimal::from(current.len());
        if (txns[*idx].amount - centroid).abs() <= amount_tolerance(centroid, config) {
            current.push(*idx);
            sum += txns[*idx].amount;
        } else {
            bands.push(std::mem::replace(&mut current, vec![*idx]));
            sum = txns[*idx].amount;
        }
    }
    bands.push(current);

    bands
        .into_iter()
        .max_by_key(|band| band.len())
        .unwrap_or_default()
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn population_stddev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    (values.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / values.len() as f64).sqrt()
}

/// Coefficient of variation; degenerate inputs read as perfectly regular
fn cv(values: &[f64]) -> f64 {
    let m = mean(values);
    if m == 0.0 {
        return 0.0;
    }
    population_stddev(values) / m
}

fn decimal_cv(values: &[Decimal]) -> f64 {
    let floats: Vec<f64> = values.iter().map(|v| v.to_f64().unwrap_or(0.0)).collect();
    cv(&floats)
}

fn median_f64(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

fn decimal_median(values: &[Decimal]) -> Decimal {
    if values.is_empty() {
        return Decimal::ZERO;
    }
    let mut sorted = values.to_vec();
    sorted.sort();
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / Decimal::TWO
    } else {
        sorted[mid]
    }
}

fn circular_distance(a: u32, b: u32) -> u32 {
    let diff = a.abs_diff(b);
    diff.min(30 - diff)
}

/// The observed day minimizing total circular distance to the others;
/// ties resolve to the earliest day
fn circular_median_day(days: &[u32]) -> u32 {
    let mut best = days.first().copied().unwrap_or(1);
    let mut best_total = u32::MAX;
    let mut candidates: Vec<u32> = days.to_vec();
    candidates.sort_unstable();
    candidates.dedup();

    for candidate in candidates {
        let total: u32 = days.iter().map(|d| circular_distance(*d, candidate)).sum();
        if total < best_total {
            best_total = total;
            best = candidate;
        }
    }
    best
}

fn circular_day_stddev(days: &[u32], median: u32) -> f64 {
    if days.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = days
        .iter()
        .map(|d| {
            let dist = circular_distance(*d, median) as f64;
            dist * dist
        })
        .sum();
    (sum_sq / days.len() as f64).sqrt()
}

fn clip01(v: f64) -> f64 {
    v.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Direction;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn tx(id: i64, y: i32, m: u32, d: u32, amount: Decimal) -> Transaction {
        Transaction {
            id,
            user_id: 1,
            payee_id: 1,
            direction: Direction::Debit,
            currency_id: 1,
            occurred_at: Utc.with_ymd_and_hms(y, m, d, 10, 0, 0).unwrap(),
            amount,
            source_message_id: format!("msg-{}", id),
            created_at: Utc::now(),
        }
    }

    fn cluster(txns: Vec<Transaction>) -> Cluster {
        Cluster { transactions: txns }
    }

    #[test]
    fn test_fixed_monthly_salary_skipping_a_month() {
        // Oct 31 -> Dec 1 -> Dec 30: intervals 31 and 29, one calendar
        // month absent entirely
        let c = cluster(vec![
            tx(1, 2025, 10, 31, dec!(16500)),
            tx(2, 2025, 12, 1, dec!(16500)),
            tx(3, 2025, 12, 30, dec!(16500)),
        ]);

        let candidate = evaluate_cluster(&c, &DiscoveryConfig::default()).unwrap();
        assert_eq!(candidate.pattern_case, PatternCase::FixedMonthly);
        assert_eq!(candidate.amount_behaviour, AmountBehaviour::Fixed);
        assert_eq!(candidate.interval_days, 30);
        assert_eq!(candidate.representative_amount, dec!(16500));
        assert!(
            candidate.confidence >= 0.80,
            "confidence was {:.3}",
            candidate.confidence
        );
        assert_eq!(
            candidate.last_transaction_date,
            NaiveDate::from_ymd_opt(2025, 12, 30).unwrap()
        );
    }

    #[test]
    fn test_variable_monthly_support() {
        let c = cluster(vec![
            tx(1, 2025, 10, 1, dec!(4000)),
            tx(2, 2025, 10, 31, dec!(5000)),
            tx(3, 2025, 12, 2, dec!(4000)),
        ]);

        let candidate = evaluate_cluster(&c, &DiscoveryConfig::default()).unwrap();
        assert_eq!(candidate.pattern_case, PatternCase::VariableMonthly);
        assert_eq!(candidate.amount_behaviour, AmountBehaviour::Variable);
        assert_eq!(candidate.interval_days, 31);
        assert_eq!(candidate.representative_amount, dec!(4000));
        assert_eq!(candidate.amount_min, dec!(4000));
        assert_eq!(candidate.amount_max, dec!(5000));
        assert!(
            candidate.confidence >= 0.70,
            "confidence was {:.3}",
            candidate.confidence
        );
    }

    #[test]
    fn test_28_day_recharge_is_custom_interval() {
        let start = NaiveDate::from_ymd_opt(2025, 9, 3).unwrap();
        let txns: Vec<Transaction> = (0..5)
            .map(|i| {
                let date = start + chrono::Duration::days(28 * i);
                tx(
                    i + 1,
                    date.year(),
                    date.month(),
                    date.day(),
                    dec!(199),
                )
            })
            .collect();

        let candidate = evaluate_cluster(&cluster(txns), &DiscoveryConfig::default()).unwrap();
        assert_eq!(candidate.pattern_case, PatternCase::CustomInterval);
        assert_eq!(candidate.amount_behaviour, AmountBehaviour::Fixed);
        assert_eq!(candidate.interval_days, 28);
        assert!(candidate.day_of_month_hint.is_none());
        assert!(
            candidate.confidence >= 0.90,
            "confidence was {:.3}",
            candidate.confidence
        );
    }

    #[test]
    fn test_bi_monthly_and_quarterly_classification() {
        let bi = cluster(vec![
            tx(1, 2025, 1, 10, dec!(1200)),
            tx(2, 2025, 3, 11, dec!(1200)),
            tx(3, 2025, 5, 10, dec!(1200)),
        ]);
        let candidate = evaluate_cluster(&bi, &DiscoveryConfig::default()).unwrap();
        assert_eq!(candidate.pattern_case, PatternCase::BiMonthly);

        let quarterly = cluster(vec![
            tx(1, 2025, 1, 5, dec!(4500)),
            tx(2, 2025, 4, 5, dec!(4500)),
            tx(3, 2025, 7, 4, dec!(4500)),
        ]);
        let candidate = evaluate_cluster(&quarterly, &DiscoveryConfig::default()).unwrap();
        assert_eq!(candidate.pattern_case, PatternCase::Quarterly);
    }

    #[test]
    fn test_frequent_purchases_rejected() {
        // Groceries: 6 purchases inside three weeks
        let c = cluster(vec![
            tx(1, 2025, 6, 1, dec!(240)),
            tx(2, 2025, 6, 4, dec!(310)),
            tx(3, 2025, 6, 8, dec!(280)),
            tx(4, 2025, 6, 12, dec!(260)),
            tx(5, 2025, 6, 16, dec!(300)),
            tx(6, 2025, 6, 21, dec!(250)),
        ]);
        assert_eq!(
            evaluate_cluster(&c, &DiscoveryConfig::default()).unwrap_err(),
            SkipReason::TooFrequent
        );
    }

    #[test]
    fn test_unstable_intervals_rejected() {
        let c = cluster(vec![
            tx(1, 2025, 1, 1, dec!(900)),
            tx(2, 2025, 1, 25, dec!(900)),
            tx(3, 2025, 4, 10, dec!(900)),
            tx(4, 2025, 4, 26, dec!(900)),
        ]);
        assert_eq!(
            evaluate_cluster(&c, &DiscoveryConfig::default()).unwrap_err(),
            SkipReason::UnstableInterval
        );
    }

    #[test]
    fn test_too_small_cluster_rejected() {
        let c = cluster(vec![
            tx(1, 2025, 1, 1, dec!(100)),
            tx(2, 2025, 2, 1, dec!(100)),
        ]);
        assert_eq!(
            evaluate_cluster(&c, &DiscoveryConfig::default()).unwrap_err(),
            SkipReason::ClusterTooSmall
        );
    }

    #[test]
    fn test_missed_month_reads_as_double_interval() {
        // 30, 60, 30: the 60-day gap folds back to the base cadence as one
        // missed cycle instead of collapsing the pattern
        let c = cluster(vec![
            tx(1, 2025, 1, 5, dec!(2500)),
            tx(2, 2025, 2, 4, dec!(2500)),
            tx(3, 2025, 4, 5, dec!(2500)),
            tx(4, 2025, 5, 5, dec!(2500)),
        ]);
        let candidate = evaluate_cluster(&c, &DiscoveryConfig::default()).unwrap();
        assert!(candidate.pattern_case.is_monthly_family());
        assert_eq!(candidate.interval_days, 30);
    }

    #[test]
    fn test_circular_day_statistics() {
        assert_eq!(circular_distance(30, 1), 1);
        assert_eq!(circular_distance(5, 25), 10);
        let days = [30, 1, 30];
        let median = circular_median_day(&days);
        assert_eq!(median, 30);
        assert!(circular_day_stddev(&days, median) < 1.0);
    }

    #[test]
    fn test_duplicate_transactions_deduped() {
        let a = tx(1, 2025, 1, 5, dec!(750));
        let c = cluster(vec![
            a.clone(),
            a,
            tx(2, 2025, 2, 4, dec!(750)),
            tx(3, 2025, 3, 6, dec!(750)),
        ]);
        let candidate = evaluate_cluster(&c, &DiscoveryConfig::default()).unwrap();
        assert_eq!(candidate.transactions.len(), 3);
    }
}
