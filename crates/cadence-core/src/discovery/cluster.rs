//! Cluster splitter
//!
//! A single payee can carry several independent schedules (three chit
//! payments on different days of the month with different amounts, say).
//! Folding them into one series inflates amount variance and sinks
//! confidence, so the splitter partitions a group along two axes before the
//! discovery engine sees it: amount bands first, then day-of-month windows.

use rust_decimal::Decimal;

use super::DiscoveryConfig;
use crate::models::Transaction;

/// One candidate series; transactions are sorted by date
#[derive(Debug, Clone)]
pub struct Cluster {
    pub transactions: Vec<Transaction>,
}

/// Hybrid amount tolerance: whichever is larger of the absolute floor and
/// the relative share of the centroid
pub(crate) fn amount_tolerance(centroid: Decimal, config: &DiscoveryConfig) -> Decimal {
    let relative = centroid.abs() * config.amount_tolerance_percent;
    relative.max(config.amount_tolerance_absolute)
}

/// Day-of-month mapped onto a 30-day circle; the 31st folds onto 30
pub(crate) fn circle_day(day: u32) -> u32 {
    day.min(30)
}

/// Wrap-aware span of a set of days on the 30-day circle
///
/// The span is the shortest arc covering every day, so 30 -> 1 -> 2 has a
/// span of 2, not 29.
pub(crate) fn circular_day_span(days: &[u32]) -> u32 {
    let mut unique: Vec<u32> = days.iter().map(|d| circle_day(*d)).collect();
    unique.sort_unstable();
    unique.dedup();

    if unique.len() <= 1 {
        return 0;
    }

    let mut max_gap = 30 - unique.last().unwrap() + unique.first().unwrap();
    for pair in unique.windows(2) {
        max_gap = max_gap.max(pair[1] - pair[0]);
    }
    30 - max_gap
}

/// Partition a group's transactions into candidate clusters
///
/// Returns the surviving clusters plus the count of transactions discarded
/// in sub-minimum fragments.
pub fn split_group(
    transactions: &[Transaction],
    config: &DiscoveryConfig,
) -> (Vec<Cluster>, usize) {
    if transactions.is_empty() {
        return (Vec::new(), 0);
    }

    // Axis 1: greedy 1D agglomerative clustering on sorted amounts. A
    // transaction joins the running cluster while its distance to the
    // cluster centroid stays within tolerance; the sorted sweep means an
    // equidistant transaction lands in the lower-amount cluster.
    let mut by_amount: Vec<&Transaction> = transactions.iter().collect();
    by_amount.sort_by(|a, b| a.amount.cmp(&b.amount).then(a.date().cmp(&b.date())));

    let mut amount_bands: Vec<Vec<&Transaction>> = Vec::new();
    let mut current = vec![by_amount[0]];
    let mut sum = by_amount[0].amount;

    for &tx in &by_amount[1..] {
        let centroid = sum / Decimal::from(current.len());
        if (tx.amount - centroid).abs() <= amount_tolerance(centroid, config) {
            current.push(tx);
            sum += tx.amount;
        } else {
            amount_bands.push(std::mem::replace(&mut current, vec![tx]));
            sum = tx.amount;
        }
    }
    amount_bands.push(current);

    // Axis 2: within each band, accept a tight day-of-month window as one
    // series; otherwise split into fixed day bands.
    let mut clusters = Vec::new();
    let mut dropped = 0;

    for band in amount_bands {
        let days: Vec<u32> = band.iter().map(|t| day_of_month(t)).collect();

        let split: Vec<Vec<&Transaction>> = if circular_day_span(&days) <= config.day_window_span {
            vec![band]
        } else {
            let mut early = Vec::new();
            let mut mid = Vec::new();
            let mut late = Vec::new();
            for tx in band {
                match day_of_month(tx) {
                    1..=10 => early.push(tx),
                    11..=20 => mid.push(tx),
                    _ => late.push(tx),
                }
            }
            vec![early, mid, late]
        };

        for part in split {
            if part.len() < config.min_transactions {
                dropped += part.len();
                continue;
            }
            let mut txns: Vec<Transaction> = part.into_iter().cloned().collect();
            txns.sort_by_key(|t| t.occurred_at);
            clusters.push(Cluster { transactions: txns });
        }
    }

    (clusters, dropped)
}

fn day_of_month(tx: &Transaction) -> u32 {
    use chrono::Datelike;
    tx.date().day()
}
