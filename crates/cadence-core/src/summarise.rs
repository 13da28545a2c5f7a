//! Pattern annotation adapter
//!
//! Human-readable summaries are an optional post-hoc annotation supplied by
//! an external summariser (an LLM in the original deployment). The adapter
//! is advisory only: a missing or unhappy summariser never vetoes or
//! deletes a pattern, and nothing on the discovery or matching critical
//! path depends on it.

use crate::discovery::PatternCandidate;
use crate::models::{AmountBehaviour, PatternCase};

/// Produces an optional one-line annotation for a discovered pattern
pub trait PatternSummariser: Send + Sync {
    fn summarise(&self, payee_name: &str, candidate: &PatternCandidate) -> Option<String>;
}

/// Annotates nothing
pub struct NoopSummariser;

impl PatternSummariser for NoopSummariser {
    fn summarise(&self, _payee_name: &str, _candidate: &PatternCandidate) -> Option<String> {
        None
    }
}

/// Deterministic template summariser used when no external service is wired
pub struct TemplateSummariser;

impl PatternSummariser for TemplateSummariser {
    fn summarise(&self, payee_name: &str, candidate: &PatternCandidate) -> Option<String> {
        let cadence = match candidate.pattern_case {
            PatternCase::FixedMonthly | PatternCase::VariableMonthly | PatternCase::FlexibleMonthly => {
                "monthly".to_string()
            }
            PatternCase::BiMonthly => "every two months".to_string(),
            PatternCase::Quarterly => "quarterly".to_string(),
            PatternCase::CustomInterval => format!("every {} days", candidate.interval_days),
        };

        let amount = match candidate.amount_behaviour {
            AmountBehaviour::Fixed => format!("{}", candidate.representative_amount),
            AmountBehaviour::Variable | AmountBehaviour::HighlyVariable => format!(
                "{}-{}",
                candidate.amount_min, candidate.amount_max
            ),
        };

        Some(format!("{} payment of {} to {}", cadence, amount, payee_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Direction, Transaction};
    use chrono::{NaiveDate, TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn candidate() -> PatternCandidate {
        PatternCandidate {
            pattern_case: PatternCase::FixedMonthly,
            amount_behaviour: AmountBehaviour::Fixed,
            interval_days: 30,
            representative_amount: dec!(16500),
            amount_min: dec!(16500),
            amount_max: dec!(16500),
            day_of_month_hint: Some(30),
            confidence: 0.9,
            transactions: vec![Transaction {
                id: 1,
                user_id: 1,
                payee_id: 1,
                direction: Direction::Credit,
                currency_id: 1,
                occurred_at: Utc.with_ymd_and_hms(2025, 12, 30, 9, 0, 0).unwrap(),
                amount: dec!(16500),
                source_message_id: "m1".to_string(),
                created_at: Utc::now(),
            }],
            recent_inlier_amounts: vec![dec!(16500)],
            last_transaction_date: NaiveDate::from_ymd_opt(2025, 12, 30).unwrap(),
        }
    }

    #[test]
    fn test_template_summary() {
        let summary = TemplateSummariser.summarise("Sabitha", &candidate()).unwrap();
        assert_eq!(summary, "monthly payment of 16500 to Sabitha");
    }

    #[test]
    fn test_noop_stays_silent() {
        assert!(NoopSummariser.summarise("Sabitha", &candidate()).is_none());
    }
}
