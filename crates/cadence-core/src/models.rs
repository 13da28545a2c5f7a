//! Domain models for Cadence

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Whether the user was debited or credited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Debit,
    Credit,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debit => "debit",
            Self::Credit => "credit",
        }
    }
}

impl std::str::FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "debit" => Ok(Self::Debit),
            "credit" => Ok(Self::Credit),
            _ => Err(format!("Unknown direction: {}", s)),
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Qualitative interval bucket of a recurring pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternCase {
    /// ~30-day cadence, fixed amount
    FixedMonthly,
    /// ~30-day cadence, moderately varying amount
    VariableMonthly,
    /// ~30-day cadence, highly varying amount; date regularity is the signal
    FlexibleMonthly,
    /// ~60-day cadence
    BiMonthly,
    /// ~90-day cadence
    Quarterly,
    /// Any other stable interval in [10, 400] days
    CustomInterval,
}

impl PatternCase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FixedMonthly => "fixed_monthly",
            Self::VariableMonthly => "variable_monthly",
            Self::FlexibleMonthly => "flexible_monthly",
            Self::BiMonthly => "bi_monthly",
            Self::Quarterly => "quarterly",
            Self::CustomInterval => "custom_interval",
        }
    }

    /// Whether this case belongs to the ~30-day monthly family
    pub fn is_monthly_family(&self) -> bool {
        matches!(
            self,
            Self::FixedMonthly | Self::VariableMonthly | Self::FlexibleMonthly
        )
    }
}

impl std::str::FromStr for PatternCase {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fixed_monthly" => Ok(Self::FixedMonthly),
            "variable_monthly" => Ok(Self::VariableMonthly),
            "flexible_monthly" => Ok(Self::FlexibleMonthly),
            "bi_monthly" => Ok(Self::BiMonthly),
            "quarterly" => Ok(Self::Quarterly),
            "custom_interval" => Ok(Self::CustomInterval),
            _ => Err(format!("Unknown pattern case: {}", s)),
        }
    }
}

impl std::fmt::Display for PatternCase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Qualitative band of amount variability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AmountBehaviour {
    /// CV(amounts) <= 0.05
    Fixed,
    /// 0.05 < CV(amounts) <= 0.30
    Variable,
    /// CV(amounts) > 0.30
    HighlyVariable,
}

impl AmountBehaviour {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fixed => "fixed",
            Self::Variable => "variable",
            Self::HighlyVariable => "highly_variable",
        }
    }
}

impl std::str::FromStr for AmountBehaviour {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fixed" => Ok(Self::Fixed),
            "variable" => Ok(Self::Variable),
            "highly_variable" => Ok(Self::HighlyVariable),
            _ => Err(format!("Unknown amount behaviour: {}", s)),
        }
    }
}

impl std::fmt::Display for AmountBehaviour {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Pattern lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternStatus {
    Active,
    /// Degraded after 2-3 consecutive misses; still matchable
    Paused,
    /// More than 3 consecutive misses; still matchable (recovery path)
    Broken,
    /// Soft-deleted by the user; invisible to the matcher
    Archived,
}

impl PatternStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Broken => "broken",
            Self::Archived => "archived",
        }
    }
}

impl std::str::FromStr for PatternStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "broken" => Ok(Self::Broken),
            "archived" => Ok(Self::Archived),
            _ => Err(format!("Unknown pattern status: {}", s)),
        }
    }
}

impl std::fmt::Display for PatternStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Obligation lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObligationStatus {
    Expected,
    Fulfilled,
    Missed,
    Cancelled,
}

impl ObligationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Expected => "expected",
            Self::Fulfilled => "fulfilled",
            Self::Missed => "missed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for ObligationStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "expected" => Ok(Self::Expected),
            "fulfilled" => Ok(Self::Fulfilled),
            "missed" => Ok(Self::Missed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Unknown obligation status: {}", s)),
        }
    }
}

impl std::fmt::Display for ObligationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An immutable transaction fact from the ingestion pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: i64,
    pub user_id: i64,
    pub payee_id: i64,
    pub direction: Direction,
    pub currency_id: i64,
    pub occurred_at: DateTime<Utc>,
    pub amount: Decimal,
    /// Unique upstream message id; de-duplicated by the producer
    pub source_message_id: String,
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    /// Calendar date of the transaction in UTC; all interval and matching
    /// arithmetic operates on whole days.
    pub fn date(&self) -> NaiveDate {
        self.occurred_at.date_naive()
    }
}

/// A transaction to be persisted (before DB insertion)
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub user_id: i64,
    pub payee_id: i64,
    pub direction: Direction,
    pub currency_id: i64,
    pub occurred_at: DateTime<Utc>,
    pub amount: Decimal,
    pub source_message_id: String,
}

/// A discovered recurring pattern
///
/// Multiple patterns may share (user, payee, direction, currency) - one per
/// independent series. The id is stable across re-discovery runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pattern {
    pub id: i64,
    pub user_id: i64,
    pub payee_id: i64,
    pub direction: Direction,
    pub currency_id: i64,
    pub interval_days: i64,
    pub pattern_case: PatternCase,
    pub amount_behaviour: AmountBehaviour,
    /// Median of the inlier amount band
    pub representative_amount: Decimal,
    /// Full observed range, outliers included
    pub amount_min: Decimal,
    pub amount_max: Decimal,
    pub day_of_month_hint: Option<u32>,
    pub status: PatternStatus,
    /// Discovery-time regularity score in [0, 1]
    pub confidence: f64,
    pub detection_version: i64,
    /// Optional post-hoc summary from the summariser adapter; advisory only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotation: Option<String>,
    pub last_evaluated_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Fast-changing runtime state, 1:1 with a pattern
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternStreak {
    pub pattern_id: i64,
    pub current_streak: i64,
    pub longest_streak: i64,
    pub missed_count: i64,
    pub last_actual_date: Option<NaiveDate>,
    pub last_expected_date: Option<NaiveDate>,
    /// Runtime factor in [0, 1] multiplied against discovery confidence
    pub confidence_multiplier: f64,
    pub updated_at: DateTime<Utc>,
}

/// An expected future occurrence of a pattern
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Obligation {
    pub id: i64,
    pub pattern_id: i64,
    pub expected_date: NaiveDate,
    pub tolerance_days: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_min_amount: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_max_amount: Option<Decimal>,
    pub status: ObligationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fulfilled_by_transaction_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fulfilled_at: Option<DateTime<Utc>>,
    /// expected_date - actual date; negative when late
    #[serde(skip_serializing_if = "Option::is_none")]
    pub days_early: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl Obligation {
    /// The inclusive matching window `[expected - tolerance, expected + tolerance]`.
    pub fn window_contains(&self, date: NaiveDate) -> bool {
        (date - self.expected_date).num_days().abs() <= self.tolerance_days
    }

    /// Whether `date` lies past the end of the matching window.
    pub fn is_overdue_at(&self, date: NaiveDate) -> bool {
        (date - self.expected_date).num_days() > self.tolerance_days
    }
}

/// Append-only link between a pattern and one of its transactions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternLink {
    pub pattern_id: i64,
    pub transaction_id: i64,
    pub linked_at: DateTime<Utc>,
}

/// Matcher work that exhausted its retry budget
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: i64,
    pub transaction_id: i64,
    pub attempts: i64,
    pub last_error: String,
    pub created_at: DateTime<Utc>,
}

/// A counterparty, normalised to a stable identity upstream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payee {
    pub id: i64,
    pub name: String,
}

/// A currency; groups and patterns never mix currencies
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Currency {
    pub id: i64,
    pub code: String,
}
