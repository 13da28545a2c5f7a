//! Candidate group construction
//!
//! Groups a user's transactions by (payee, direction, currency) and strips
//! the ones already linked to a pattern on the same key, so re-discovery
//! only ever sees unassigned history.

use std::collections::HashMap;

use serde::Serialize;
use tracing::debug;

use super::{DiscoveryConfig, DiscoveryFilters, SkipReason};
use crate::db::Database;
use crate::error::Result;
use crate::models::{Direction, Transaction};

/// Identity of a transaction group; currencies never mix across groups
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct GroupKey {
    pub payee_id: i64,
    pub direction: Direction,
    pub currency_id: i64,
}

/// A group of unassigned transactions sharing one key, oldest first
#[derive(Debug, Clone)]
pub struct CandidateGroup {
    pub key: GroupKey,
    pub transactions: Vec<Transaction>,
}

/// A group or cluster that discovery declined, with the reason
#[derive(Debug, Clone, Serialize)]
pub struct SkippedGroup {
    pub key: GroupKey,
    pub reason: SkipReason,
}

/// Build candidate groups for a user, filtering out linked transactions
///
/// Pure function of the stored transactions and links; an empty result just
/// means the user has nothing new to analyze.
pub fn build_candidate_groups(
    db: &Database,
    user_id: i64,
    filters: &DiscoveryFilters,
    config: &DiscoveryConfig,
) -> Result<(Vec<CandidateGroup>, Vec<SkippedGroup>)> {
    let transactions = db.list_transactions_for_discovery(user_id)?;

    let mut by_key: HashMap<GroupKey, Vec<Transaction>> = HashMap::new();
    for tx in transactions {
        if let Some(payee_id) = filters.payee_id {
            if tx.payee_id != payee_id {
                continue;
            }
        }
        if let Some(direction) = filters.direction {
            if tx.direction != direction {
                continue;
            }
        }

        let key = GroupKey {
            payee_id: tx.payee_id,
            direction: tx.direction,
            currency_id: tx.currency_id,
        };
        by_key.entry(key).or_default().push(tx);
    }

    let mut groups = Vec::new();
    let mut skipped = Vec::new();

    let mut keys: Vec<GroupKey> = by_key.keys().copied().collect();
    keys.sort_by_key(|k| (k.payee_id, k.direction.as_str(), k.currency_id));

    for key in keys {
        let all = by_key.remove(&key).unwrap_or_default();
        let linked =
            db.linked_transaction_ids_for_key(user_id, key.payee_id, key.direction, key.currency_id)?;

        let unassigned: Vec<Transaction> =
            all.iter().filter(|t| !linked.contains(&t.id)).cloned().collect();

        debug!(
            payee_id = key.payee_id,
            direction = %key.direction,
            total = all.len(),
            linked = linked.len(),
            unassigned = unassigned.len(),
            "Built transaction group"
        );

        if unassigned.len() < config.min_transactions {
            let reason = if unassigned.is_empty() && !all.is_empty() {
                SkipReason::AllTransactionsLinked
            } else {
                SkipReason::TooFewTransactions
            };
            skipped.push(SkippedGroup { key, reason });
            continue;
        }

        groups.push(CandidateGroup {
            key,
            transactions: unassigned,
        });
    }

    Ok((groups, skipped))
}
