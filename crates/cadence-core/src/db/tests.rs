//! Database tests

use super::*;
use crate::discovery::{GroupKey, PatternCandidate};
use crate::models::*;
use chrono::{NaiveDate, TimeZone};
use rust_decimal_macros::dec;

fn seed_refs(db: &Database) -> (i64, i64, i64) {
    let user = db.upsert_user(1, "asha").unwrap();
    let payee = db.upsert_payee("Swathi").unwrap();
    let currency = db.upsert_currency("INR").unwrap();
    (user, payee, currency)
}

fn make_transaction(db: &Database, user: i64, payee: i64, currency: i64, d: u32, msg: &str) -> i64 {
    db.insert_transaction(&NewTransaction {
        user_id: user,
        payee_id: payee,
        direction: Direction::Debit,
        currency_id: currency,
        occurred_at: Utc.with_ymd_and_hms(2025, 10, d, 12, 0, 0).unwrap(),
        amount: dec!(4000),
        source_message_id: msg.to_string(),
    })
    .unwrap()
    .id()
}

fn make_candidate(tx_ids: &[i64], db: &Database) -> PatternCandidate {
    let transactions: Vec<Transaction> = tx_ids
        .iter()
        .map(|id| db.get_transaction(*id).unwrap().unwrap())
        .collect();
    let last = transactions.last().unwrap().date();
    PatternCandidate {
        pattern_case: PatternCase::FixedMonthly,
        amount_behaviour: AmountBehaviour::Fixed,
        interval_days: 30,
        representative_amount: dec!(4000),
        amount_min: dec!(4000),
        amount_max: dec!(4000),
        day_of_month_hint: Some(5),
        confidence: 0.85,
        transactions,
        recent_inlier_amounts: vec![dec!(4000), dec!(4000), dec!(4000)],
        last_transaction_date: last,
    }
}

#[test]
fn test_schema_tables_exist() {
    let db = Database::in_memory().unwrap();
    let conn = db.conn().unwrap();

    for table in [
        "users",
        "payees",
        "currencies",
        "transactions",
        "patterns",
        "pattern_streaks",
        "pattern_links",
        "obligations",
        "dead_letters",
    ] {
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
                rusqlite::params![table],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1, "table {} should exist", table);
    }
}

#[test]
fn test_transaction_insert_and_duplicate() {
    let db = Database::in_memory().unwrap();
    let (user, payee, currency) = seed_refs(&db);

    let first = db
        .insert_transaction(&NewTransaction {
            user_id: user,
            payee_id: payee,
            direction: Direction::Debit,
            currency_id: currency,
            occurred_at: Utc.with_ymd_and_hms(2025, 10, 1, 8, 30, 0).unwrap(),
            amount: dec!(4000.50),
            source_message_id: "msg-1".to_string(),
        })
        .unwrap();
    let id = match first {
        TransactionInsertResult::Inserted(id) => id,
        _ => panic!("expected insert"),
    };

    // Same source message replays as a duplicate, not an error
    let again = db
        .insert_transaction(&NewTransaction {
            user_id: user,
            payee_id: payee,
            direction: Direction::Debit,
            currency_id: currency,
            occurred_at: Utc.with_ymd_and_hms(2025, 10, 1, 8, 30, 0).unwrap(),
            amount: dec!(4000.50),
            source_message_id: "msg-1".to_string(),
        })
        .unwrap();
    assert_eq!(again, TransactionInsertResult::Duplicate(id));

    let stored = db.get_transaction(id).unwrap().unwrap();
    assert_eq!(stored.amount, dec!(4000.50));
    assert_eq!(stored.direction, Direction::Debit);
    assert_eq!(stored.date(), NaiveDate::from_ymd_opt(2025, 10, 1).unwrap());
}

#[test]
fn test_negative_amount_rejected() {
    let db = Database::in_memory().unwrap();
    let (user, payee, currency) = seed_refs(&db);

    let err = db
        .insert_transaction(&NewTransaction {
            user_id: user,
            payee_id: payee,
            direction: Direction::Debit,
            currency_id: currency,
            occurred_at: Utc.with_ymd_and_hms(2025, 10, 1, 8, 30, 0).unwrap(),
            amount: dec!(-5),
            source_message_id: "neg".to_string(),
        })
        .unwrap_err();
    assert!(matches!(err, crate::error::Error::Invalid(_)));
}

#[test]
fn test_persist_candidate_fill_order() {
    let db = Database::in_memory().unwrap();
    let (user, payee, currency) = seed_refs(&db);
    let ids: Vec<i64> = [(5, "a"), (15, "b"), (25, "c")]
        .iter()
        .map(|(d, m)| make_transaction(&db, user, payee, currency, *d, m))
        .collect();

    let key = GroupKey {
        payee_id: payee,
        direction: Direction::Debit,
        currency_id: currency,
    };
    let candidate = make_candidate(&ids, &db);

    let (pattern, created) = db.persist_candidate(user, &key, &candidate, None).unwrap();
    assert!(created);
    assert_eq!(pattern.detection_version, 1);
    assert_eq!(pattern.status, PatternStatus::Active);

    // Streak seeded from the historical series
    let streak = db.get_streak(pattern.id).unwrap().unwrap();
    assert_eq!(streak.current_streak, 3);
    assert_eq!(streak.longest_streak, 3);
    assert_eq!(streak.missed_count, 0);
    assert_eq!(streak.confidence_multiplier, 1.0);
    assert_eq!(
        streak.last_actual_date,
        Some(NaiveDate::from_ymd_opt(2025, 10, 25).unwrap())
    );

    // All transactions linked
    assert_eq!(db.list_links(pattern.id).unwrap().len(), 3);

    // First obligation seeded one interval out
    let pending = db.pending_obligation(pattern.id).unwrap().unwrap();
    assert_eq!(
        pending.expected_date,
        NaiveDate::from_ymd_opt(2025, 11, 24).unwrap()
    );
    assert_eq!(pending.tolerance_days, 3);
    assert_eq!(pending.expected_min_amount, Some(dec!(4000)));
    assert_eq!(pending.expected_max_amount, Some(dec!(4000)));
}

#[test]
fn test_persist_candidate_is_idempotent() {
    let db = Database::in_memory().unwrap();
    let (user, payee, currency) = seed_refs(&db);
    let ids: Vec<i64> = [(5, "a"), (15, "b"), (25, "c")]
        .iter()
        .map(|(d, m)| make_transaction(&db, user, payee, currency, *d, m))
        .collect();

    let key = GroupKey {
        payee_id: payee,
        direction: Direction::Debit,
        currency_id: currency,
    };
    let candidate = make_candidate(&ids, &db);

    let (first, created) = db.persist_candidate(user, &key, &candidate, None).unwrap();
    assert!(created);

    // Mutate the streak to prove re-discovery never resets it
    let conn = db.conn().unwrap();
    conn.execute(
        "UPDATE pattern_streaks SET current_streak = 7, longest_streak = 9 WHERE pattern_id = ?",
        rusqlite::params![first.id],
    )
    .unwrap();
    drop(conn);

    let (second, created) = db.persist_candidate(user, &key, &candidate, None).unwrap();
    assert!(!created);
    assert_eq!(second.id, first.id);
    assert_eq!(second.detection_version, 2);

    let streak = db.get_streak(first.id).unwrap().unwrap();
    assert_eq!(streak.current_streak, 7);
    assert_eq!(streak.longest_streak, 9);

    // Links are append-only and unchanged
    assert_eq!(db.list_links(first.id).unwrap().len(), 3);
    // Still exactly one pending obligation
    let pending = db.list_obligations(first.id, Some(ObligationStatus::Expected), 10).unwrap();
    assert_eq!(pending.len(), 1);
}

#[test]
fn test_distinct_amount_bands_create_separate_patterns() {
    let db = Database::in_memory().unwrap();
    let (user, payee, currency) = seed_refs(&db);
    let ids: Vec<i64> = [(5, "a"), (15, "b"), (25, "c")]
        .iter()
        .map(|(d, m)| make_transaction(&db, user, payee, currency, *d, m))
        .collect();

    let key = GroupKey {
        payee_id: payee,
        direction: Direction::Debit,
        currency_id: currency,
    };

    let (first, _) = db
        .persist_candidate(user, &key, &make_candidate(&ids, &db), None)
        .unwrap();

    // Same key, clearly different amount band: a second series
    let mut other = make_candidate(&ids, &db);
    other.representative_amount = dec!(9500);
    other.amount_min = dec!(9400);
    other.amount_max = dec!(9600);
    let (second, created) = db.persist_candidate(user, &key, &other, None).unwrap();

    assert!(created);
    assert_ne!(second.id, first.id);
}

#[test]
fn test_delete_pattern_cascades() {
    let db = Database::in_memory().unwrap();
    let (user, payee, currency) = seed_refs(&db);
    let ids: Vec<i64> = [(5, "a"), (15, "b"), (25, "c")]
        .iter()
        .map(|(d, m)| make_transaction(&db, user, payee, currency, *d, m))
        .collect();

    let key = GroupKey {
        payee_id: payee,
        direction: Direction::Debit,
        currency_id: currency,
    };
    let (pattern, _) = db
        .persist_candidate(user, &key, &make_candidate(&ids, &db), None)
        .unwrap();

    db.delete_pattern(pattern.id).unwrap();

    assert!(db.get_pattern(pattern.id).unwrap().is_none());
    assert!(db.get_streak(pattern.id).unwrap().is_none());
    assert!(db.list_links(pattern.id).unwrap().is_empty());
    assert!(db.list_obligations(pattern.id, None, 10).unwrap().is_empty());
    // Transactions are facts and survive
    assert!(db.get_transaction(ids[0]).unwrap().is_some());
}

#[test]
fn test_upcoming_obligations_sorted_ascending() {
    let db = Database::in_memory().unwrap();
    let (user, payee, currency) = seed_refs(&db);
    let payee2 = db.upsert_payee("Selvam").unwrap();

    let ids: Vec<i64> = [(5, "a"), (15, "b"), (25, "c")]
        .iter()
        .map(|(d, m)| make_transaction(&db, user, payee, currency, *d, m))
        .collect();
    let ids2: Vec<i64> = [(2, "x"), (12, "y"), (22, "z")]
        .iter()
        .map(|(d, m)| make_transaction(&db, user, payee2, currency, *d, m))
        .collect();

    let key1 = GroupKey {
        payee_id: payee,
        direction: Direction::Debit,
        currency_id: currency,
    };
    let key2 = GroupKey {
        payee_id: payee2,
        direction: Direction::Debit,
        currency_id: currency,
    };
    db.persist_candidate(user, &key1, &make_candidate(&ids, &db), None)
        .unwrap();
    db.persist_candidate(user, &key2, &make_candidate(&ids2, &db), None)
        .unwrap();

    // Seeded obligations are in the past relative to the current date, so
    // a generous horizon returns both, soonest first
    let upcoming = db.upcoming_obligations(user, 100_000).unwrap();
    assert_eq!(upcoming.len(), 2);
    assert!(upcoming[0].0.expected_date <= upcoming[1].0.expected_date);
}

#[test]
fn test_dead_letter_round_trip() {
    let db = Database::in_memory().unwrap();
    db.record_dead_letter(42, 5, "connection lost").unwrap();

    let letters = db.list_dead_letters(10).unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].transaction_id, 42);
    assert_eq!(letters[0].attempts, 5);
    assert_eq!(letters[0].last_error, "connection lost");
}
