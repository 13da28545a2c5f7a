//! Command implementations

use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use rust_decimal::Decimal;

use cadence_core::db::Database;
use cadence_core::discovery::{DiscoveryFilters, PatternDiscovery};
use cadence_core::models::{Direction, NewTransaction, PatternStatus};
use cadence_core::summarise::TemplateSummariser;

pub fn open_db(path: &str) -> Result<Database> {
    Database::new(path).with_context(|| format!("Failed to open database at {}", path))
}

pub fn cmd_init(path: &str) -> Result<()> {
    let db = open_db(path)?;
    println!("Database initialized at {}", db.path());
    Ok(())
}

pub fn cmd_discover(
    db: &Database,
    user: i64,
    payee: Option<i64>,
    direction: Option<&str>,
) -> Result<()> {
    let direction = direction
        .map(|s| s.parse::<Direction>().map_err(anyhow::Error::msg))
        .transpose()?;
    let filters = DiscoveryFilters {
        payee_id: payee,
        direction,
    };

    let summariser = TemplateSummariser;
    let outcome = PatternDiscovery::new(db)
        .with_summariser(&summariser)
        .discover_for_user(user, &filters)?;

    if outcome.patterns.is_empty() {
        println!("No patterns discovered.");
    }
    for discovered in &outcome.patterns {
        let p = &discovered.pattern;
        let verb = if discovered.created { "new" } else { "updated" };
        println!(
            "[{}] #{} {} every {}d, {} ({}), confidence {:.2}, {} transactions",
            verb,
            p.id,
            p.pattern_case,
            p.interval_days,
            p.representative_amount,
            p.amount_behaviour,
            p.confidence,
            discovered.linked_transactions,
        );
        if let Some(annotation) = &p.annotation {
            println!("      {}", annotation);
        }
    }

    if !outcome.skipped.is_empty() {
        println!("\nSkipped:");
        for skip in &outcome.skipped {
            println!(
                "  payee {} ({}) - {}",
                skip.key.payee_id,
                skip.key.direction,
                skip.reason.as_str()
            );
        }
    }

    Ok(())
}

pub fn cmd_patterns(db: &Database, user: i64, status: Option<&str>) -> Result<()> {
    let status = status
        .map(|s| s.parse::<PatternStatus>().map_err(anyhow::Error::msg))
        .transpose()?;
    let patterns = db.list_patterns(user, status)?;

    if patterns.is_empty() {
        println!("No patterns.");
        return Ok(());
    }

    println!(
        "{:<5} {:<20} {:<18} {:<9} {:>12} {:>6} {:>8}",
        "ID", "PAYEE", "CASE", "STATUS", "AMOUNT", "CONF", "STREAK"
    );
    for p in patterns {
        let payee = db
            .get_payee(p.payee_id)?
            .map(|x| x.name)
            .unwrap_or_else(|| format!("payee {}", p.payee_id));
        let streak = db
            .get_streak(p.id)?
            .map(|s| s.current_streak)
            .unwrap_or(0);
        println!(
            "{:<5} {:<20} {:<18} {:<9} {:>12} {:>6.2} {:>8}",
            p.id,
            payee,
            p.pattern_case.to_string(),
            p.status.to_string(),
            p.representative_amount.to_string(),
            p.confidence,
            streak,
        );
    }

    Ok(())
}

pub fn cmd_upcoming(db: &Database, user: i64, days: i64) -> Result<()> {
    let upcoming = db.upcoming_obligations(user, days)?;

    if upcoming.is_empty() {
        println!("Nothing due in the next {} days.", days);
        return Ok(());
    }

    println!(
        "{:<12} {:<20} {:<18} {:>12} {:>12}",
        "DUE", "PAYEE", "CASE", "MIN", "MAX"
    );
    for (obligation, pattern) in upcoming {
        let payee = db
            .get_payee(pattern.payee_id)?
            .map(|x| x.name)
            .unwrap_or_else(|| format!("payee {}", pattern.payee_id));
        println!(
            "{:<12} {:<20} {:<18} {:>12} {:>12}",
            obligation.expected_date.to_string(),
            payee,
            pattern.pattern_case.to_string(),
            obligation
                .expected_min_amount
                .map(|a| a.to_string())
                .unwrap_or_else(|| "-".to_string()),
            obligation
                .expected_max_amount
                .map(|a| a.to_string())
                .unwrap_or_else(|| "-".to_string()),
        );
    }

    Ok(())
}

pub fn cmd_dead_letters(db: &Database) -> Result<()> {
    let letters = db.list_dead_letters(100)?;
    if letters.is_empty() {
        println!("Dead-letter store is empty.");
        return Ok(());
    }
    for letter in letters {
        println!(
            "#{} transaction {} after {} attempts: {}",
            letter.id, letter.transaction_id, letter.attempts, letter.last_error
        );
    }
    Ok(())
}

/// Seed a small dataset: a salary, a support payment, and three chit
/// schedules to one payee
pub fn cmd_seed_demo(db: &Database, user: i64) -> Result<()> {
    db.upsert_user(user, "demo")?;
    let inr = db.upsert_currency("INR")?;
    let sabitha = db.upsert_payee("Sabitha")?;
    let swathi = db.upsert_payee("Swathi")?;
    let selvam = db.upsert_payee("Selvam")?;

    let mut count = 0;
    let mut ingest = |payee: i64, direction: Direction, y: i32, m: u32, d: u32, amount: i64| {
        count += 1;
        db.insert_transaction(&NewTransaction {
            user_id: user,
            payee_id: payee,
            direction,
            currency_id: inr,
            occurred_at: Utc.with_ymd_and_hms(y, m, d, 9, 0, 0).unwrap(),
            amount: Decimal::from(amount),
            source_message_id: format!("demo-{}", count),
        })
    };

    // Salary credits, one month skipped
    ingest(sabitha, Direction::Credit, 2025, 10, 31, 16500)?;
    ingest(sabitha, Direction::Credit, 2025, 12, 1, 16500)?;
    ingest(sabitha, Direction::Credit, 2025, 12, 30, 16500)?;

    // Variable family support
    ingest(swathi, Direction::Debit, 2025, 10, 1, 4000)?;
    ingest(swathi, Direction::Debit, 2025, 10, 31, 5000)?;
    ingest(swathi, Direction::Debit, 2025, 12, 2, 4000)?;

    // Three chit schedules to one payee
    for (amount, days) in [
        (8500, [(10, 2), (11, 1), (12, 1)]),
        (4300, [(10, 8), (11, 7), (12, 7)]),
        (2400, [(10, 13), (11, 12), (12, 12)]),
    ] {
        for (m, d) in days {
            ingest(selvam, Direction::Debit, 2025, m, d, amount)?;
        }
    }

    println!("Seeded {} demo transactions for user {}.", count, user);
    println!("Run `cadence discover --user {}` next.", user);
    Ok(())
}

pub async fn cmd_serve(path: &str, host: &str, port: u16) -> Result<()> {
    let db = open_db(path)?;
    cadence_server::serve(db, cadence_server::ServerConfig::default(), host, port).await
}
