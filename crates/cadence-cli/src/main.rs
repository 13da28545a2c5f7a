//! Cadence CLI - recurring-obligation discovery and tracking
//!
//! Usage:
//!   cadence init                  Initialize database
//!   cadence seed-demo             Load a demo dataset
//!   cadence discover --user 1     Run pattern discovery
//!   cadence patterns --user 1     List discovered patterns
//!   cadence upcoming --user 1     Show pending obligations
//!   cadence serve --port 3000     Start web server

mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Priority: RUST_LOG env var > --verbose flag > default (info)
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).compact())
        .init();

    match cli.command {
        Commands::Init => commands::cmd_init(&cli.db),
        Commands::Discover {
            user,
            payee,
            direction,
        } => {
            let db = commands::open_db(&cli.db)?;
            commands::cmd_discover(&db, user, payee, direction.as_deref())
        }
        Commands::Patterns { user, status } => {
            let db = commands::open_db(&cli.db)?;
            commands::cmd_patterns(&db, user, status.as_deref())
        }
        Commands::Upcoming { user, days } => {
            let db = commands::open_db(&cli.db)?;
            commands::cmd_upcoming(&db, user, days)
        }
        Commands::DeadLetters => {
            let db = commands::open_db(&cli.db)?;
            commands::cmd_dead_letters(&db)
        }
        Commands::SeedDemo { user } => {
            let db = commands::open_db(&cli.db)?;
            commands::cmd_seed_demo(&db, user)
        }
        Commands::Serve { host, port } => commands::cmd_serve(&cli.db, &host, port).await,
    }
}
