//! CLI argument definitions

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "cadence")]
#[command(about = "Recurring-obligation discovery and tracking", long_about = None)]
pub struct Cli {
    /// Path to the database file
    #[arg(long, global = true, default_value = "cadence.db")]
    pub db: String,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize the database
    Init,

    /// Run pattern discovery for a user
    Discover {
        /// User to analyze
        #[arg(long)]
        user: i64,
        /// Only this payee
        #[arg(long)]
        payee: Option<i64>,
        /// Only this direction (debit or credit)
        #[arg(long)]
        direction: Option<String>,
    },

    /// List a user's patterns
    Patterns {
        #[arg(long)]
        user: i64,
        /// Filter by status (active, paused, broken, archived)
        #[arg(long)]
        status: Option<String>,
    },

    /// Pending obligations due within a window
    Upcoming {
        #[arg(long)]
        user: i64,
        /// Days ahead to look
        #[arg(long, default_value = "30")]
        days: i64,
    },

    /// Matcher work that exhausted its retries
    DeadLetters,

    /// Load a small demo dataset for manual testing
    SeedDemo {
        #[arg(long, default_value = "1")]
        user: i64,
    },

    /// Start the web server
    Serve {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(short, long, default_value = "3000")]
        port: u16,
    },
}
