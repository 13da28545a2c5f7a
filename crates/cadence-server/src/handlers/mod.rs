//! Request handlers, organized by domain

mod obligations;
mod patterns;
mod transactions;

pub use obligations::{list_pattern_obligations, upcoming_obligations};
pub use patterns::{
    delete_pattern, discover_patterns, get_pattern, list_patterns, update_pattern,
};
pub use transactions::{ingest_transaction, list_dead_letters, list_transactions};
