//! Common types module for the ledger watcher system.
//!
//! This module defines the data shapes exchanged with a rippled node over its
//! websocket API: accounts, transaction hashes, transactions with their
//! metadata, push events and the results of historical queries. Every crate in
//! the workspace speaks in these types.

/// Ledger-level types such as ledger indexes and ledger close notifications.
pub mod ledger;
/// Results of the request/response commands the watcher issues.
pub mod query;
/// Transactions, their metadata and the transaction push event.
pub mod transaction;
/// Utility functions for log formatting.
pub mod utils;

// Re-export all types for convenient access
pub use ledger::*;
pub use query::*;
pub use transaction::*;
pub use utils::truncate_id;
