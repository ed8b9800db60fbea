//! Core reconciliation logic for the ledger watcher system.
//!
//! This crate combines the live transaction stream of a node with paginated
//! historical queries so that payments are neither lost nor duplicated across
//! reconnects, and tracks individual submissions until the network validates
//! them:
//! - [`CatchUpScanner`]: pages through `account_tx` from a ledger index to now
//! - [`AccountMonitor`]: delivers incoming payments for a set of watched accounts
//! - [`SubmitTracker`]: submits one transaction and waits for its validated outcome

pub mod monitor;
pub mod scanner;
pub mod tracker;

pub use monitor::{AccountMonitor, LiveState, MonitorError, MonitorEvent, ResyncError};
pub use scanner::{CatchUpScanner, ScanError};
pub use tracker::{SignedTransaction, SubmitTracker, TrackError, TrackState};
