//! Ledger types.

use serde::{Deserialize, Serialize};

/// Sequence number of a ledger.
pub type LedgerIndex = u32;

/// Payload of a `ledgerClosed` push event from the `ledger` stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerClosedEvent {
	/// Index of the ledger that just closed.
	pub ledger_index: LedgerIndex,
	/// Hash of the ledger that just closed.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub ledger_hash: Option<String>,
	/// Close time in seconds since the ripple epoch.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub ledger_time: Option<u64>,
	/// Number of transactions included in the ledger.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub txn_count: Option<u32>,
}
