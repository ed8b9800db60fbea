//! Transaction types for the watcher system.
//!
//! Only the fields the watcher reasons about are modelled explicitly. All other
//! fields (amounts, flags, affected nodes and so on) are preserved verbatim so
//! that subscribers receive the full transaction as the node reported it.

use crate::LedgerIndex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Classic address of a ledger account, e.g. `rHb9CJAWyB4rj91VRWn96DkukG4bwdtyTh`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountAddress(pub String);

impl AccountAddress {
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for AccountAddress {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl From<&str> for AccountAddress {
	fn from(s: &str) -> Self {
		Self(s.to_string())
	}
}

impl From<String> for AccountAddress {
	fn from(s: String) -> Self {
		Self(s)
	}
}

/// Transaction hash as reported by the node (64 uppercase hex characters).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionHash(pub String);

impl TransactionHash {
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for TransactionHash {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl From<&str> for TransactionHash {
	fn from(s: &str) -> Self {
		Self(s.to_string())
	}
}

/// Kind of a transaction. Only payments are of interest to the watcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TransactionType {
	Payment,
	Other(String),
}

impl From<String> for TransactionType {
	fn from(s: String) -> Self {
		if s == "Payment" {
			TransactionType::Payment
		} else {
			TransactionType::Other(s)
		}
	}
}

impl From<TransactionType> for String {
	fn from(t: TransactionType) -> Self {
		match t {
			TransactionType::Payment => "Payment".to_string(),
			TransactionType::Other(s) => s,
		}
	}
}

impl fmt::Display for TransactionType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			TransactionType::Payment => f.write_str("Payment"),
			TransactionType::Other(s) => f.write_str(s),
		}
	}
}

/// Outcome code assigned by the ledger engine, e.g. `tesSUCCESS` or `tecPATH_DRY`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EngineResult(pub String);

impl EngineResult {
	/// The only result code that denotes a successful transaction.
	pub const SUCCESS: &'static str = "tesSUCCESS";

	pub fn is_success(&self) -> bool {
		self.0 == Self::SUCCESS
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for EngineResult {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl From<&str> for EngineResult {
	fn from(s: &str) -> Self {
		Self(s.to_string())
	}
}

/// A transaction as it appears in the `transaction` stream and in `account_tx` pages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
	#[serde(rename = "TransactionType")]
	pub transaction_type: TransactionType,
	/// Sending account.
	#[serde(rename = "Account")]
	pub account: AccountAddress,
	/// Receiving account, present on payments.
	#[serde(
		rename = "Destination",
		default,
		skip_serializing_if = "Option::is_none"
	)]
	pub destination: Option<AccountAddress>,
	pub hash: TransactionHash,
	/// Ledger the transaction was included in, when the node reports it inline.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub ledger_index: Option<LedgerIndex>,
	/// Every other field of the transaction.
	#[serde(flatten)]
	pub fields: Map<String, Value>,
}

impl Transaction {
	pub fn is_payment(&self) -> bool {
		self.transaction_type == TransactionType::Payment
	}
}

/// Execution metadata attached to a validated transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionMeta {
	#[serde(rename = "TransactionResult")]
	pub result: EngineResult,
	/// Every other metadata field (affected nodes, delivered amount, ...).
	#[serde(flatten)]
	pub fields: Map<String, Value>,
}

/// Payload of a `transaction` push event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionEvent {
	pub transaction: Transaction,
	pub meta: TransactionMeta,
	/// `closed` once the transaction is part of a closed ledger.
	pub status: String,
	#[serde(default)]
	pub validated: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub engine_result: Option<EngineResult>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub ledger_index: Option<LedgerIndex>,
}

impl TransactionEvent {
	pub fn is_closed(&self) -> bool {
		self.status == "closed"
	}

	/// Ledger index of the event, taken from the envelope or the transaction body.
	pub fn ledger(&self) -> Option<LedgerIndex> {
		self.ledger_index.or(self.transaction.ledger_index)
	}
}
