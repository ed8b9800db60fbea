//! Request results used by the watcher.
//!
//! The historical query (`account_tx`) and the transaction submission
//! (`submit`) are the two commands whose results the core inspects.

use crate::{EngineResult, Transaction, TransactionHash, TransactionMeta};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque pagination token returned by `account_tx`.
///
/// The node defines its shape; the watcher only echoes it back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Marker(pub Value);

/// One transaction entry of an `account_tx` page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountTxEntry {
	pub tx: Transaction,
	pub meta: TransactionMeta,
	#[serde(default)]
	pub validated: bool,
}

/// One page of an `account_tx` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountTxPage {
	pub transactions: Vec<AccountTxEntry>,
	/// Present when more pages follow.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub marker: Option<Marker>,
}

/// The part of the submitted transaction echoed back by `submit`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmittedTransaction {
	pub hash: TransactionHash,
	#[serde(rename = "Sequence", default, skip_serializing_if = "Option::is_none")]
	pub sequence: Option<u32>,
}

/// Result of a `submit` command.
///
/// A successful response only means the node accepted the request; the
/// preliminary engine result still has to be `tesSUCCESS` for the transaction
/// to have a chance of being included in a ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitResult {
	pub engine_result: EngineResult,
	#[serde(default)]
	pub engine_result_code: i64,
	#[serde(default)]
	pub engine_result_message: String,
	pub tx_json: SubmittedTransaction,
}
