//! Paginated historical catch-up for one account.
//!
//! A scan requests `account_tx` pages from a starting ledger up to the latest
//! validated ledger, following the returned marker until the node stops
//! returning one. Only transactions that succeeded on ledger are yielded. The
//! first failed page ends the scan; retrying is up to the caller.

use async_stream::try_stream;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio_stream::Stream;
use watcher_channel::{ChannelError, RpcChannel};
use watcher_types::{truncate_id, AccountAddress, AccountTxEntry, AccountTxPage, LedgerIndex, Marker};

/// Default number of transactions requested per page.
pub const DEFAULT_PAGE_SIZE: u32 = 200;

/// `ledger_index_max` value meaning "the latest validated ledger".
const CURRENT_LEDGER: i64 = -1;

/// Errors that end a catch-up scan.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScanError {
	/// The page request failed.
	#[error("account_tx request failed: {0}")]
	Request(#[source] ChannelError),
	/// The node answered with something that is not an `account_tx` page.
	#[error("Malformed account_tx page: {0}")]
	MalformedPage(String),
}

impl ScanError {
	pub fn is_not_synced(&self) -> bool {
		matches!(self, ScanError::Request(e) if e.is_not_synced())
	}
}

#[derive(Serialize)]
struct AccountTxParams<'a> {
	account: &'a AccountAddress,
	ledger_index_min: i64,
	ledger_index_max: i64,
	limit: u32,
	#[serde(skip_serializing_if = "Option::is_none")]
	marker: Option<&'a Marker>,
}

/// Scanner issuing `account_tx` page requests over a channel.
#[derive(Clone)]
pub struct CatchUpScanner {
	channel: Arc<dyn RpcChannel>,
	page_size: u32,
}

impl CatchUpScanner {
	pub fn new(channel: Arc<dyn RpcChannel>, page_size: u32) -> Self {
		Self {
			channel,
			page_size: page_size.max(1),
		}
	}

	/// Streams every successful transaction of `account` from ledger `from` onward.
	///
	/// The stream ends after the last page, or right after yielding the first error.
	pub fn scan(
		&self,
		account: AccountAddress,
		from: LedgerIndex,
	) -> impl Stream<Item = Result<AccountTxEntry, ScanError>> + Send + 'static {
		let channel = self.channel.clone();
		let limit = self.page_size;

		try_stream! {
			let mut marker: Option<Marker> = None;
			let mut pages = 0u32;

			loop {
				let params = serde_json::to_value(AccountTxParams {
					account: &account,
					ledger_index_min: i64::from(from),
					ledger_index_max: CURRENT_LEDGER,
					limit,
					marker: marker.as_ref(),
				})
				.map_err(|e| ScanError::MalformedPage(e.to_string()))?;

				let result = channel
					.request("account_tx", params)
					.await
					.map_err(ScanError::Request)?;
				pages += 1;

				let page: AccountTxPage = serde_json::from_value(result)
					.map_err(|e| ScanError::MalformedPage(e.to_string()))?;

				for entry in page.transactions {
					if !entry.meta.result.is_success() {
						tracing::trace!(
							tx_hash = %truncate_id(entry.tx.hash.as_str()),
							result = %entry.meta.result,
							"Skipping unsuccessful transaction"
						);
						continue;
					}
					yield entry;
				}

				match page.marker {
					Some(next) => marker = Some(next),
					None => break,
				}
			}

			tracing::debug!(account = %account, from_ledger = from, pages, "Catch-up scan complete");
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::{json, Value};
	use tokio_stream::StreamExt;
	use watcher_channel::implementations::memory::{MemoryChannel, MemoryRemote};

	fn entry(hash: &str, result: &str) -> Value {
		json!({
			"tx": {
				"TransactionType": "Payment",
				"Account": "rSender",
				"Destination": "rReceiver",
				"hash": hash
			},
			"meta": {"TransactionResult": result},
			"validated": true
		})
	}

	fn spawn_scan(
		channel: Arc<MemoryChannel>,
		from: LedgerIndex,
		page_size: u32,
	) -> tokio::task::JoinHandle<Vec<Result<AccountTxEntry, ScanError>>> {
		let scanner = CatchUpScanner::new(channel, page_size);
		tokio::spawn(async move {
			scanner
				.scan(AccountAddress::from("rReceiver"), from)
				.collect::<Vec<_>>()
				.await
		})
	}

	fn hashes(items: &[Result<AccountTxEntry, ScanError>]) -> Vec<String> {
		items
			.iter()
			.filter_map(|item| item.as_ref().ok())
			.map(|entry| entry.tx.hash.0.clone())
			.collect()
	}

	async fn connected() -> (Arc<MemoryChannel>, MemoryRemote) {
		let (channel, remote) = MemoryChannel::pair(true);
		remote.open();
		(channel, remote)
	}

	#[tokio::test]
	async fn test_follows_markers_until_absent() {
		let (channel, mut remote) = connected().await;
		let scan = spawn_scan(channel, 100, 2);

		let first = remote.expect_request("account_tx").await;
		assert_eq!(
			first.params,
			json!({
				"account": "rReceiver",
				"ledger_index_min": 100,
				"ledger_index_max": -1,
				"limit": 2
			})
		);
		remote.respond(
			first.id,
			Ok(json!({"transactions": [entry("H1", "tesSUCCESS"), entry("H2", "tesSUCCESS")], "marker": "m1"})),
		);

		let second = remote.expect_request("account_tx").await;
		assert_eq!(second.params["marker"], json!("m1"));
		remote.respond(
			second.id,
			Ok(json!({"transactions": [entry("H3", "tesSUCCESS")], "marker": {"ledger": 104, "seq": 0}})),
		);

		let third = remote.expect_request("account_tx").await;
		assert_eq!(third.params["marker"], json!({"ledger": 104, "seq": 0}));
		remote.respond(third.id, Ok(json!({"transactions": []})));

		let items = scan.await.unwrap();
		assert_eq!(hashes(&items), vec!["H1", "H2", "H3"]);
		assert!(items.iter().all(Result::is_ok));
		assert!(remote.try_next_request().is_none());
	}

	#[tokio::test]
	async fn test_drops_unsuccessful_transactions() {
		let (channel, mut remote) = connected().await;
		let scan = spawn_scan(channel, 1, DEFAULT_PAGE_SIZE);

		let request = remote.expect_request("account_tx").await;
		remote.respond(
			request.id,
			Ok(json!({"transactions": [
				entry("H1", "tecPATH_DRY"),
				entry("H2", "tesSUCCESS"),
				entry("H3", "tecUNFUNDED_PAYMENT")
			]})),
		);

		let items = scan.await.unwrap();
		assert_eq!(hashes(&items), vec!["H2"]);
	}

	#[tokio::test]
	async fn test_page_error_aborts_scan() {
		let (channel, mut remote) = connected().await;
		let scan = spawn_scan(channel, 1, DEFAULT_PAGE_SIZE);

		let first = remote.expect_request("account_tx").await;
		remote.respond(
			first.id,
			Ok(json!({"transactions": [entry("H1", "tesSUCCESS")], "marker": "m1"})),
		);

		let second = remote.expect_request("account_tx").await;
		remote.respond(
			second.id,
			Err(ChannelError::NotSynced("Not synced to Ripple network.".to_string())),
		);

		let items = scan.await.unwrap();
		assert_eq!(items.len(), 2);
		assert_eq!(hashes(&items), vec!["H1"]);
		let error = items[1].as_ref().unwrap_err();
		assert!(error.is_not_synced());
		assert!(remote.try_next_request().is_none());
	}

	#[tokio::test]
	async fn test_missing_transactions_is_malformed() {
		let (channel, mut remote) = connected().await;
		let scan = spawn_scan(channel, 1, DEFAULT_PAGE_SIZE);

		let request = remote.expect_request("account_tx").await;
		remote.respond(request.id, Ok(json!({"marker": "m1"})));

		let items = scan.await.unwrap();
		assert!(matches!(items.as_slice(), [Err(ScanError::MalformedPage(_))]));
	}

	#[tokio::test]
	async fn test_disconnected_channel() {
		let (channel, _remote) = MemoryChannel::pair(true);
		let items = spawn_scan(channel, 1, DEFAULT_PAGE_SIZE).await.unwrap();
		assert_eq!(
			items,
			vec![Err(ScanError::Request(ChannelError::NotConnected))]
		);
	}
}
