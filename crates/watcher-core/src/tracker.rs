//! Submit a signed transaction and track it to its validated outcome.
//!
//! Tracking subscribes to the full transaction stream before submitting, so
//! the confirmation cannot slip by between the submit reply and the
//! subscription. The stream has to include failed transactions as well,
//! otherwise a transaction failing on ledger would never be reported.
//!
//! Event flow:
//! 1. wait for the channel to be connected
//! 2. subscribe to the `transactions` stream
//! 3. submit and check the preliminary engine result
//! 4. wait for the validated transaction with the submitted hash

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::instrument;
use watcher_channel::{ChannelError, ChannelEvent, RpcChannel};
use watcher_types::{truncate_id, EngineResult, SubmitResult, TransactionEvent, TransactionHash};

/// A signed transaction ready for submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
	/// Hex-encoded signed transaction blob.
	pub tx_blob: String,
}

impl SignedTransaction {
	pub fn new(tx_blob: impl Into<String>) -> Self {
		Self {
			tx_blob: tx_blob.into(),
		}
	}
}

/// Errors that end tracking.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrackError {
	#[error("Channel must forward all transactions to track submissions")]
	FilteredChannel,
	#[error("Disconnected while tracking transaction")]
	Disconnected,
	#[error("Failed to subscribe to transactions: {0}")]
	SubscriptionFailed(#[source] ChannelError),
	#[error("Failed to submit transaction: {0}")]
	SubmitRequestFailed(#[source] ChannelError),
	#[error("Submission rejected with {engine_result}: {message}")]
	SubmissionRejected {
		engine_result: EngineResult,
		engine_result_code: i64,
		message: String,
	},
	#[error("Transaction {hash} failed on ledger with {result}")]
	TransactionFailedOnLedger {
		hash: TransactionHash,
		result: EngineResult,
	},
	#[error("No validated result within {0:?}")]
	ConfirmationTimeout(Duration),
	#[error("Protocol violation: {0}")]
	Protocol(String),
	#[error("Channel was dropped")]
	ChannelClosed,
}

/// Progress of one submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackState {
	Idle,
	SubscribingToStream,
	Submitting,
	AwaitingConfirmation(TransactionHash),
}

enum Reply {
	Subscribed(Result<Value, ChannelError>),
	Submitted(Result<Value, ChannelError>),
}

/// Submits transactions and reports their validated outcome.
#[derive(Clone)]
pub struct SubmitTracker {
	channel: Arc<dyn RpcChannel>,
}

impl SubmitTracker {
	/// Fails when `channel` does not forward failed transactions.
	pub fn new(channel: Arc<dyn RpcChannel>) -> Result<Self, TrackError> {
		if !channel.forwards_all_transactions() {
			return Err(TrackError::FilteredChannel);
		}
		Ok(Self { channel })
	}

	/// Submits `tx` and resolves with its hash once it is validated successfully.
	///
	/// Waits for a connection when the channel is not connected yet. A
	/// disconnect after submission has started fails with
	/// [`TrackError::Disconnected`]; whether the transaction made it into a
	/// ledger is then unknown.
	#[instrument(skip_all)]
	pub async fn submit_and_track(&self, tx: SignedTransaction) -> Result<TransactionHash, TrackError> {
		let result = Tracking::new(self.channel.clone(), tx).run().await;
		match &result {
			Ok(hash) => tracing::info!(tx_hash = %truncate_id(hash.as_str()), "Transaction validated"),
			Err(e) => tracing::warn!(error = %e, "Tracking failed"),
		}
		result
	}

	/// Like [`SubmitTracker::submit_and_track`], giving up after `timeout`.
	///
	/// The stream subscription is dropped on timeout. The transaction itself
	/// may still be validated later.
	pub async fn submit_and_track_with_timeout(
		&self,
		tx: SignedTransaction,
		timeout: Duration,
	) -> Result<TransactionHash, TrackError> {
		match tokio::time::timeout(timeout, self.submit_and_track(tx)).await {
			Ok(result) => result,
			Err(_) => {
				tracing::warn!(timeout_secs = timeout.as_secs(), "Gave up waiting for confirmation");
				Err(TrackError::ConfirmationTimeout(timeout))
			},
		}
	}
}

struct Tracking {
	channel: Arc<dyn RpcChannel>,
	tx: SignedTransaction,
	state: TrackState,
	/// Stream events seen before the submit reply revealed the hash.
	held: Vec<TransactionEvent>,
	replies_tx: mpsc::UnboundedSender<Reply>,
	replies: mpsc::UnboundedReceiver<Reply>,
}

impl Tracking {
	fn new(channel: Arc<dyn RpcChannel>, tx: SignedTransaction) -> Self {
		let (replies_tx, replies) = mpsc::unbounded_channel();
		Self {
			channel,
			tx,
			state: TrackState::Idle,
			held: Vec::new(),
			replies_tx,
			replies,
		}
	}

	async fn run(mut self) -> Result<TransactionHash, TrackError> {
		let mut events = self.channel.subscribe();
		if self.channel.is_connected() {
			self.subscribe_to_stream();
		} else {
			tracing::debug!("Waiting for connection");
		}

		loop {
			let outcome = tokio::select! {
				biased;
				Some(reply) = self.replies.recv() => self.on_reply(reply),
				event = events.recv() => match event {
					Some(event) => self.on_event(event),
					None => Some(Err(TrackError::ChannelClosed)),
				},
			};
			if let Some(outcome) = outcome {
				return outcome;
			}
		}
	}

	fn subscribe_to_stream(&mut self) {
		tracing::debug!("Subscribing to transactions");
		self.state = TrackState::SubscribingToStream;
		let channel = self.channel.clone();
		let replies = self.replies_tx.clone();
		tokio::spawn(async move {
			let result = channel
				.request("subscribe", json!({ "streams": ["transactions"] }))
				.await;
			let _ = replies.send(Reply::Subscribed(result));
		});
	}

	fn submit(&mut self) {
		tracing::debug!("Submitting transaction");
		self.state = TrackState::Submitting;
		let channel = self.channel.clone();
		let replies = self.replies_tx.clone();
		let params = json!({ "tx_blob": self.tx.tx_blob });
		tokio::spawn(async move {
			let result = channel.request("submit", params).await;
			let _ = replies.send(Reply::Submitted(result));
		});
	}

	fn on_reply(&mut self, reply: Reply) -> Option<Result<TransactionHash, TrackError>> {
		match reply {
			Reply::Subscribed(Ok(_)) => {
				if self.state == TrackState::SubscribingToStream {
					self.submit();
				}
				None
			},
			Reply::Subscribed(Err(e)) if e.is_disconnect() => Some(Err(TrackError::Disconnected)),
			Reply::Subscribed(Err(e)) => Some(Err(TrackError::SubscriptionFailed(e))),
			Reply::Submitted(Err(e)) if e.is_disconnect() => Some(Err(TrackError::Disconnected)),
			Reply::Submitted(Err(e)) => Some(Err(TrackError::SubmitRequestFailed(e))),
			Reply::Submitted(Ok(value)) => self.on_submitted(value),
		}
	}

	fn on_submitted(&mut self, value: Value) -> Option<Result<TransactionHash, TrackError>> {
		let result: SubmitResult = match serde_json::from_value(value) {
			Ok(result) => result,
			Err(e) => {
				return Some(Err(TrackError::Protocol(format!(
					"malformed submit result: {}",
					e
				))))
			},
		};

		if !result.engine_result.is_success() {
			return Some(Err(TrackError::SubmissionRejected {
				engine_result: result.engine_result,
				engine_result_code: result.engine_result_code,
				message: result.engine_result_message,
			}));
		}

		let hash = result.tx_json.hash;
		tracing::info!(tx_hash = %truncate_id(hash.as_str()), "Transaction submitted, awaiting validation");
		self.state = TrackState::AwaitingConfirmation(hash.clone());

		std::mem::take(&mut self.held)
			.iter()
			.find_map(|event| confirmation(event, &hash))
	}

	fn on_event(&mut self, event: ChannelEvent) -> Option<Result<TransactionHash, TrackError>> {
		match event {
			ChannelEvent::Open => {
				if self.state == TrackState::Idle {
					self.subscribe_to_stream();
				}
				None
			},
			ChannelEvent::Close => {
				if self.state == TrackState::Idle {
					return None;
				}
				Some(Err(TrackError::Disconnected))
			},
			ChannelEvent::Transaction(event) => match &self.state {
				TrackState::AwaitingConfirmation(hash) => confirmation(&event, hash),
				TrackState::Submitting => {
					self.held.push(*event);
					None
				},
				TrackState::Idle | TrackState::SubscribingToStream => None,
			},
			ChannelEvent::LedgerClosed(_) => None,
		}
	}
}

/// Outcome carried by `event` if it is the transaction with `hash`.
fn confirmation(event: &TransactionEvent, hash: &TransactionHash) -> Option<Result<TransactionHash, TrackError>> {
	if event.transaction.hash != *hash {
		return None;
	}
	if !event.is_closed() || !event.validated {
		return Some(Err(TrackError::Protocol(format!(
			"transaction {} reported with status '{}' and validated={}",
			hash, event.status, event.validated
		))));
	}
	if !event.transaction.is_payment() {
		return Some(Err(TrackError::Protocol(format!(
			"transaction {} is a {}, expected a Payment",
			hash, event.transaction.transaction_type
		))));
	}
	if event.meta.result.is_success() {
		Some(Ok(hash.clone()))
	} else {
		Some(Err(TrackError::TransactionFailedOnLedger {
			hash: hash.clone(),
			result: event.meta.result.clone(),
		}))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tokio::task::JoinHandle;
	use watcher_channel::implementations::memory::{MemoryChannel, MemoryRemote};

	const TX_BLOB: &str = "1200002280000000240000000161D4838D7EA4C68000";

	fn submit_reply(engine_result: &str, hash: &str) -> Value {
		let code = if engine_result == "tesSUCCESS" { 0 } else { -190 };
		json!({
			"engine_result": engine_result,
			"engine_result_code": code,
			"engine_result_message": "The transaction was applied.",
			"tx_blob": TX_BLOB,
			"tx_json": {"hash": hash, "Sequence": 1, "TransactionType": "Payment"}
		})
	}

	fn confirmed(hash: &str, result: &str) -> TransactionEvent {
		stream_event(hash, result, "closed", true)
	}

	fn stream_event(hash: &str, result: &str, status: &str, validated: bool) -> TransactionEvent {
		serde_json::from_value(json!({
			"status": status,
			"validated": validated,
			"engine_result": result,
			"ledger_index": 120,
			"transaction": {
				"TransactionType": "Payment",
				"Account": "rSender",
				"Destination": "rReceiver",
				"hash": hash
			},
			"meta": {"TransactionResult": result}
		}))
		.unwrap()
	}

	fn track(channel: &Arc<MemoryChannel>) -> JoinHandle<Result<TransactionHash, TrackError>> {
		let tracker = SubmitTracker::new(channel.clone()).unwrap();
		tokio::spawn(async move { tracker.submit_and_track(SignedTransaction::new(TX_BLOB)).await })
	}

	async fn settle() {
		tokio::time::sleep(Duration::from_millis(1)).await;
	}

	/// Answers the stream subscription and returns the submit request id.
	async fn subscribe_and_expect_submit(remote: &mut MemoryRemote) -> u64 {
		let subscribe = remote.expect_request("subscribe").await;
		assert_eq!(subscribe.params, json!({"streams": ["transactions"]}));
		remote.respond(subscribe.id, Ok(json!({})));

		let submit = remote.expect_request("submit").await;
		assert_eq!(submit.params, json!({"tx_blob": TX_BLOB}));
		submit.id
	}

	#[tokio::test]
	async fn test_requires_unfiltered_channel() {
		let (channel, _remote) = MemoryChannel::pair(false);
		assert!(matches!(
			SubmitTracker::new(channel),
			Err(TrackError::FilteredChannel)
		));
	}

	#[tokio::test(start_paused = true)]
	async fn test_resolves_on_matching_validated_success() {
		let (channel, mut remote) = MemoryChannel::pair(true);
		remote.open();
		let task = track(&channel);

		let submit = subscribe_and_expect_submit(&mut remote).await;
		remote.respond(submit, Ok(submit_reply("tesSUCCESS", "H2")));
		settle().await;

		remote.push_transaction(confirmed("H1", "tesSUCCESS"));
		settle().await;
		assert!(!task.is_finished());

		remote.push_transaction(confirmed("H2", "tesSUCCESS"));
		assert_eq!(task.await.unwrap(), Ok(TransactionHash::from("H2")));
		assert_eq!(channel.subscriber_count(), 0);
	}

	#[tokio::test(start_paused = true)]
	async fn test_reports_failure_on_ledger() {
		let (channel, mut remote) = MemoryChannel::pair(true);
		remote.open();
		let task = track(&channel);

		let submit = subscribe_and_expect_submit(&mut remote).await;
		remote.respond(submit, Ok(submit_reply("tesSUCCESS", "H2")));
		settle().await;
		remote.push_transaction(confirmed("H2", "tecPATH_DRY"));

		assert_eq!(
			task.await.unwrap(),
			Err(TrackError::TransactionFailedOnLedger {
				hash: TransactionHash::from("H2"),
				result: EngineResult::from("tecPATH_DRY"),
			})
		);
	}

	#[tokio::test(start_paused = true)]
	async fn test_confirmation_before_submit_reply_is_kept() {
		let (channel, mut remote) = MemoryChannel::pair(true);
		remote.open();
		let task = track(&channel);

		let submit = subscribe_and_expect_submit(&mut remote).await;
		remote.push_transaction(confirmed("H2", "tesSUCCESS"));
		settle().await;
		assert!(!task.is_finished());

		remote.respond(submit, Ok(submit_reply("tesSUCCESS", "H2")));
		assert_eq!(task.await.unwrap(), Ok(TransactionHash::from("H2")));
	}

	#[tokio::test(start_paused = true)]
	async fn test_rejected_submission() {
		let (channel, mut remote) = MemoryChannel::pair(true);
		remote.open();
		let task = track(&channel);

		let submit = subscribe_and_expect_submit(&mut remote).await;
		remote.respond(submit, Ok(submit_reply("tefPAST_SEQ", "H2")));

		match task.await.unwrap() {
			Err(TrackError::SubmissionRejected {
				engine_result,
				engine_result_code,
				..
			}) => {
				assert_eq!(engine_result, EngineResult::from("tefPAST_SEQ"));
				assert_eq!(engine_result_code, -190);
			},
			other => panic!("unexpected outcome {:?}", other),
		}
		assert_eq!(channel.subscriber_count(), 0);
	}

	#[tokio::test(start_paused = true)]
	async fn test_submit_request_failure() {
		let (channel, mut remote) = MemoryChannel::pair(true);
		remote.open();
		let task = track(&channel);

		let submit = subscribe_and_expect_submit(&mut remote).await;
		let error = ChannelError::Remote {
			code: "invalidParams".to_string(),
			message: "Invalid parameters.".to_string(),
		};
		remote.respond(submit, Err(error.clone()));

		assert_eq!(task.await.unwrap(), Err(TrackError::SubmitRequestFailed(error)));
	}

	#[tokio::test(start_paused = true)]
	async fn test_subscription_failure() {
		let (channel, mut remote) = MemoryChannel::pair(true);
		remote.open();
		let task = track(&channel);

		let subscribe = remote.expect_request("subscribe").await;
		let error = ChannelError::Remote {
			code: "noPermission".to_string(),
			message: "You don't have permission for this command.".to_string(),
		};
		remote.respond(subscribe.id, Err(error.clone()));

		assert_eq!(task.await.unwrap(), Err(TrackError::SubscriptionFailed(error)));
		assert!(remote.try_next_request().is_none());
	}

	#[tokio::test(start_paused = true)]
	async fn test_waits_for_connection() {
		let (channel, mut remote) = MemoryChannel::pair(true);
		let task = track(&channel);
		settle().await;
		assert!(remote.try_next_request().is_none());

		remote.close();
		settle().await;
		assert!(!task.is_finished());

		remote.open();
		let submit = subscribe_and_expect_submit(&mut remote).await;
		remote.respond(submit, Ok(submit_reply("tesSUCCESS", "H2")));
		settle().await;
		remote.push_transaction(confirmed("H2", "tesSUCCESS"));

		assert_eq!(task.await.unwrap(), Ok(TransactionHash::from("H2")));
	}

	#[tokio::test(start_paused = true)]
	async fn test_repeated_open_submits_once() {
		let (channel, mut remote) = MemoryChannel::pair(true);
		let task = track(&channel);
		settle().await;

		remote.open();
		let subscribe = remote.expect_request("subscribe").await;
		remote.open();
		settle().await;
		assert!(remote.try_next_request().is_none());

		remote.respond(subscribe.id, Ok(json!({})));
		let submit = remote.expect_request("submit").await;
		settle().await;
		assert!(remote.try_next_request().is_none());

		remote.respond(submit.id, Ok(submit_reply("tesSUCCESS", "H2")));
		settle().await;
		remote.push_transaction(confirmed("H2", "tesSUCCESS"));
		assert_eq!(task.await.unwrap(), Ok(TransactionHash::from("H2")));
	}

	#[tokio::test(start_paused = true)]
	async fn test_disconnect_while_submitting() {
		let (channel, mut remote) = MemoryChannel::pair(true);
		remote.open();
		let task = track(&channel);

		let _submit = subscribe_and_expect_submit(&mut remote).await;
		remote.close();

		assert_eq!(task.await.unwrap(), Err(TrackError::Disconnected));
	}

	#[tokio::test(start_paused = true)]
	async fn test_disconnect_while_awaiting_confirmation() {
		let (channel, mut remote) = MemoryChannel::pair(true);
		remote.open();
		let task = track(&channel);

		let submit = subscribe_and_expect_submit(&mut remote).await;
		remote.respond(submit, Ok(submit_reply("tesSUCCESS", "H2")));
		settle().await;
		remote.close();

		assert_eq!(task.await.unwrap(), Err(TrackError::Disconnected));
		assert_eq!(channel.subscriber_count(), 0);
	}

	#[tokio::test(start_paused = true)]
	async fn test_unvalidated_confirmation_is_protocol_error() {
		let (channel, mut remote) = MemoryChannel::pair(true);
		remote.open();
		let task = track(&channel);

		let submit = subscribe_and_expect_submit(&mut remote).await;
		remote.respond(submit, Ok(submit_reply("tesSUCCESS", "H2")));
		settle().await;
		remote.push_transaction(stream_event("H2", "tesSUCCESS", "proposed", false));

		assert!(matches!(task.await.unwrap(), Err(TrackError::Protocol(_))));
	}

	#[tokio::test(start_paused = true)]
	async fn test_timeout_releases_subscription() {
		let (channel, mut remote) = MemoryChannel::pair(true);
		remote.open();
		let tracker = SubmitTracker::new(channel.clone()).unwrap();
		let task = tokio::spawn(async move {
			tracker
				.submit_and_track_with_timeout(SignedTransaction::new(TX_BLOB), Duration::from_secs(30))
				.await
		});

		let submit = subscribe_and_expect_submit(&mut remote).await;
		remote.respond(submit, Ok(submit_reply("tesSUCCESS", "H2")));

		assert_eq!(
			task.await.unwrap(),
			Err(TrackError::ConfirmationTimeout(Duration::from_secs(30)))
		);
		assert_eq!(channel.subscriber_count(), 0);
	}
}
