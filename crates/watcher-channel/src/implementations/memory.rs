//! In-memory channel for exercising channel consumers without a node.
//!
//! [`MemoryChannel`] is handed to the code under test while the paired
//! [`MemoryRemote`] plays the node: it opens and closes the connection,
//! answers requests and pushes events. The same guarantees as the websocket
//! channel hold: ids restart on every connection, and pending requests fail
//! with [`ChannelError::Disconnected`] before `Close` is published.

use crate::{ChannelError, ChannelEvent, ChannelSubscription, EventHub, RpcChannel};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use watcher_types::{LedgerClosedEvent, LedgerIndex, TransactionEvent};

/// How long [`MemoryRemote::expect_request`] waits before giving up.
const REQUEST_WAIT: Duration = Duration::from_secs(60);

/// A request observed by the remote side.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryRequest {
	pub id: u64,
	pub command: String,
	pub params: Value,
}

#[derive(Default)]
struct State {
	connected: bool,
	next_id: u64,
	pending: HashMap<u64, oneshot::Sender<Result<Value, ChannelError>>>,
}

/// Channel side handed to the code under test.
pub struct MemoryChannel {
	hub: EventHub,
	state: Mutex<State>,
	requests: mpsc::UnboundedSender<MemoryRequest>,
	forward_all: bool,
}

impl MemoryChannel {
	/// Creates a disconnected channel and its remote.
	pub fn pair(forward_all: bool) -> (Arc<MemoryChannel>, MemoryRemote) {
		let (requests, incoming) = mpsc::unbounded_channel();
		let channel = Arc::new(MemoryChannel {
			hub: EventHub::new(),
			state: Mutex::new(State::default()),
			requests,
			forward_all,
		});
		let remote = MemoryRemote {
			channel: channel.clone(),
			incoming,
		};
		(channel, remote)
	}

	fn state(&self) -> MutexGuard<'_, State> {
		self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
	}

	/// Number of registered event subscribers.
	pub fn subscriber_count(&self) -> usize {
		self.hub.subscriber_count()
	}
}

#[async_trait]
impl RpcChannel for MemoryChannel {
	async fn request(&self, command: &str, params: Value) -> Result<Value, ChannelError> {
		let reply = {
			let mut state = self.state();
			if !state.connected {
				return Err(ChannelError::NotConnected);
			}
			let id = state.next_id;
			state.next_id += 1;
			let (sender, reply) = oneshot::channel();
			state.pending.insert(id, sender);
			let _ = self.requests.send(MemoryRequest {
				id,
				command: command.to_string(),
				params,
			});
			reply
		};

		match reply.await {
			Ok(result) => result,
			Err(_) => Err(ChannelError::Disconnected),
		}
	}

	fn subscribe(&self) -> ChannelSubscription {
		self.hub.subscribe()
	}

	fn is_connected(&self) -> bool {
		self.state().connected
	}

	fn forwards_all_transactions(&self) -> bool {
		self.forward_all
	}
}

/// Node side of a [`MemoryChannel`].
pub struct MemoryRemote {
	channel: Arc<MemoryChannel>,
	incoming: mpsc::UnboundedReceiver<MemoryRequest>,
}

impl MemoryRemote {
	/// Establishes a connection and publishes `Open`.
	pub fn open(&self) {
		{
			let mut state = self.channel.state();
			state.connected = true;
			state.next_id = 0;
		}
		self.channel.hub.publish(ChannelEvent::Open);
	}

	/// Drops the connection: fails pending requests, then publishes `Close`.
	pub fn close(&mut self) {
		let pending = {
			let mut state = self.channel.state();
			state.connected = false;
			std::mem::take(&mut state.pending)
		};
		for (_, sender) in pending {
			let _ = sender.send(Err(ChannelError::Disconnected));
		}
		while self.incoming.try_recv().is_ok() {}
		self.channel.hub.publish(ChannelEvent::Close);
	}

	/// Answers the request with the given id. Returns false if it is no longer pending.
	pub fn respond(&self, id: u64, reply: Result<Value, ChannelError>) -> bool {
		let sender = self.channel.state().pending.remove(&id);
		match sender {
			Some(sender) => sender.send(reply).is_ok(),
			None => false,
		}
	}

	/// Waits for the next request issued through the channel.
	pub async fn next_request(&mut self) -> Option<MemoryRequest> {
		tokio::time::timeout(REQUEST_WAIT, self.incoming.recv())
			.await
			.ok()
			.flatten()
	}

	/// Waits for the next request and checks its command.
	///
	/// # Panics
	///
	/// Panics if no request arrives or the command differs.
	pub async fn expect_request(&mut self, command: &str) -> MemoryRequest {
		match self.next_request().await {
			Some(request) if request.command == command => request,
			Some(request) => panic!("expected '{}' request, got {:?}", command, request),
			None => panic!("expected '{}' request, got none", command),
		}
	}

	/// Returns an already issued request without waiting.
	pub fn try_next_request(&mut self) -> Option<MemoryRequest> {
		self.incoming.try_recv().ok()
	}

	/// Pushes a transaction event, honouring the channel's forwarding mode.
	pub fn push_transaction(&self, event: TransactionEvent) {
		let succeeded = event
			.engine_result
			.as_ref()
			.map_or(event.meta.result.is_success(), |r| r.is_success());
		if self.channel.forward_all || succeeded {
			self.channel
				.hub
				.publish(ChannelEvent::Transaction(Box::new(event)));
		}
	}

	/// Pushes a `ledgerClosed` event.
	pub fn push_ledger_closed(&self, ledger_index: LedgerIndex) {
		self.channel
			.hub
			.publish(ChannelEvent::LedgerClosed(LedgerClosedEvent {
				ledger_index,
				ledger_hash: None,
				ledger_time: None,
				txn_count: None,
			}));
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[tokio::test]
	async fn test_request_requires_connection() {
		let (channel, _remote) = MemoryChannel::pair(true);
		let result = channel.request("ping", Value::Null).await;
		assert_eq!(result, Err(ChannelError::NotConnected));
	}

	#[tokio::test]
	async fn test_request_roundtrip() {
		let (channel, mut remote) = MemoryChannel::pair(true);
		remote.open();

		let task = {
			let channel = channel.clone();
			tokio::spawn(async move { channel.request("ping", json!({"a": 1})).await })
		};

		let request = remote.expect_request("ping").await;
		assert_eq!(request.id, 0);
		assert_eq!(request.params, json!({"a": 1}));
		assert!(remote.respond(request.id, Ok(json!({"pong": true}))));

		assert_eq!(task.await.unwrap(), Ok(json!({"pong": true})));
	}

	#[tokio::test]
	async fn test_close_fails_pending_then_publishes() {
		let (channel, mut remote) = MemoryChannel::pair(true);
		let mut events = channel.subscribe();
		remote.open();
		assert_eq!(events.recv().await, Some(ChannelEvent::Open));

		let task = {
			let channel = channel.clone();
			tokio::spawn(async move { channel.request("ping", Value::Null).await })
		};
		let request = remote.expect_request("ping").await;

		remote.close();

		assert_eq!(task.await.unwrap(), Err(ChannelError::Disconnected));
		assert!(!remote.respond(request.id, Ok(Value::Null)));
		assert_eq!(events.recv().await, Some(ChannelEvent::Close));
	}
}
