//! Request channel module for the ledger watcher system.
//!
//! This module defines the contract the watcher core consumes from a rippled
//! connection: asynchronous request/response correlation plus a feed of
//! connection-lifecycle and push events. Consumers register for events through
//! an explicit [`ChannelSubscription`] handle and are deregistered when the
//! handle is dropped.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use watcher_types::{LedgerClosedEvent, TransactionEvent};

pub mod hub;
pub mod protocol;

pub use hub::{ChannelSubscription, EventHub};

/// Re-export implementations
pub mod implementations {
	pub mod ws;

	#[cfg(any(test, feature = "testing"))]
	pub mod memory;
}

/// Errors that can occur while issuing a request over the channel.
///
/// Remote error responses are classified here so that callers match on kinds
/// instead of message text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
	/// The connection dropped while the request was pending.
	#[error("Disconnected during request")]
	Disconnected,
	/// The request was issued while no connection was established.
	#[error("Not connected")]
	NotConnected,
	/// The node is not yet synced to the network.
	#[error("Not synced to network: {0}")]
	NotSynced(String),
	/// The node answered with an error response.
	#[error("Remote error {code}: {message}")]
	Remote { code: String, message: String },
	/// Error that occurs while writing to or reading from the transport.
	#[error("Transport error: {0}")]
	Transport(String),
	/// A frame did not have the expected shape.
	#[error("Protocol error: {0}")]
	Protocol(String),
}

impl ChannelError {
	/// Returns true when the request failed because there was no live connection.
	pub fn is_disconnect(&self) -> bool {
		matches!(self, ChannelError::Disconnected | ChannelError::NotConnected)
	}

	pub fn is_not_synced(&self) -> bool {
		matches!(self, ChannelError::NotSynced(_))
	}
}

/// Events delivered to channel subscribers, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
	/// A connection was established.
	Open,
	/// The connection was lost. Pending requests have already been resolved.
	Close,
	/// A transaction from the `transactions` or `accounts` streams.
	Transaction(Box<TransactionEvent>),
	/// A ledger closed on the `ledger` stream.
	LedgerClosed(LedgerClosedEvent),
}

/// Trait defining the interface for request channels.
///
/// Implementations own request-id allocation, the pending-request map,
/// reconnection and wire framing. Users only ever call [`RpcChannel::request`]
/// and read events from their own subscription.
#[async_trait]
pub trait RpcChannel: Send + Sync {
	/// Issues a command and waits for its single reply.
	///
	/// `params` must be a JSON object (or null); its fields are merged into the
	/// request frame next to `id` and `command`.
	async fn request(&self, command: &str, params: Value) -> Result<Value, ChannelError>;

	/// Registers a new event subscriber.
	fn subscribe(&self) -> ChannelSubscription;

	/// Returns true while a connection is established.
	fn is_connected(&self) -> bool;

	/// Returns true when failed transactions are forwarded as well as
	/// successful ones.
	fn forwards_all_transactions(&self) -> bool;
}
