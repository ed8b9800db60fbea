//! Websocket channel to a rippled node.
//!
//! A background driver task keeps one connection open at a time and
//! reconnects with exponential backoff whenever it drops. Request ids restart
//! at zero on every connection; when a connection ends, every pending request
//! is resolved with [`ChannelError::Disconnected`] before `Close` is published.

use crate::protocol::{self, Incoming};
use crate::{ChannelError, ChannelEvent, ChannelSubscription, EventHub, RpcChannel};
use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use watcher_types::truncate_id;

type PendingReply = oneshot::Sender<Result<Value, ChannelError>>;

/// Connection settings for [`WsChannel`].
#[derive(Debug, Clone)]
pub struct WsChannelConfig {
	/// `ws://` or `wss://` endpoint of the node.
	pub uri: String,
	/// Forward failed transactions as well as successful ones.
	pub all_transactions: bool,
	/// First reconnect delay.
	pub reconnect_initial: Duration,
	/// Upper bound for reconnect delays.
	pub reconnect_max: Duration,
}

impl Default for WsChannelConfig {
	fn default() -> Self {
		Self {
			uri: "wss://s1.ripple.com".to_string(),
			all_transactions: false,
			reconnect_initial: Duration::from_millis(500),
			reconnect_max: Duration::from_secs(30),
		}
	}
}

/// Per-connection request state.
#[derive(Default)]
struct Connection {
	connected: bool,
	next_id: u64,
	pending: HashMap<u64, PendingReply>,
	outbound: Option<mpsc::UnboundedSender<String>>,
}

struct Shared {
	config: WsChannelConfig,
	hub: EventHub,
	connection: Mutex<Connection>,
}

impl Shared {
	fn connection(&self) -> MutexGuard<'_, Connection> {
		self.connection
			.lock()
			.unwrap_or_else(|poisoned| poisoned.into_inner())
	}

	fn dispatch(&self, text: &str) {
		match protocol::decode_frame(text, self.config.all_transactions) {
			Ok(Incoming::Response { id, reply }) => {
				let pending = self.connection().pending.remove(&id);
				match pending {
					Some(sender) => {
						let _ = sender.send(reply);
					},
					None => tracing::debug!(id, "Dropping response for unknown request"),
				}
			},
			Ok(Incoming::Event(event)) => {
				if let ChannelEvent::Transaction(tx) = &event {
					tracing::trace!(tx_hash = %truncate_id(tx.transaction.hash.as_str()), "<-- transaction");
				}
				self.hub.publish(event);
			},
			Ok(Incoming::FilteredTransaction) => {
				tracing::trace!("Skipping unsuccessful transaction");
			},
			Ok(Incoming::Unhandled(kind)) => {
				tracing::warn!(kind = %kind, "Unhandled message type");
			},
			Err(e) => {
				tracing::error!(error = %e, "Failed to decode frame");
			},
		}
	}

	/// Marks the connection as established and returns the outbound queue.
	fn attach(&self) -> mpsc::UnboundedReceiver<String> {
		let (sender, receiver) = mpsc::unbounded_channel();
		{
			let mut connection = self.connection();
			connection.connected = true;
			connection.next_id = 0;
			connection.pending.clear();
			connection.outbound = Some(sender);
		}
		self.hub.publish(ChannelEvent::Open);
		receiver
	}

	/// Tears down the connection state, failing every pending request.
	fn detach(&self) {
		let pending = {
			let mut connection = self.connection();
			connection.connected = false;
			connection.outbound = None;
			std::mem::take(&mut connection.pending)
		};
		for (_, sender) in pending {
			let _ = sender.send(Err(ChannelError::Disconnected));
		}
		self.hub.publish(ChannelEvent::Close);
	}
}

/// Channel backed by a reconnecting websocket connection.
pub struct WsChannel {
	shared: Arc<Shared>,
	shutdown: watch::Sender<bool>,
}

impl WsChannel {
	/// Starts the connection driver and returns immediately.
	///
	/// Subscribe before awaiting anything to observe the first `Open` event.
	pub fn connect(config: WsChannelConfig) -> Self {
		let shared = Arc::new(Shared {
			config,
			hub: EventHub::new(),
			connection: Mutex::new(Connection::default()),
		});
		let (shutdown, stop) = watch::channel(false);

		tokio::spawn(run_driver(shared.clone(), stop));

		Self { shared, shutdown }
	}

	/// Closes the connection and stops reconnecting.
	pub fn shutdown(&self) {
		let _ = self.shutdown.send(true);
	}
}

impl Drop for WsChannel {
	fn drop(&mut self) {
		self.shutdown();
	}
}

#[async_trait]
impl RpcChannel for WsChannel {
	async fn request(&self, command: &str, params: Value) -> Result<Value, ChannelError> {
		let reply = {
			let mut connection = self.shared.connection();
			let outbound = match (&connection.outbound, connection.connected) {
				(Some(outbound), true) => outbound.clone(),
				_ => return Err(ChannelError::NotConnected),
			};

			let id = connection.next_id;
			connection.next_id += 1;
			let frame = protocol::encode_request(id, command, params)?;
			tracing::debug!(id, command, "--> request");

			let (sender, reply) = oneshot::channel();
			connection.pending.insert(id, sender);
			if outbound.send(frame).is_err() {
				connection.pending.remove(&id);
				return Err(ChannelError::Disconnected);
			}
			reply
		};

		match reply.await {
			Ok(result) => result,
			Err(_) => Err(ChannelError::Disconnected),
		}
	}

	fn subscribe(&self) -> ChannelSubscription {
		self.shared.hub.subscribe()
	}

	fn is_connected(&self) -> bool {
		self.shared.connection().connected
	}

	fn forwards_all_transactions(&self) -> bool {
		self.shared.config.all_transactions
	}
}

async fn run_driver(shared: Arc<Shared>, mut stop: watch::Receiver<bool>) {
	let mut backoff = ExponentialBackoff {
		initial_interval: shared.config.reconnect_initial,
		max_interval: shared.config.reconnect_max,
		max_elapsed_time: None,
		..ExponentialBackoff::default()
	};

	loop {
		if *stop.borrow() {
			break;
		}

		tracing::info!(uri = %shared.config.uri, "Connecting");
		match connect_async(shared.config.uri.as_str()).await {
			Ok((stream, _response)) => {
				tracing::info!("Connected");
				backoff.reset();
				if let Err(e) = run_session(&shared, stream, &mut stop).await {
					tracing::warn!(error = %e, "Connection lost");
				}
				tracing::info!("Disconnected");
			},
			Err(e) => {
				tracing::warn!(error = %e, "Failed to connect");
			},
		}

		let delay = backoff.next_backoff().unwrap_or(shared.config.reconnect_max);
		tracing::debug!(delay_ms = delay.as_millis() as u64, "Reconnecting after delay");
		tokio::select! {
			_ = tokio::time::sleep(delay) => {}
			_ = stop.changed() => break,
		}
	}
}

async fn run_session<S>(
	shared: &Shared,
	stream: S,
	stop: &mut watch::Receiver<bool>,
) -> Result<(), ChannelError>
where
	S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
		+ futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
		+ Unpin,
{
	let (mut write, mut read) = stream.split();
	let mut outbound = shared.attach();

	let result = loop {
		tokio::select! {
			Some(frame) = outbound.recv() => {
				if let Err(e) = write.send(Message::Text(frame)).await {
					break Err(ChannelError::Transport(e.to_string()));
				}
			}
			message = read.next() => match message {
				Some(Ok(Message::Text(text))) => shared.dispatch(&text),
				Some(Ok(Message::Close(frame))) => {
					tracing::debug!(frame = ?frame, "Received close frame");
					break Ok(());
				}
				Some(Ok(_)) => {}
				Some(Err(e)) => break Err(ChannelError::Transport(e.to_string())),
				None => break Ok(()),
			},
			_ = stop.changed() => {
				let _ = write.send(Message::Close(None)).await;
				break Ok(());
			}
		}
	};

	shared.detach();
	result
}
