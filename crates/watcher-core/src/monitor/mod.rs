//! Incoming payment monitor for a set of watched accounts.
//!
//! The monitor keeps a ledger cursor and, on every (re)connection, resyncs in
//! three ordered steps: re-subscribe the watched accounts, catch up on their
//! history from the ledger after the cursor, then subscribe to ledger closes.
//! While a resync runs, live transactions and catch-up entries race each other
//! and a processed-hash cache keeps each payment from being delivered twice.
//! Once live, every closed ledger triggers a catch-up scan from that ledger as
//! a safety net, and the cursor advances once those scans have succeeded.
//!
//! All state lives in one worker task. Requests run in spawned tasks whose
//! results come back as messages tagged with the resync generation they were
//! issued for, so results of abandoned resyncs are dropped.

mod state;
mod worker;


pub use state::{LedgerCursor, PendingLedgers, ProcessedHashCache, RecentDeliveries};

use crate::scanner::{CatchUpScanner, ScanError};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use watcher_channel::{ChannelError, RpcChannel};
use watcher_config::MonitorConfig;
use watcher_types::{AccountAddress, LedgerIndex, Transaction, TransactionMeta};
use worker::{Command, Worker};

/// Capacity of the monitor event broadcast.
const EVENT_CAPACITY: usize = 256;

/// Callback receiving each incoming payment of a watched account.
pub type PaymentCallback = Box<dyn Fn(&Transaction, &TransactionMeta) + Send + Sync>;

/// Connection-level state of the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveState {
	Disconnected,
	/// Re-subscribing and catching up after a connection was established.
	Resyncing,
	/// Caught up; payments arrive from the live stream.
	Live,
}

/// A failed resync step.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResyncError {
	#[error("Failed to subscribe to account {account}: {source}")]
	Subscribe {
		account: AccountAddress,
		#[source]
		source: ChannelError,
	},
	#[error("Catch-up failed for account {account}: {source}")]
	CatchUp {
		account: AccountAddress,
		#[source]
		source: ScanError,
	},
	#[error("Failed to subscribe to ledger stream: {0}")]
	LedgerSubscribe(#[source] ChannelError),
}

impl ResyncError {
	/// Whether the node refused the step because it is not synced yet.
	pub fn is_not_synced(&self) -> bool {
		match self {
			ResyncError::Subscribe { source, .. } => source.is_not_synced(),
			ResyncError::CatchUp { source, .. } => source.is_not_synced(),
			ResyncError::LedgerSubscribe(source) => source.is_not_synced(),
		}
	}
}

/// Errors reported by the monitor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MonitorError {
	#[error("Initialization failed: {0}")]
	Initialization(#[source] ResyncError),
	#[error("Monitor has stopped")]
	Stopped,
}

/// Events broadcast to [`AccountMonitor::subscribe`] receivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
	/// The cursor advanced to this ledger.
	LedgerClosed(LedgerIndex),
	/// A resync failed for a reason other than the node not being synced.
	Error(MonitorError),
}

/// Handle to a running monitor.
///
/// Dropping the handle stops the worker.
pub struct AccountMonitor {
	commands: mpsc::UnboundedSender<Command>,
	events: broadcast::Sender<MonitorEvent>,
	worker: JoinHandle<()>,
}

impl AccountMonitor {
	/// Starts a monitor on `channel`. If the channel is already connected a
	/// resync starts right away, otherwise on the next `Open`.
	pub fn spawn(channel: Arc<dyn RpcChannel>, config: &MonitorConfig) -> Self {
		let (commands, command_rx) = mpsc::unbounded_channel();
		let (events, _) = broadcast::channel(EVENT_CAPACITY);

		let subscription = channel.subscribe();
		let scanner = CatchUpScanner::new(channel.clone(), config.page_size);
		let worker = Worker::new(channel, scanner, config, events.clone());
		let worker = tokio::spawn(worker.run(subscription, command_rx));

		Self {
			commands,
			events,
			worker,
		}
	}

	/// Starts delivering incoming payments of `account` to `on_payment`.
	///
	/// Callbacks of one account run in registration order. Watching an
	/// account while connected subscribes it immediately; either way it is
	/// included in every later resync.
	pub fn watch<F>(&self, account: impl Into<AccountAddress>, on_payment: F) -> Result<(), MonitorError>
	where
		F: Fn(&Transaction, &TransactionMeta) + Send + Sync + 'static,
	{
		self.commands
			.send(Command::Watch {
				account: account.into(),
				callback: Box::new(on_payment),
			})
			.map_err(|_| MonitorError::Stopped)
	}

	pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
		self.events.subscribe()
	}

	pub async fn ledger_cursor(&self) -> Result<LedgerIndex, MonitorError> {
		let (reply, response) = oneshot::channel();
		self.commands
			.send(Command::Cursor(reply))
			.map_err(|_| MonitorError::Stopped)?;
		response.await.map_err(|_| MonitorError::Stopped)
	}

	pub async fn state(&self) -> Result<LiveState, MonitorError> {
		let (reply, response) = oneshot::channel();
		self.commands
			.send(Command::State(reply))
			.map_err(|_| MonitorError::Stopped)?;
		response.await.map_err(|_| MonitorError::Stopped)
	}

	/// Stops the worker and waits for it to exit.
	pub async fn shutdown(self) {
		let _ = self.commands.send(Command::Shutdown);
		if let Err(e) = self.worker.await {
			tracing::error!(error = %e, "Monitor worker failed");
		}
	}
}
