use super::state::{LedgerCursor, PendingLedgers, ProcessedHashCache, RecentDeliveries};
use super::{LiveState, MonitorError, MonitorEvent, PaymentCallback, ResyncError};
use crate::scanner::CatchUpScanner;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::Instrument;
use watcher_channel::{ChannelEvent, ChannelSubscription, RpcChannel};
use watcher_config::MonitorConfig;
use watcher_types::{
	truncate_id, AccountAddress, AccountTxEntry, LedgerIndex, Transaction, TransactionEvent,
	TransactionMeta,
};

pub(super) enum Command {
	Watch {
		account: AccountAddress,
		callback: PaymentCallback,
	},
	Cursor(oneshot::Sender<LedgerIndex>),
	State(oneshot::Sender<LiveState>),
	Shutdown,
}

/// The ordered steps of a resync. Each one reads the watched accounts when
/// it starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResyncStep {
	SubscribeAccounts,
	CatchUp,
	SubscribeLedger,
}

impl ResyncStep {
	fn next(self) -> Option<ResyncStep> {
		match self {
			ResyncStep::SubscribeAccounts => Some(ResyncStep::CatchUp),
			ResyncStep::CatchUp => Some(ResyncStep::SubscribeLedger),
			ResyncStep::SubscribeLedger => None,
		}
	}
}

/// Results of spawned request tasks.
enum Progress {
	CatchUp {
		generation: u64,
		entry: AccountTxEntry,
	},
	StepFinished {
		generation: u64,
		step: ResyncStep,
		result: Result<(), ResyncError>,
	},
	RetryResync {
		generation: u64,
	},
	SafetyNet {
		generation: u64,
		ledger_index: LedgerIndex,
		entry: AccountTxEntry,
	},
	SafetyNetDone {
		generation: u64,
		ledger_index: LedgerIndex,
		succeeded: bool,
	},
}

fn account_subscription(account: &AccountAddress) -> Value {
	json!({ "accounts": [account] })
}

fn ledger_subscription() -> Value {
	json!({ "streams": ["ledger"] })
}

pub(super) struct Worker {
	channel: Arc<dyn RpcChannel>,
	scanner: CatchUpScanner,
	accounts: BTreeMap<AccountAddress, Vec<PaymentCallback>>,
	state: LiveState,
	cursor: LedgerCursor,
	/// Highest ledger close accepted while live.
	closed: LedgerIndex,
	pending: PendingLedgers,
	/// Highest ledger close seen while resyncing, replayed once live.
	deferred_close: Option<LedgerIndex>,
	generation: u64,
	processed: Option<ProcessedHashCache>,
	recent: RecentDeliveries,
	retry_delay: Duration,
	resync: Option<JoinHandle<()>>,
	events: broadcast::Sender<MonitorEvent>,
	progress_tx: mpsc::UnboundedSender<Progress>,
	progress_rx: mpsc::UnboundedReceiver<Progress>,
}

impl Worker {
	pub(super) fn new(
		channel: Arc<dyn RpcChannel>,
		scanner: CatchUpScanner,
		config: &MonitorConfig,
		events: broadcast::Sender<MonitorEvent>,
	) -> Self {
		let (progress_tx, progress_rx) = mpsc::unbounded_channel();
		Self {
			channel,
			scanner,
			accounts: BTreeMap::new(),
			state: LiveState::Disconnected,
			cursor: LedgerCursor::new(config.ledger_index),
			closed: config.ledger_index,
			pending: PendingLedgers::new(),
			deferred_close: None,
			generation: 0,
			processed: None,
			recent: RecentDeliveries::new(config.recent_ledger_window),
			retry_delay: config.not_synced_retry(),
			resync: None,
			events,
			progress_tx,
			progress_rx,
		}
	}

	pub(super) async fn run(
		mut self,
		mut subscription: ChannelSubscription,
		mut commands: mpsc::UnboundedReceiver<Command>,
	) {
		if self.channel.is_connected() {
			self.on_open();
		}

		loop {
			tokio::select! {
				biased;
				command = commands.recv() => match command {
					Some(Command::Shutdown) | None => break,
					Some(command) => self.handle_command(command),
				},
				event = subscription.recv() => match event {
					Some(event) => self.handle_event(event),
					None => {
						tracing::warn!("Channel is gone, stopping monitor");
						break;
					},
				},
				Some(progress) = self.progress_rx.recv() => self.handle_progress(progress),
			}
		}

		self.abort_resync();
		tracing::info!("Monitor stopped");
	}

	fn handle_command(&mut self, command: Command) {
		match command {
			Command::Watch { account, callback } => self.watch(account, callback),
			Command::Cursor(reply) => {
				let _ = reply.send(self.cursor.current());
			},
			Command::State(reply) => {
				let _ = reply.send(self.state);
			},
			Command::Shutdown => {},
		}
	}

	fn watch(&mut self, account: AccountAddress, callback: PaymentCallback) {
		if let Some(callbacks) = self.accounts.get_mut(&account) {
			callbacks.push(callback);
			return;
		}

		tracing::info!(account = %account, "Watching account");
		if self.state != LiveState::Disconnected {
			let channel = self.channel.clone();
			let params = account_subscription(&account);
			tokio::spawn(async move {
				if let Err(e) = channel.request("subscribe", params).await {
					tracing::warn!(error = %e, "Failed to subscribe newly watched account");
				}
			});
		}
		self.accounts.insert(account, vec![callback]);
	}

	fn handle_event(&mut self, event: ChannelEvent) {
		match event {
			ChannelEvent::Open => self.on_open(),
			ChannelEvent::Close => self.on_close(),
			ChannelEvent::Transaction(event) => self.on_transaction(&event),
			ChannelEvent::LedgerClosed(event) => self.on_ledger_closed(event.ledger_index),
		}
	}

	fn on_open(&mut self) {
		self.abort_resync();
		self.generation += 1;
		self.state = LiveState::Resyncing;
		self.processed = Some(ProcessedHashCache::new(self.generation));
		self.recent.clear();
		self.pending.clear();
		self.deferred_close = None;
		self.start_resync();
	}

	fn on_close(&mut self) {
		if self.state == LiveState::Disconnected {
			return;
		}
		tracing::info!(cursor = self.cursor.current(), "Disconnected, waiting for reconnect");
		self.abort_resync();
		self.generation += 1;
		self.state = LiveState::Disconnected;
		self.processed = None;
		self.pending.clear();
		self.deferred_close = None;
	}

	fn abort_resync(&mut self) {
		if let Some(handle) = self.resync.take() {
			handle.abort();
		}
	}

	fn start_resync(&mut self) {
		tracing::info!(
			generation = self.generation,
			accounts = self.accounts.len(),
			from_ledger = self.cursor.next(),
			"Resyncing"
		);
		self.run_step(ResyncStep::SubscribeAccounts);
	}

	fn run_step(&mut self, step: ResyncStep) {
		let accounts: Vec<AccountAddress> = self.accounts.keys().cloned().collect();
		let generation = self.generation;
		let progress = self.progress_tx.clone();

		let handle = match step {
			ResyncStep::SubscribeAccounts => spawn_step(
				step,
				generation,
				progress,
				subscribe_accounts(self.channel.clone(), accounts),
			),
			ResyncStep::CatchUp => spawn_step(
				step,
				generation,
				progress.clone(),
				catch_up(
					self.scanner.clone(),
					accounts,
					self.cursor.next(),
					generation,
					progress,
				),
			),
			ResyncStep::SubscribeLedger => spawn_step(
				step,
				generation,
				progress,
				subscribe_ledger(self.channel.clone()),
			),
		};
		self.resync = Some(handle);
	}

	fn handle_progress(&mut self, progress: Progress) {
		match progress {
			Progress::CatchUp { generation, entry } => {
				if generation != self.generation || self.state != LiveState::Resyncing {
					tracing::trace!(generation, "Dropping stale catch-up entry");
					return;
				}
				self.process(&entry.tx, &entry.meta, entry.tx.ledger_index);
			},
			Progress::StepFinished {
				generation,
				step,
				result,
			} => {
				if generation != self.generation || self.state != LiveState::Resyncing {
					tracing::debug!(generation, ?step, "Ignoring result of abandoned resync");
					return;
				}
				self.resync = None;
				match (result, step.next()) {
					(Ok(()), Some(next)) => self.run_step(next),
					(result, _) => self.finish_resync(result),
				}
			},
			Progress::RetryResync { generation } => {
				if generation != self.generation || self.state != LiveState::Resyncing {
					tracing::debug!(generation, "Ignoring retry of abandoned resync");
					return;
				}
				self.generation += 1;
				if let Some(processed) = self.processed.as_mut() {
					processed.carry_over(self.generation);
				}
				self.start_resync();
			},
			Progress::SafetyNet {
				generation,
				ledger_index,
				entry,
			} => {
				if generation != self.generation || self.state != LiveState::Live {
					return;
				}
				let ledger = entry.tx.ledger_index.unwrap_or(ledger_index);
				self.process(&entry.tx, &entry.meta, Some(ledger));
			},
			Progress::SafetyNetDone {
				generation,
				ledger_index,
				succeeded,
			} => {
				if generation != self.generation || self.state != LiveState::Live {
					return;
				}
				if let Some(reconciled) = self.pending.finish(ledger_index, succeeded) {
					self.reconcile(reconciled);
				}
			},
		}
	}

	fn finish_resync(&mut self, result: Result<(), ResyncError>) {
		match result {
			Ok(()) => {
				let processed = self.processed.take().map_or(0, |cache| cache.len());
				self.state = LiveState::Live;
				self.recent.clear();
				self.pending.clear();
				self.closed = self.cursor.current();
				tracing::info!(
					cursor = self.cursor.current(),
					processed,
					"Caught up, monitor is live"
				);
				if let Some(ledger_index) = self.deferred_close.take() {
					self.on_ledger_closed(ledger_index);
				}
			},
			Err(e) if e.is_not_synced() => {
				tracing::warn!(
					error = %e,
					retry_secs = self.retry_delay.as_secs(),
					"Node is not synced, retrying resync"
				);
				let generation = self.generation;
				let delay = self.retry_delay;
				let progress = self.progress_tx.clone();
				tokio::spawn(async move {
					tokio::time::sleep(delay).await;
					let _ = progress.send(Progress::RetryResync { generation });
				});
			},
			Err(e) => {
				tracing::error!(error = %e, "Resync failed");
				let _ = self
					.events
					.send(MonitorEvent::Error(MonitorError::Initialization(e)));
			},
		}
	}

	fn on_transaction(&mut self, event: &TransactionEvent) {
		if self.state == LiveState::Disconnected {
			return;
		}
		if !event.is_closed() || !event.validated {
			tracing::error!(
				tx_hash = %truncate_id(event.transaction.hash.as_str()),
				status = %event.status,
				validated = event.validated,
				"Dropping transaction that is not closed and validated"
			);
			return;
		}
		if !event.meta.result.is_success() {
			tracing::trace!(
				tx_hash = %truncate_id(event.transaction.hash.as_str()),
				result = %event.meta.result,
				"Skipping unsuccessful transaction"
			);
			return;
		}
		self.process(&event.transaction, &event.meta, event.ledger());
	}

	/// Delivers a payment to the callbacks of its destination unless it was
	/// already delivered in the current phase.
	fn process(&mut self, tx: &Transaction, meta: &TransactionMeta, ledger_index: Option<LedgerIndex>) {
		if !tx.is_payment() {
			tracing::trace!(tx_type = %tx.transaction_type, "Ignoring non-payment transaction");
			return;
		}
		let Some(destination) = tx.destination.as_ref() else {
			return;
		};
		let Some(callbacks) = self.accounts.get(destination) else {
			return;
		};

		match self.state {
			LiveState::Resyncing => {
				if let Some(processed) = self.processed.as_mut() {
					if !processed.insert(tx.hash.clone()) {
						tracing::debug!(
							tx_hash = %truncate_id(tx.hash.as_str()),
							generation = processed.generation(),
							"Already delivered during resync"
						);
						return;
					}
				}
			},
			LiveState::Live => {
				if self.recent.contains(&tx.hash) {
					tracing::debug!(tx_hash = %truncate_id(tx.hash.as_str()), "Already delivered");
					return;
				}
				self.recent
					.record(tx.hash.clone(), ledger_index.unwrap_or(self.closed));
			},
			LiveState::Disconnected => return,
		}

		tracing::debug!(
			tx_hash = %truncate_id(tx.hash.as_str()),
			destination = %destination,
			"Delivering payment"
		);
		for callback in callbacks {
			callback(tx, meta);
		}
	}

	fn on_ledger_closed(&mut self, ledger_index: LedgerIndex) {
		match self.state {
			LiveState::Live => {},
			LiveState::Resyncing => {
				tracing::debug!(ledger_index, "Deferring ledger close until live");
				self.deferred_close = self.deferred_close.max(Some(ledger_index));
				return;
			},
			LiveState::Disconnected => return,
		}
		if ledger_index <= self.closed {
			tracing::warn!(
				ledger_index,
				latest = self.closed,
				"Ignoring ledger close that does not advance"
			);
			return;
		}

		tracing::debug!(ledger_index, "Ledger closed");
		self.closed = ledger_index;
		let _ = self.events.send(MonitorEvent::LedgerClosed(ledger_index));

		if self.accounts.is_empty() {
			self.reconcile(ledger_index);
			return;
		}

		let from = self.pending.track(ledger_index, self.accounts.len());
		for account in self.accounts.keys() {
			tokio::spawn(safety_net(
				self.scanner.clone(),
				account.clone(),
				from,
				ledger_index,
				self.generation,
				self.progress_tx.clone(),
			));
		}
	}

	/// Raises the cursor to `ledger_index`, whose payments are all delivered.
	fn reconcile(&mut self, ledger_index: LedgerIndex) {
		if self.cursor.advance(ledger_index) {
			tracing::debug!(cursor = ledger_index, "Ledger reconciled");
			self.recent.prune(ledger_index);
		}
	}
}

fn spawn_step<F>(
	step: ResyncStep,
	generation: u64,
	progress: mpsc::UnboundedSender<Progress>,
	work: F,
) -> JoinHandle<()>
where
	F: Future<Output = Result<(), ResyncError>> + Send + 'static,
{
	let span = tracing::debug_span!("resync", generation = generation, step = ?step);
	tokio::spawn(
		async move {
			let result = work.await;
			let _ = progress.send(Progress::StepFinished {
				generation,
				step,
				result,
			});
		}
		.instrument(span),
	)
}

async fn subscribe_accounts(
	channel: Arc<dyn RpcChannel>,
	accounts: Vec<AccountAddress>,
) -> Result<(), ResyncError> {
	tracing::debug!(accounts = accounts.len(), "Attaching account subscriptions");
	for account in accounts {
		if let Err(source) = channel.request("subscribe", account_subscription(&account)).await {
			return Err(ResyncError::Subscribe { account, source });
		}
	}
	Ok(())
}

async fn catch_up(
	scanner: CatchUpScanner,
	accounts: Vec<AccountAddress>,
	from: LedgerIndex,
	generation: u64,
	progress: mpsc::UnboundedSender<Progress>,
) -> Result<(), ResyncError> {
	tracing::debug!(from_ledger = from, "Catching up");
	for account in &accounts {
		let mut entries = pin!(scanner.scan(account.clone(), from));
		while let Some(entry) = entries.next().await {
			let entry = entry.map_err(|source| ResyncError::CatchUp {
				account: account.clone(),
				source,
			})?;
			if progress.send(Progress::CatchUp { generation, entry }).is_err() {
				return Ok(());
			}
		}
	}
	Ok(())
}

async fn subscribe_ledger(channel: Arc<dyn RpcChannel>) -> Result<(), ResyncError> {
	tracing::debug!("Subscribing to ledger closes");
	channel
		.request("subscribe", ledger_subscription())
		.await
		.map_err(ResyncError::LedgerSubscribe)?;
	Ok(())
}

/// Scans `account` from `from` for the close of `ledger_index` and reports
/// whether the scan got through.
#[tracing::instrument(skip_all, fields(account = %account, ledger_index = ledger_index, from_ledger = from))]
async fn safety_net(
	scanner: CatchUpScanner,
	account: AccountAddress,
	from: LedgerIndex,
	ledger_index: LedgerIndex,
	generation: u64,
	progress: mpsc::UnboundedSender<Progress>,
) {
	let mut succeeded = true;
	let mut entries = pin!(scanner.scan(account.clone(), from));
	while let Some(entry) = entries.next().await {
		match entry {
			Ok(entry) => {
				let message = Progress::SafetyNet {
					generation,
					ledger_index,
					entry,
				};
				if progress.send(message).is_err() {
					return;
				}
			},
			Err(e) => {
				tracing::error!(error = %e, "Safety-net catch-up failed");
				succeeded = false;
				break;
			},
		}
	}
	let _ = progress.send(Progress::SafetyNetDone {
		generation,
		ledger_index,
		succeeded,
	});
}
