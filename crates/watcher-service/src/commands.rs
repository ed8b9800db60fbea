//! Implementations of the `watch` and `submit` commands.

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use watcher_channel::implementations::ws::{WsChannel, WsChannelConfig};
use watcher_config::{ChannelConfig, MonitorConfig, TrackerConfig};
use watcher_core::{
	AccountMonitor, MonitorError, MonitorEvent, SignedTransaction, SubmitTracker, TrackError,
};
use watcher_types::{truncate_id, AccountAddress, TransactionHash};

#[derive(Debug, Error)]
pub enum CommandError {
	#[error("No accounts to watch; set monitor.accounts or pass --account")]
	NoAccounts,
	#[error(transparent)]
	Monitor(#[from] MonitorError),
	#[error(transparent)]
	Track(#[from] TrackError),
}

pub fn channel_config(config: &ChannelConfig) -> WsChannelConfig {
	WsChannelConfig {
		uri: config.uri.clone(),
		all_transactions: config.all_transactions,
		reconnect_initial: config.reconnect_initial(),
		reconnect_max: config.reconnect_max(),
	}
}

/// Accounts given on the command line take precedence over the configured ones.
pub fn watched_accounts(
	config: &MonitorConfig,
	overrides: Vec<String>,
) -> Result<Vec<AccountAddress>, CommandError> {
	let accounts: Vec<AccountAddress> = if overrides.is_empty() {
		config.accounts.clone()
	} else {
		overrides.into_iter().map(AccountAddress::from).collect()
	};
	if accounts.is_empty() {
		return Err(CommandError::NoAccounts);
	}
	Ok(accounts)
}

/// Runs the monitor until interrupted, logging every incoming payment.
pub async fn watch(
	channel: Arc<WsChannel>,
	config: &MonitorConfig,
	accounts: Vec<AccountAddress>,
) -> Result<(), CommandError> {
	let monitor = AccountMonitor::spawn(channel, config);
	let mut events = monitor.subscribe();

	for account in accounts {
		let label = account.clone();
		monitor.watch(account, move |tx, meta| {
			tracing::info!(
				account = %label,
				from = %tx.account,
				tx_hash = %truncate_id(tx.hash.as_str()),
				delivered = ?meta.fields.get("delivered_amount"),
				"Incoming payment"
			);
		})?;
	}

	let shutdown = tokio::signal::ctrl_c();
	tokio::pin!(shutdown);

	loop {
		tokio::select! {
			event = events.recv() => match event {
				Ok(MonitorEvent::LedgerClosed(ledger_index)) => {
					tracing::debug!(ledger_index, "Ledger closed");
				},
				Ok(MonitorEvent::Error(e)) => {
					tracing::error!(error = %e, "Monitor error");
				},
				Err(RecvError::Lagged(skipped)) => {
					tracing::warn!(skipped, "Monitor events dropped");
				},
				Err(RecvError::Closed) => break,
			},
			result = &mut shutdown => {
				if let Err(e) = result {
					tracing::error!(error = %e, "Failed to listen for shutdown signal");
				}
				tracing::info!("Shutting down");
				break;
			},
		}
	}

	monitor.shutdown().await;
	Ok(())
}

/// Submits `tx_blob` and waits for the validated outcome.
pub async fn submit(
	channel: Arc<WsChannel>,
	config: &TrackerConfig,
	tx_blob: String,
) -> Result<TransactionHash, CommandError> {
	let tracker = SubmitTracker::new(channel)?;
	let tx = SignedTransaction::new(tx_blob);

	let hash = match config.confirmation_timeout() {
		Some(timeout) => tracker.submit_and_track_with_timeout(tx, timeout).await?,
		None => tracker.submit_and_track(tx).await?,
	};
	Ok(hash)
}
