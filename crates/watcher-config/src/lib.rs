//! Configuration module for the ledger watcher system.
//!
//! Configuration is read from a single TOML file. Before parsing, references
//! of the form `${VAR}` or `${VAR:-default}` are replaced with the value of
//! the environment variable `VAR`, so node endpoints and account lists can be
//! injected by the deployment environment.

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use watcher_types::{AccountAddress, LedgerIndex};

/// Largest `limit` rippled accepts for `account_tx`.
pub const MAX_PAGE_SIZE: u32 = 400;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
	/// Error that occurs during file I/O operations.
	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),
	/// Error that occurs when parsing TOML configuration.
	#[error("Configuration error: {0}")]
	Parse(String),
	/// Error that occurs when configuration validation fails.
	#[error("Validation error: {0}")]
	Validation(String),
}

impl From<toml::de::Error> for ConfigError {
	fn from(err: toml::de::Error) -> Self {
		ConfigError::Parse(err.message().to_string())
	}
}

/// Main configuration structure for the watcher.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
	/// Connection to the node.
	pub channel: ChannelConfig,
	/// Account payment monitor settings.
	#[serde(default)]
	pub monitor: MonitorConfig,
	/// Submit-and-track settings.
	#[serde(default)]
	pub tracker: TrackerConfig,
}

/// Configuration of the connection to the node.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChannelConfig {
	/// Websocket endpoint, `ws://` or `wss://`.
	pub uri: String,
	/// Forward failed transactions as well as successful ones.
	/// Submit-and-track needs this to observe failed payments.
	#[serde(default = "default_all_transactions")]
	pub all_transactions: bool,
	/// First reconnect delay in milliseconds.
	#[serde(default = "default_reconnect_initial_ms")]
	pub reconnect_initial_ms: u64,
	/// Upper bound for reconnect delays in milliseconds.
	#[serde(default = "default_reconnect_max_ms")]
	pub reconnect_max_ms: u64,
}

impl ChannelConfig {
	pub fn reconnect_initial(&self) -> Duration {
		Duration::from_millis(self.reconnect_initial_ms)
	}

	pub fn reconnect_max(&self) -> Duration {
		Duration::from_millis(self.reconnect_max_ms)
	}
}

/// Configuration of the account payment monitor.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitorConfig {
	/// Last ledger already reconciled; catch-up starts at the next one.
	#[serde(default)]
	pub ledger_index: LedgerIndex,
	/// Number of transactions requested per `account_tx` page.
	#[serde(default = "default_page_size")]
	pub page_size: u32,
	/// Delay before retrying a resync the node rejected as not synced.
	#[serde(default = "default_not_synced_retry_secs")]
	pub not_synced_retry_secs: u64,
	/// Number of recent ledgers whose live deliveries are remembered.
	#[serde(default = "default_recent_ledger_window")]
	pub recent_ledger_window: u32,
	/// Accounts watched by the service binary.
	#[serde(default)]
	pub accounts: Vec<AccountAddress>,
}

impl MonitorConfig {
	pub fn not_synced_retry(&self) -> Duration {
		Duration::from_secs(self.not_synced_retry_secs)
	}
}

impl Default for MonitorConfig {
	fn default() -> Self {
		Self {
			ledger_index: 0,
			page_size: default_page_size(),
			not_synced_retry_secs: default_not_synced_retry_secs(),
			recent_ledger_window: default_recent_ledger_window(),
			accounts: Vec::new(),
		}
	}
}

/// Configuration of submit-and-track.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TrackerConfig {
	/// Give up waiting for a confirmation after this many seconds.
	/// Waits indefinitely when unset.
	pub confirmation_timeout_secs: Option<u64>,
}

impl TrackerConfig {
	pub fn confirmation_timeout(&self) -> Option<Duration> {
		self.confirmation_timeout_secs.map(Duration::from_secs)
	}
}

fn default_all_transactions() -> bool {
	true
}

fn default_reconnect_initial_ms() -> u64 {
	500
}

fn default_reconnect_max_ms() -> u64 {
	30_000
}

fn default_page_size() -> u32 {
	200
}

fn default_not_synced_retry_secs() -> u64 {
	5
}

fn default_recent_ledger_window() -> u32 {
	8
}

/// Resolves environment variable references in a string.
///
/// Replaces `${VAR}` with the value of `VAR` and `${VAR:-default}` with the
/// value of `VAR` or `default` when it is unset.
pub(crate) fn resolve_env_vars(input: &str) -> Result<String, ConfigError> {
	let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}")
		.map_err(|e| ConfigError::Parse(format!("Regex error: {}", e)))?;

	let mut missing = None;
	let resolved = re.replace_all(input, |caps: &Captures| {
		let name = &caps[1];
		match (std::env::var(name), caps.get(2)) {
			(Ok(value), _) => value,
			(Err(_), Some(default)) => default.as_str().to_string(),
			(Err(_), None) => {
				missing.get_or_insert_with(|| name.to_string());
				String::new()
			},
		}
	});

	match missing {
		Some(name) => Err(ConfigError::Validation(format!(
			"Environment variable '{}' not found",
			name
		))),
		None => Ok(resolved.into_owned()),
	}
}

impl Config {
	/// Loads configuration from a file, resolving environment variables.
	pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
		let content = tokio::fs::read_to_string(path.as_ref()).await?;
		content.parse()
	}

	/// Validates the configuration.
	fn validate(&self) -> Result<(), ConfigError> {
		let channel = &self.channel;
		if !(channel.uri.starts_with("ws://") || channel.uri.starts_with("wss://")) {
			return Err(ConfigError::Validation(format!(
				"Channel uri must start with ws:// or wss://, got '{}'",
				channel.uri
			)));
		}
		if channel.reconnect_initial_ms == 0 {
			return Err(ConfigError::Validation(
				"Channel reconnect_initial_ms must be greater than 0".into(),
			));
		}
		if channel.reconnect_max_ms < channel.reconnect_initial_ms {
			return Err(ConfigError::Validation(
				"Channel reconnect_max_ms cannot be lower than reconnect_initial_ms".into(),
			));
		}

		let monitor = &self.monitor;
		if monitor.page_size == 0 || monitor.page_size > MAX_PAGE_SIZE {
			return Err(ConfigError::Validation(format!(
				"Monitor page_size must be between 1 and {}",
				MAX_PAGE_SIZE
			)));
		}
		if monitor.not_synced_retry_secs == 0 {
			return Err(ConfigError::Validation(
				"Monitor not_synced_retry_secs must be greater than 0".into(),
			));
		}
		if monitor.recent_ledger_window == 0 {
			return Err(ConfigError::Validation(
				"Monitor recent_ledger_window must be greater than 0".into(),
			));
		}
		let mut seen = HashSet::new();
		for account in &monitor.accounts {
			if !account.as_str().starts_with('r') || account.as_str().len() < 25 {
				return Err(ConfigError::Validation(format!(
					"Invalid account address '{}'",
					account
				)));
			}
			if !seen.insert(account) {
				return Err(ConfigError::Validation(format!(
					"Account '{}' is listed more than once",
					account
				)));
			}
		}

		if self.tracker.confirmation_timeout_secs == Some(0) {
			return Err(ConfigError::Validation(
				"Tracker confirmation_timeout_secs must be greater than 0".into(),
			));
		}

		Ok(())
	}
}

/// Parses configuration from a TOML string.
///
/// Environment variables are resolved first and the result is validated.
impl FromStr for Config {
	type Err = ConfigError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let resolved = resolve_env_vars(s)?;
		let config: Config = toml::from_str(&resolved)?;
		config.validate()?;
		Ok(config)
	}
}
