//! Main entry point for the ledger watcher service.
//!
//! The `watch` command monitors the configured accounts for incoming payments
//! and logs each one. The `submit` command submits a signed transaction and
//! waits until the network validates it.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use watcher_channel::implementations::ws::WsChannel;
use watcher_config::Config;

mod commands;

/// Command-line arguments for the watcher service.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
	/// Path to configuration file
	#[arg(short, long, default_value = "config.toml", env = "WATCHER_CONFIG")]
	config: PathBuf,

	/// Log level (trace, debug, info, warn, error)
	#[arg(short, long, default_value = "info")]
	log_level: String,

	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Command {
	/// Watch accounts for incoming payments until interrupted
	Watch {
		/// Account to watch instead of the configured ones (repeatable)
		#[arg(long = "account")]
		accounts: Vec<String>,
	},
	/// Submit a signed transaction and wait for its validated result
	Submit {
		/// Hex-encoded signed transaction
		#[arg(long)]
		tx_blob: String,
	},
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
	let args = Args::parse();

	use tracing_subscriber::{fmt, EnvFilter};

	let env_filter =
		EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

	fmt()
		.with_env_filter(env_filter)
		.with_thread_ids(true)
		.with_target(true)
		.init();

	let config = Config::from_file(&args.config).await?;
	tracing::info!(uri = %config.channel.uri, "Loaded configuration");

	let channel = Arc::new(WsChannel::connect(commands::channel_config(&config.channel)));

	match args.command {
		Command::Watch { accounts } => {
			let accounts = commands::watched_accounts(&config.monitor, accounts)?;
			commands::watch(channel.clone(), &config.monitor, accounts).await?;
		},
		Command::Submit { tx_blob } => {
			let hash = commands::submit(channel.clone(), &config.tracker, tx_blob).await?;
			println!("{}", hash);
		},
	}

	channel.shutdown();
	tracing::info!("Stopped watcher");
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_parse_watch() {
		let args = Args::try_parse_from([
			"watcher",
			"--config",
			"watcher.toml",
			"watch",
			"--account",
			"rA",
			"--account",
			"rB",
		])
		.unwrap();

		assert_eq!(args.config, PathBuf::from("watcher.toml"));
		assert_eq!(args.log_level, "info");
		assert_eq!(
			args.command,
			Command::Watch {
				accounts: vec!["rA".to_string(), "rB".to_string()]
			}
		);
	}

	#[test]
	fn test_parse_submit() {
		let args =
			Args::try_parse_from(["watcher", "-l", "debug", "submit", "--tx-blob", "1200"]).unwrap();

		assert_eq!(args.log_level, "debug");
		assert_eq!(
			args.command,
			Command::Submit {
				tx_blob: "1200".to_string()
			}
		);
	}

	#[test]
	fn test_subcommand_required() {
		assert!(Args::try_parse_from(["watcher"]).is_err());
		assert!(Args::try_parse_from(["watcher", "submit"]).is_err());
	}
}
