use std::collections::BTreeMap;
use std::fs;

use clap::Parser;
use color_eyre::{eyre::WrapErr, Result};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use charon_core::messaging::{memory::MemoryBroker, tcp};
use charon_core::shutdown::{utils::user_signal, Controller};
use charon_core::utils::{default_subscriber, install_panic_hooks, json_subscriber, spawn_in_span};

mod cli;

use cli::CliOpts;

#[tokio::main]
async fn main() -> Result<()> {
	let opts = CliOpts::parse();

	let level = opts.verbosity.into();
	if opts.logs_json {
		tracing::subscriber::set_global_default(json_subscriber(level))?;
	} else {
		tracing::subscriber::set_global_default(default_subscriber(level))?;
	}

	let shutdown = Controller::<String>::new();
	install_panic_hooks(shutdown.clone())?;

	let broker = MemoryBroker::new();
	if let Some(path) = &opts.accounts {
		let raw = fs::read_to_string(path).wrap_err("failed to read the accounts file")?;
		let accounts: BTreeMap<String, String> =
			serde_json::from_str(&raw).wrap_err("invalid accounts file")?;
		info!(count = accounts.len(), "loaded accounts");
		for (user, password) in &accounts {
			broker.add_account(user, password);
		}
	} else if !opts.open_registration {
		warn!("no accounts file and no open registration, nobody can connect");
	}

	let listener = TcpListener::bind(&opts.listen)
		.await
		.wrap_err("failed to bind the listen address")?;

	{
		let shutdown = shutdown.clone();
		spawn_in_span(async move {
			user_signal().await;
			let _ = shutdown.trigger_shutdown("user signal received".to_string());
		});
	}

	if let Err(error) = tcp::serve(listener, broker, opts.open_registration, shutdown).await {
		error!("broker failed: {error:#}");
		return Err(error);
	}
	Ok(())
}
