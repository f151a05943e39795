use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use tracing::{info, warn};

use charon_core::client::{Client, ClientConfig};
use charon_core::messaging::tcp::TcpFabric;
use charon_core::notifications::{PendingChange, StateChange};
use charon_core::shutdown::{utils::user_signal, Controller};
use charon_core::types::{Account, Identity};
use charon_core::utils::{default_subscriber, install_panic_hooks, json_subscriber, spawn_in_span};

mod api;
mod cli;
mod config;
mod methods;

use cli::CliOpts;
use config::RuntimeConfig;

async fn run(cfg: RuntimeConfig, shutdown: Controller<String>) -> Result<()> {
	let version = clap::crate_version!();
	info!(version, "running {}", clap::crate_name!());

	let server_id: Identity = cfg
		.server_id
		.parse()
		.map_err(|_| eyre!("--server-id must be a valid identity"))?;
	let client_id: Identity = cfg
		.client_id
		.parse()
		.map_err(|_| eyre!("--client-id must be a valid identity"))?;
	if cfg.port == 0 {
		return Err(eyre!("--port must be set"));
	}

	let mut client_config = ClientConfig::new(server_id, cfg.backend_version.clone());
	client_config.timeout = cfg.timeout;
	let client = Client::new(
		Arc::new(TcpFabric::new(cfg.broker_addr.clone())),
		Account::new(client_id, cfg.password.clone()),
		client_config,
	);
	if !cfg.ca_file.is_empty() {
		client.adapter().set_root_ca(PathBuf::from(&cfg.ca_file));
	}

	let mut waits = BTreeMap::new();
	if cfg.waitforchange {
		info!("enabling waitforchange updates");
		client.register_notification(Arc::new(StateChange));
		waits.insert("waitforchange".to_string(), "state".to_string());
	}
	if cfg.waitforpendingchange {
		info!("enabling waitforpendingchange updates");
		client.register_notification(Arc::new(PendingChange));
		waits.insert("waitforpendingchange".to_string(), "pending".to_string());
	}

	let forwarded = methods::selected_methods(&cfg)?;
	if forwarded.is_empty() && waits.is_empty() {
		warn!("neither forwarded methods nor notifications are enabled");
	}
	for method in &forwarded {
		info!(method, "forwarding method");
	}

	if !client.connect().await? {
		return Err(eyre!("failed to connect to the messaging fabric"));
	}

	if cfg.detect_server {
		let resource = client.server_resource().await;
		if resource.is_empty() {
			warn!("could not detect a server, will keep trying on demand");
		} else {
			info!(resource, "detected server");
		}
	}

	let state = api::ApiState {
		client: client.clone(),
		forwarded: Arc::new(forwarded),
		waits: Arc::new(waits),
		shutdown: shutdown.clone(),
	};
	let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, cfg.port));
	let stop = shutdown.clone();
	let (bound, serving) =
		warp::serve(api::route(state)).bind_with_graceful_shutdown(addr, async move {
			stop.triggered_shutdown().await;
		});
	info!(%bound, "local JSON-RPC endpoint is up");

	{
		let shutdown = shutdown.clone();
		spawn_in_span(async move {
			user_signal().await;
			let _ = shutdown.trigger_shutdown("user signal received".to_string());
		});
	}

	serving.await;
	info!("shutting down");
	client.disconnect().await;
	Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
	let opts = CliOpts::parse();
	let cfg = RuntimeConfig::load(&opts)?;

	let level = opts.verbosity.map(Into::into).unwrap_or(tracing::Level::INFO);
	if opts.logs_json {
		tracing::subscriber::set_global_default(json_subscriber(level))?;
	} else {
		tracing::subscriber::set_global_default(default_subscriber(level))?;
	}

	let shutdown = Controller::<String>::new();
	install_panic_hooks(shutdown.clone())?;

	run(cfg, shutdown).await
}
