use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use tracing::{info, warn};

use charon_core::backend::ForwardingBackend;
use charon_core::maintenance::{self, ReconnectConfig};
use charon_core::messaging::tcp::TcpFabric;
use charon_core::notifications::{NotificationType, PendingChange, StateChange};
use charon_core::server::{Server, ServerConfig};
use charon_core::shutdown::{utils::user_signal, Controller};
use charon_core::types::{Account, Identity};
use charon_core::utils::{default_subscriber, install_panic_hooks, json_subscriber, spawn_in_span};
use charon_core::waiter::{RpcUpdateWaiter, WaiterTask};

mod cli;
mod config;
mod methods;

use cli::CliOpts;
use config::RuntimeConfig;

/// Builds the waiter task long-polling the given backend method for one
/// notification type.
fn new_waiter(ty: Arc<dyn NotificationType>, url: &str, method: &str) -> WaiterTask {
	let waiter = RpcUpdateWaiter::new(url, method, ty.always_block_id());
	WaiterTask::new(ty, Box::new(waiter))
}

async fn run(cfg: RuntimeConfig, shutdown: Controller<String>) -> Result<()> {
	let version = clap::crate_version!();
	info!(version, "running {}", clap::crate_name!());

	if cfg.backend_rpc_url.is_empty() {
		return Err(eyre!("--backend-rpc-url must be set"));
	}
	let server_id: Identity = cfg
		.server_id
		.parse()
		.map_err(|_| eyre!("--server-id must be a valid identity"))?;

	let mut backend = ForwardingBackend::new(cfg.backend_rpc_url.clone());
	info!(url = cfg.backend_rpc_url, "forwarding calls to the backend");
	info!(version = cfg.backend_version, "reporting backend version");

	let selected = methods::selected_methods(&cfg)?;
	if selected.is_empty() {
		warn!("no methods are selected for forwarding");
	}
	for method in &selected {
		info!(method, "allowing method");
		backend.allow_method(method.clone());
	}

	let server = Server::new(
		Arc::new(TcpFabric::new(cfg.broker_addr.clone())),
		Account::new(server_id, cfg.password.clone()),
		Arc::new(backend),
		ServerConfig {
			version: cfg.backend_version.clone(),
			pubsub_service: cfg.pubsub_service.clone(),
		},
	);
	if !cfg.ca_file.is_empty() {
		server.adapter().set_root_ca(PathBuf::from(&cfg.ca_file));
	}

	if cfg.waitforchange {
		info!("enabling waitforchange updates");
		server
			.add_notification(new_waiter(
				Arc::new(StateChange),
				&cfg.backend_rpc_url,
				"waitforchange",
			))
			.await;
	}
	if cfg.waitforpendingchange {
		info!("enabling waitforpendingchange updates");
		server
			.add_notification(new_waiter(
				Arc::new(PendingChange),
				&cfg.backend_rpc_url,
				"waitforpendingchange",
			))
			.await;
	}

	let supervisor = spawn_in_span(maintenance::run(
		server.clone(),
		ReconnectConfig {
			interval: cfg.reconnect_interval,
			priority: cfg.priority,
		},
		shutdown.clone(),
	));

	{
		let shutdown = shutdown.clone();
		spawn_in_span(async move {
			user_signal().await;
			let _ = shutdown.trigger_shutdown("user signal received".to_string());
		});
	}

	let reason = shutdown.triggered_shutdown().await;
	info!(reason, "shutting down");
	let _ = supervisor.await;
	server.shutdown().await;
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
