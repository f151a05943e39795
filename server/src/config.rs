use std::fs;
use std::time::Duration;

use color_eyre::{eyre::WrapErr, Result};
use serde::{Deserialize, Serialize};

use crate::cli::CliOpts;
use charon_core::types::duration_seconds_format;

/// Runtime configuration, loaded from an optional JSON file with CLI
/// flags taking precedence.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct RuntimeConfig {
	/// URL at which the backend JSON-RPC interface is available.
	pub backend_rpc_url: String,
	/// Version string advertised to clients.
	pub backend_version: String,
	/// Address of the messaging broker.
	pub broker_addr: String,
	/// Bare identity for the server.
	pub server_id: String,
	/// Password for the server identity.
	pub password: String,
	/// Presence priority for the connection.
	pub priority: i8,
	/// The pub/sub service carrying notification nodes.
	pub pubsub_service: String,
	/// Enable game-state change updates.
	pub waitforchange: bool,
	/// Enable pending-move change updates.
	pub waitforpendingchange: bool,
	/// Comma-separated list of RPC methods to forward.
	pub methods: String,
	/// JSON spec file to load forwarded methods from.
	pub methods_json_spec: String,
	/// Comma-separated list of methods to exclude.
	pub methods_exclude: String,
	/// Root CA file overriding system trust.
	pub ca_file: String,
	/// Time between reconnect attempts.
	#[serde(with = "duration_seconds_format")]
	pub reconnect_interval: Duration,
}

impl Default for RuntimeConfig {
	fn default() -> Self {
		Self {
			backend_rpc_url: String::new(),
			backend_version: String::new(),
			broker_addr: "127.0.0.1:5280".to_string(),
			server_id: String::new(),
			password: String::new(),
			priority: 0,
			pubsub_service: "pubsub".to_string(),
			waitforchange: false,
			waitforpendingchange: false,
			methods: String::new(),
			methods_json_spec: String::new(),
			methods_exclude: String::new(),
			ca_file: String::new(),
			reconnect_interval: Duration::from_secs(5),
		}
	}
}

impl RuntimeConfig {
	pub fn load(opts: &CliOpts) -> Result<Self> {
		let mut config = match &opts.config {
			Some(path) => {
				let raw = fs::read_to_string(path).wrap_err("failed to read the config file")?;
				serde_json::from_str(&raw).wrap_err("invalid config file")?
			},
			None => Self::default(),
		};

		if let Some(value) = &opts.backend_rpc_url {
			config.backend_rpc_url = value.clone();
		}
		if let Some(value) = &opts.backend_version {
			config.backend_version = value.clone();
		}
		if let Some(value) = &opts.broker_addr {
			config.broker_addr = value.clone();
		}
		if let Some(value) = &opts.server_id {
			config.server_id = value.clone();
		}
		if let Some(value) = &opts.password {
			config.password = value.clone();
		}
		if let Some(value) = opts.priority {
			config.priority = value;
		}
		if let Some(value) = &opts.pubsub_service {
			config.pubsub_service = value.clone();
		}
		if opts.waitforchange {
			config.waitforchange = true;
		}
		if opts.waitforpendingchange {
			config.waitforpendingchange = true;
		}
		if let Some(value) = &opts.methods {
			config.methods = value.clone();
		}
		if let Some(value) = &opts.methods_json_spec {
			config.methods_json_spec = value.clone();
		}
		if let Some(value) = &opts.methods_exclude {
			config.methods_exclude = value.clone();
		}
		if let Some(value) = &opts.ca_file {
			config.ca_file = value.clone();
		}

		Ok(config)
	}
}
