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
	/// Address of the messaging broker.
	pub broker_addr: String,
	/// Bare identity of the server to discover.
	pub server_id: String,
	/// Backend version the server must advertise.
	pub backend_version: String,
	/// Bare identity for this client.
	pub client_id: String,
	/// Password for the client identity.
	pub password: String,
	/// Port for the local JSON-RPC server.
	pub port: u16,
	/// Enable waitforchange updates.
	pub waitforchange: bool,
	/// Enable waitforpendingchange updates.
	pub waitforpendingchange: bool,
	/// Run server detection immediately on start.
	pub detect_server: bool,
	/// Comma-separated list of RPC methods to forward.
	pub methods: String,
	/// JSON spec file to load forwarded methods from.
	pub methods_json_spec: String,
	/// Comma-separated list of methods to exclude.
	pub methods_exclude: String,
	/// Root CA file overriding system trust.
	pub ca_file: String,
	/// Timeout for discovery and for each forwarded call.
	#[serde(with = "duration_seconds_format")]
	pub timeout: Duration,
}

impl Default for RuntimeConfig {
	fn default() -> Self {
		Self {
			broker_addr: "127.0.0.1:5280".to_string(),
			server_id: String::new(),
			backend_version: String::new(),
			client_id: String::new(),
			password: String::new(),
			port: 0,
			waitforchange: false,
			waitforpendingchange: false,
			detect_server: true,
			methods: String::new(),
			methods_json_spec: String::new(),
			methods_exclude: String::new(),
			ca_file: String::new(),
			timeout: Duration::from_secs(3),
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

		if let Some(value) = &opts.broker_addr {
			config.broker_addr = value.clone();
		}
		if let Some(value) = &opts.server_id {
			config.server_id = value.clone();
		}
		if let Some(value) = &opts.backend_version {
			config.backend_version = value.clone();
		}
		if let Some(value) = &opts.client_id {
			config.client_id = value.clone();
		}
		if let Some(value) = &opts.password {
			config.password = value.clone();
		}
		if let Some(value) = opts.port {
			config.port = value;
		}
		if opts.waitforchange {
			config.waitforchange = true;
		}
		if opts.waitforpendingchange {
			config.waitforpendingchange = true;
		}
		if opts.no_detect_server {
			config.detect_server = false;
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
