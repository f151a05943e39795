use std::fmt::{self, Display, Formatter};

use clap::{command, Parser, ValueEnum};

#[derive(ValueEnum, Clone, Copy)]
pub enum LogLevel {
	Info,
	Debug,
	Trace,
	Warn,
	Error,
}

impl Display for LogLevel {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			LogLevel::Info => "INFO",
			LogLevel::Debug => "DEBUG",
			LogLevel::Trace => "TRACE",
			LogLevel::Warn => "WARN",
			LogLevel::Error => "ERROR",
		})
	}
}

impl From<LogLevel> for tracing::Level {
	fn from(level: LogLevel) -> Self {
		match level {
			LogLevel::Info => tracing::Level::INFO,
			LogLevel::Debug => tracing::Level::DEBUG,
			LogLevel::Trace => tracing::Level::TRACE,
			LogLevel::Warn => tracing::Level::WARN,
			LogLevel::Error => tracing::Level::ERROR,
		}
	}
}

#[derive(Parser)]
#[command(version)]
pub struct CliOpts {
	/// Path to the JSON configuration file
	#[arg(short, long, value_name = "FILE")]
	pub config: Option<String>,
	/// URL at which the backend JSON-RPC interface is available
	#[arg(long)]
	pub backend_rpc_url: Option<String>,
	/// A string identifying the version of the backend provided
	#[arg(long)]
	pub backend_version: Option<String>,
	/// Address of the messaging broker
	#[arg(long)]
	pub broker_addr: Option<String>,
	/// Bare identity for the server
	#[arg(long)]
	pub server_id: Option<String>,
	/// Password for the server identity
	#[arg(long)]
	pub password: Option<String>,
	/// Presence priority for the connection
	#[arg(long)]
	pub priority: Option<i8>,
	/// The pub/sub service to use for notifications
	#[arg(long)]
	pub pubsub_service: Option<String>,
	/// Enable game-state change updates
	#[arg(long)]
	pub waitforchange: bool,
	/// Enable pending-move change updates
	#[arg(long)]
	pub waitforpendingchange: bool,
	/// Comma-separated list of RPC methods to forward
	#[arg(long)]
	pub methods: Option<String>,
	/// Load forwarded methods from the given JSON spec file
	#[arg(long, value_name = "FILE")]
	pub methods_json_spec: Option<String>,
	/// Comma-separated list of methods to exclude
	#[arg(long)]
	pub methods_exclude: Option<String>,
	/// Root CA file overriding system trust for TLS verification
	#[arg(long, value_name = "FILE")]
	pub ca_file: Option<String>,
	/// Log level
	#[arg(long)]
	pub verbosity: Option<LogLevel>,
	/// Set logs format to JSON
	#[arg(long)]
	pub logs_json: bool,
}
