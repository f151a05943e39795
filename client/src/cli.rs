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
	/// Address of the messaging broker
	#[arg(long)]
	pub broker_addr: Option<String>,
	/// Bare identity of the server to discover
	#[arg(long)]
	pub server_id: Option<String>,
	/// A string identifying the version of the backend required
	#[arg(long)]
	pub backend_version: Option<String>,
	/// Bare identity for this client
	#[arg(long)]
	pub client_id: Option<String>,
	/// Password for the client identity
	#[arg(long)]
	pub password: Option<String>,
	/// Port for the local JSON-RPC server
	#[arg(short, long)]
	pub port: Option<u16>,
	/// Enable waitforchange updates
	#[arg(long)]
	pub waitforchange: bool,
	/// Enable waitforpendingchange updates
	#[arg(long)]
	pub waitforpendingchange: bool,
	/// Skip server detection on startup
	#[arg(long)]
	pub no_detect_server: bool,
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
