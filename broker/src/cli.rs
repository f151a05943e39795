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
	/// Address to listen on for broker connections
	#[arg(long, default_value = "127.0.0.1:5280")]
	pub listen: String,
	/// JSON file mapping account names to passwords
	#[arg(long, value_name = "FILE")]
	pub accounts: Option<String>,
	/// Register unknown accounts on their first connection
	#[arg(long)]
	pub open_registration: bool,
	/// Log level
	#[arg(long, default_value = "info")]
	pub verbosity: LogLevel,
	/// Set logs format to JSON
	#[arg(long)]
	pub logs_json: bool,
}
