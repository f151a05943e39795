use color_eyre::Result;
use futures::Future;
use tokio::task::JoinHandle;
use tracing::{error, Instrument, Level, Subscriber};
use tracing_error::ErrorLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt::format, EnvFilter, FmtSubscriber};

use crate::shutdown::Controller;

pub fn spawn_in_span<F>(future: F) -> JoinHandle<F::Output>
where
	F: Future + Send + 'static,
	F::Output: Send + 'static,
{
	tokio::spawn(future.in_current_span())
}

pub fn default_subscriber(log_level: Level) -> impl Subscriber + Send + Sync {
	FmtSubscriber::builder()
		.with_env_filter(EnvFilter::new(format!("charon={log_level},warn")))
		.with_span_events(format::FmtSpan::CLOSE)
		.finish()
		.with(ErrorLayer::default())
}

pub fn json_subscriber(log_level: Level) -> impl Subscriber + Send + Sync {
	FmtSubscriber::builder()
		.json()
		.with_env_filter(EnvFilter::new(format!("charon={log_level},warn")))
		.with_span_events(format::FmtSpan::CLOSE)
		.finish()
		.with(ErrorLayer::default())
}

/// Installs panic and eyre hooks.  A panic in any thread triggers the
/// given shutdown controller so the remaining tasks wind down instead of
/// running against a half-dead process.
pub fn install_panic_hooks(shutdown: Controller<String>) -> Result<()> {
	let (panic_hook, eyre_hook) = color_eyre::config::HookBuilder::default()
		.display_location_section(true)
		.display_env_section(false)
		.into_hooks();

	eyre_hook.install()?;

	std::panic::set_hook(Box::new(move |panic_info| {
		let _ = shutdown.trigger_shutdown("Panic occurred, shutting down".to_string());

		let msg = format!("{}", panic_hook.panic_report(panic_info));
		error!("Error: {}", strip_ansi_escapes::strip_str(msg));

		#[cfg(debug_assertions)]
		{
			better_panic::Settings::auto()
				.most_recent_first(false)
				.lineno_suffix(true)
				.verbosity(better_panic::Verbosity::Medium)
				.create_panic_handler()(panic_info);
		}
	}));
	Ok(())
}
