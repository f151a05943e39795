//! Reconnect supervisor for the server process.

use std::time::Duration;

use tracing::{error, info};

use crate::server::Server;
use crate::shutdown::Controller;

/// Time between liveness checks (and thus connection retries).
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug)]
pub struct ReconnectConfig {
	pub interval: Duration,
	/// Presence priority used when (re)connecting.
	pub priority: i8,
}

impl Default for ReconnectConfig {
	fn default() -> Self {
		Self {
			interval: DEFAULT_INTERVAL,
			priority: 0,
		}
	}
}

/// Periodically checks whether the server is connected and reconnects it
/// if not.  A triggered shutdown ends the loop with a final disconnect.
pub async fn run(server: Server, config: ReconnectConfig, shutdown: Controller<String>) {
	info!("starting reconnect supervisor");

	loop {
		if !server.is_connected() {
			match server.connect(config.priority).await {
				Ok(true) => {},
				Ok(false) => info!("connection attempt failed, retrying later"),
				Err(error) => error!("connection attempt errored: {error:#}"),
			}
		}

		if shutdown
			.with_cancel(tokio::time::sleep(config.interval))
			.await
			.is_err()
		{
			break;
		}
	}

	info!("reconnect supervisor stopping");
	if server.is_connected() {
		server.disconnect().await;
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::backend::Backend;
	use crate::messaging::memory::{ConnectFailure, MemoryBroker};
	use crate::rpc::RpcError;
	use crate::server::ServerConfig;
	use crate::types::{Account, Identity};
	use crate::utils::spawn_in_span;
	use async_trait::async_trait;
	use serde_json::Value;
	use std::sync::Arc;

	struct NullBackend;

	#[async_trait]
	impl Backend for NullBackend {
		async fn handle_method(&self, method: &str, _params: &Value) -> Result<Value, RpcError> {
			Err(RpcError::method_not_found(method))
		}
	}

	#[tokio::test]
	async fn supervisor_reconnects_and_disconnects_on_stop() {
		let broker = MemoryBroker::new();
		broker.add_account("srv", "pwd");
		broker.deny_connections("srv", ConnectFailure::Auth);

		let server = Server::new(
			Arc::new(broker.clone()),
			Account::new(Identity::bare("srv", "example.org"), "pwd"),
			Arc::new(NullBackend),
			ServerConfig {
				version: "v1".to_string(),
				pubsub_service: "pubsub.example.org".to_string(),
			},
		);

		let shutdown = Controller::<String>::new();
		let supervisor = spawn_in_span(run(
			server.clone(),
			ReconnectConfig {
				interval: Duration::from_millis(20),
				priority: 0,
			},
			shutdown.clone(),
		));

		tokio::time::sleep(Duration::from_millis(60)).await;
		assert!(!server.is_connected());

		// once the fabric accepts connections again, the loop picks it up
		broker.allow_connections("srv");
		tokio::time::sleep(Duration::from_millis(100)).await;
		assert!(server.is_connected());

		shutdown.trigger_shutdown("test over".to_string()).unwrap();
		supervisor.await.unwrap();
		assert!(!server.is_connected());
	}
}
