//! End-to-end tests of server discovery, call forwarding and notification
//! fanout, running client and server against the in-memory fabric.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Notify;

use charon_core::backend::Backend;
use charon_core::client::{Client, ClientConfig};
use charon_core::messaging::memory::MemoryBroker;
use charon_core::messaging::Fabric;
use charon_core::notifications::NotificationType;
use charon_core::rpc::{RpcError, ERROR_INTERNAL};
use charon_core::server::{Server, ServerConfig};
use charon_core::types::{Account, Identity};
use charon_core::waiter::{UpdateWaiter, WaiterTask};

const VERSION: &str = "backend-1.0";

/// Backend with `echo(x) = x` and `error(x)` raising `(42, x, null)`.
struct TestBackend;

#[async_trait]
impl Backend for TestBackend {
	async fn handle_method(&self, method: &str, params: &Value) -> Result<Value, RpcError> {
		match method {
			"echo" => Ok(params[0].clone()),
			"error" => Err(RpcError::new(
				42,
				params[0].as_str().unwrap_or_default(),
				Value::Null,
			)),
			other => Err(RpcError::method_not_found(other)),
		}
	}
}

/// Notification fixture over `{"id": .., "value": ..}` states.
struct IdValueNotification;

impl NotificationType for IdValueNotification {
	fn name(&self) -> &str {
		"foo"
	}

	fn extract_state_id(&self, full_state: &Value) -> Value {
		full_state["id"].clone()
	}

	fn always_block_id(&self) -> Value {
		json!("always block")
	}
}

/// An updatable state value servers can long-poll, standing in for the
/// backend's update source.
#[derive(Default)]
struct UpdatableState {
	state: Mutex<Value>,
	changed: Notify,
}

impl UpdatableState {
	fn set_state(self: &Arc<Self>, id: &str, value: &str) {
		*self.state.lock().unwrap() = json!({"id": id, "value": value});
		self.changed.notify_waiters();
	}

	fn new_waiter(self: &Arc<Self>) -> Box<dyn UpdateWaiter> {
		Box::new(StateWaiter {
			shared: self.clone(),
			last: Value::Null,
		})
	}
}

struct StateWaiter {
	shared: Arc<UpdatableState>,
	last: Value,
}

#[async_trait]
impl UpdateWaiter for StateWaiter {
	async fn wait_for_update(&mut self) -> color_eyre::Result<Option<Value>> {
		loop {
			let notified = self.shared.changed.notified();
			tokio::pin!(notified);
			notified.as_mut().enable();

			{
				let state = self.shared.state.lock().unwrap();
				if !state.is_null() && *state != self.last {
					self.last = state.clone();
					return Ok(Some(state.clone()));
				}
			}
			notified.await;
		}
	}
}

fn fabric(broker: &MemoryBroker) -> Arc<dyn Fabric> {
	Arc::new(broker.clone())
}

fn server_identity() -> Identity {
	Identity::bare("srv", "example.org")
}

async fn start_server(broker: &MemoryBroker, version: &str) -> Server {
	broker.add_account("srv", "password");
	let server = Server::new(
		fabric(broker),
		Account::new(server_identity(), "password"),
		Arc::new(TestBackend),
		ServerConfig {
			version: version.to_string(),
			pubsub_service: "pubsub.example.org".to_string(),
		},
	);
	assert!(server.connect(10).await.unwrap());
	server
}

fn new_client(broker: &MemoryBroker, timeout: Duration) -> Client {
	broker.add_account("cli", "password");
	let mut config = ClientConfig::new(server_identity(), VERSION);
	config.timeout = timeout;
	Client::new(
		fabric(broker),
		Account::new(Identity::bare("cli", "example.org"), "password"),
		config,
	)
}

async fn connected_client(broker: &MemoryBroker, timeout: Duration) -> Client {
	let client = new_client(broker, timeout);
	assert!(client.connect().await.unwrap());
	client
}

#[tokio::test]
async fn discovery_success() {
	let broker = MemoryBroker::new();
	let server = start_server(&broker, VERSION).await;
	let client = connected_client(&broker, Duration::from_millis(500)).await;

	let resource = client.server_resource().await;
	assert!(!resource.is_empty());
	assert_eq!(
		Some(resource.as_str()),
		server.adapter().local().unwrap().resource(),
	);

	// the selection is sticky: later lookups answer without re-pinging
	assert_eq!(client.server_resource().await, resource);

	client.disconnect().await;
	server.shutdown().await;
}

#[tokio::test]
async fn discovery_timeout() {
	let broker = MemoryBroker::new();
	// nobody answers pings
	let client = connected_client(&broker, Duration::from_millis(50)).await;

	assert_eq!(client.server_resource().await, "");
	let error = client
		.forward_method("echo", json!(["foo"]))
		.await
		.unwrap_err();
	assert_eq!(error.code, ERROR_INTERNAL);

	client.disconnect().await;
}

#[tokio::test]
async fn echo_and_error_calls() {
	let broker = MemoryBroker::new();
	let server = start_server(&broker, VERSION).await;
	let client = connected_client(&broker, Duration::from_millis(500)).await;

	let result = client.forward_method("echo", json!(["foo"])).await.unwrap();
	assert_eq!(result, json!("foo"));

	let error = client
		.forward_method("error", json!(["bar"]))
		.await
		.unwrap_err();
	assert_eq!(error.code, 42);
	assert_eq!(error.message, "bar");

	client.disconnect().await;
	server.shutdown().await;
}

#[tokio::test]
async fn concurrent_calls_are_independent() {
	let broker = MemoryBroker::new();
	let server = start_server(&broker, VERSION).await;
	let client = connected_client(&broker, Duration::from_millis(500)).await;

	let calls: Vec<_> = (0..10)
		.map(|i| {
			let client = client.clone();
			tokio::spawn(async move {
				client
					.forward_method("echo", json!([format!("payload-{i}")]))
					.await
			})
		})
		.collect();

	for (i, call) in calls.into_iter().enumerate() {
		let result = call.await.unwrap().unwrap();
		assert_eq!(result, json!(format!("payload-{i}")));
	}

	client.disconnect().await;
	server.shutdown().await;
}

#[tokio::test]
async fn reselection_on_server_loss() {
	let broker = MemoryBroker::new();
	let first = start_server(&broker, VERSION).await;
	let second = start_server(&broker, VERSION).await;
	let client = connected_client(&broker, Duration::from_millis(500)).await;

	assert_eq!(
		client.forward_method("echo", json!(["foo"])).await.unwrap(),
		json!("foo"),
	);

	// take down exactly the selected instance
	let selected = client.server_resource().await;
	let first_identity = first.adapter().local().unwrap();
	let (gone, remaining) = if first_identity.resource() == Some(selected.as_str()) {
		(first, second)
	} else {
		(second, first)
	};
	let gone_identity = gone.adapter().local().unwrap();
	let remaining_identity = remaining.adapter().local().unwrap();
	broker.drop_session(&gone_identity);
	tokio::time::sleep(Duration::from_millis(100)).await;

	// the next call discovers the surviving instance
	assert_eq!(
		client.forward_method("echo", json!(["foo"])).await.unwrap(),
		json!("foo"),
	);
	assert_eq!(
		Some(client.server_resource().await.as_str()),
		remaining_identity.resource(),
	);

	// without any instance left the call fails
	broker.drop_session(&remaining_identity);
	tokio::time::sleep(Duration::from_millis(100)).await;
	let error = client
		.forward_method("echo", json!(["foo"]))
		.await
		.unwrap_err();
	assert_eq!(error.code, ERROR_INTERNAL);

	client.disconnect().await;
	remaining.shutdown().await;
	gone.shutdown().await;
}

#[tokio::test]
async fn version_mismatch_prevents_selection() {
	let broker = MemoryBroker::new();
	let server = start_server(&broker, "other-version").await;
	let client = connected_client(&broker, Duration::from_millis(100)).await;

	assert_eq!(client.server_resource().await, "");

	client.disconnect().await;
	server.shutdown().await;
}

#[tokio::test]
async fn wait_for_change_semantics() {
	let broker = MemoryBroker::new();
	broker.add_account("srv", "password");

	let state = Arc::new(UpdatableState::default());
	let server = Server::new(
		fabric(&broker),
		Account::new(server_identity(), "password"),
		Arc::new(TestBackend),
		ServerConfig {
			version: VERSION.to_string(),
			pubsub_service: "pubsub.example.org".to_string(),
		},
	);
	server
		.add_notification(WaiterTask::new(
			Arc::new(IdValueNotification),
			state.new_waiter(),
		))
		.await;
	assert!(server.connect(10).await.unwrap());

	let client = new_client(&broker, Duration::from_millis(500));
	client.register_notification(Arc::new(IdValueNotification));
	assert!(client.connect().await.unwrap());

	// force discovery and give the subscription a moment to settle
	assert!(!client.server_resource().await.is_empty());
	tokio::time::sleep(Duration::from_millis(100)).await;

	// without any state the wait blocks until an update arrives
	let waiter = {
		let client = client.clone();
		tokio::spawn(async move { client.wait_for_change("foo", json!("")).await })
	};
	tokio::time::sleep(Duration::from_millis(100)).await;
	state.set_state("a", "first");
	assert_eq!(
		waiter.await.unwrap().unwrap(),
		json!({"id": "a", "value": "first"}),
	);

	// a different known id returns right away
	assert_eq!(
		client.wait_for_change("foo", json!("x")).await.unwrap(),
		json!({"id": "a", "value": "first"}),
	);

	// knowing the current id blocks again
	let blocked = tokio::time::timeout(
		Duration::from_millis(200),
		client.wait_for_change("foo", json!("a")),
	)
	.await;
	assert!(blocked.is_err(), "wait must block on the current id");

	// the sentinel blocks even though a state exists
	let blocked = tokio::time::timeout(
		Duration::from_millis(200),
		client.wait_for_change("foo", json!("always block")),
	)
	.await;
	assert!(blocked.is_err(), "wait must block on the sentinel");

	// the next update releases a blocked wait
	let waiter = {
		let client = client.clone();
		tokio::spawn(async move { client.wait_for_change("foo", json!("a")).await })
	};
	tokio::time::sleep(Duration::from_millis(100)).await;
	state.set_state("b", "second");
	assert_eq!(
		waiter.await.unwrap().unwrap(),
		json!({"id": "b", "value": "second"}),
	);

	client.disconnect().await;
	server.shutdown().await;
}

#[tokio::test]
async fn pong_must_advertise_registered_notifications() {
	let broker = MemoryBroker::new();
	// this server offers no notifications at all
	let server = start_server(&broker, VERSION).await;

	let client = new_client(&broker, Duration::from_millis(100));
	client.register_notification(Arc::new(IdValueNotification));
	assert!(client.connect().await.unwrap());

	// its pong fails the notification gate
	assert_eq!(client.server_resource().await, "");

	client.disconnect().await;
	server.shutdown().await;
}

#[tokio::test]
async fn connect_failure_reports_false() {
	let broker = MemoryBroker::new();
	broker.add_account("cli", "password");
	let client = Client::new(
		fabric(&broker),
		Account::new(Identity::bare("cli", "example.org"), "wrong-password"),
		ClientConfig::new(server_identity(), VERSION),
	);
	assert!(!client.connect().await.unwrap());
}

#[tokio::test]
async fn disconnect_is_idempotent() {
	let broker = MemoryBroker::new();
	let server = start_server(&broker, VERSION).await;
	let client = connected_client(&broker, Duration::from_millis(500)).await;

	client.disconnect().await;
	client.disconnect().await;

	server.disconnect().await;
	server.disconnect().await;
	server.shutdown().await;

	// a fresh connect works after a full teardown
	assert!(client.connect().await.unwrap());
	client.disconnect().await;
}

#[tokio::test]
async fn teardown_terminates_blocked_waits() {
	let broker = MemoryBroker::new();
	broker.add_account("srv", "password");

	let state = Arc::new(UpdatableState::default());
	let server = Server::new(
		fabric(&broker),
		Account::new(server_identity(), "password"),
		Arc::new(TestBackend),
		ServerConfig {
			version: VERSION.to_string(),
			pubsub_service: "pubsub.example.org".to_string(),
		},
	);
	server
		.add_notification(WaiterTask::new(
			Arc::new(IdValueNotification),
			state.new_waiter(),
		))
		.await;
	assert!(server.connect(10).await.unwrap());

	let client = new_client(&broker, Duration::from_millis(500));
	client.register_notification(Arc::new(IdValueNotification));
	assert!(client.connect().await.unwrap());
	assert!(!client.server_resource().await.is_empty());

	// calls in flight while everything shuts down must all come back
	let pending_call = {
		let client = client.clone();
		tokio::spawn(async move { client.forward_method("echo", json!(["x"])).await })
	};

	tokio::time::timeout(Duration::from_secs(5), async {
		server.shutdown().await;
		client.disconnect().await;
		let _ = pending_call.await;
	})
	.await
	.expect("teardown must finish in bounded time");
}

#[tokio::test]
async fn server_reconnect_restores_readiness() {
	let broker = MemoryBroker::new();
	broker.add_account("srv", "password");

	let state = Arc::new(UpdatableState::default());
	let server = Server::new(
		fabric(&broker),
		Account::new(server_identity(), "password"),
		Arc::new(TestBackend),
		ServerConfig {
			version: VERSION.to_string(),
			pubsub_service: "pubsub.example.org".to_string(),
		},
	);
	server
		.add_notification(WaiterTask::new(
			Arc::new(IdValueNotification),
			state.new_waiter(),
		))
		.await;
	assert!(server.connect(10).await.unwrap());
	let first_node = server.notification_node("foo").unwrap();

	server.disconnect().await;
	assert!(server.notification_node("foo").is_none());

	assert!(server.connect(10).await.unwrap());
	let second_node = server.notification_node("foo").unwrap();
	assert_ne!(first_node, second_node);

	// the restored node is live again for a fresh client
	let client = new_client(&broker, Duration::from_millis(500));
	client.register_notification(Arc::new(IdValueNotification));
	assert!(client.connect().await.unwrap());
	assert!(!client.server_resource().await.is_empty());
	tokio::time::sleep(Duration::from_millis(100)).await;

	let waiter = {
		let client = client.clone();
		tokio::spawn(async move { client.wait_for_change("foo", json!("")).await })
	};
	tokio::time::sleep(Duration::from_millis(100)).await;
	state.set_state("a", "first");
	assert_eq!(
		waiter.await.unwrap().unwrap(),
		json!({"id": "a", "value": "first"}),
	);

	client.disconnect().await;
	server.shutdown().await;
}
