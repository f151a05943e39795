//! Server assembly: answers pings and forwarded method calls, and fans
//! out notification updates through owned pub/sub nodes.
//!
//! Waiter tasks run for the whole lifetime of the server, independently of
//! the connection: a disconnect only detaches their pub/sub side (so
//! backend long-polls keep running), and a reconnect recreates the nodes
//! and turns the server "ready" again.  Pings are only answered while
//! ready, so clients never select a server whose nodes do not exist yet.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use color_eyre::{eyre::eyre, Result};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::messaging::{
	Adapter, Fabric, Iq, IqKind, NodeId, Presence, Stanza,
};
use crate::pubsub::PubSub;
use crate::types::Account;
use crate::utils::spawn_in_span;
use crate::waiter::WaiterTask;
use crate::wire::stanzas::{
	find_extension, Extension, NotificationUpdate, Ping, Pong, RpcRequest, RpcResponse,
	SupportedNotifications,
};

#[derive(Clone, Debug)]
pub struct ServerConfig {
	/// Version string advertised in pongs; clients gate on exact
	/// equality.
	pub version: String,
	/// The pub/sub service carrying this server's notification nodes.
	pub pubsub_service: String,
}

#[derive(Clone)]
struct Attachment {
	pubsub: PubSub,
	node: NodeId,
}

/// One enabled notification: its waiter task plus the pub/sub attachment
/// it publishes through while the server is connected.
struct ServerNotification {
	task: tokio::sync::Mutex<WaiterTask>,
	attachment: Mutex<Option<Attachment>>,
}

impl ServerNotification {
	fn node(&self) -> Option<NodeId> {
		self.attachment
			.lock()
			.unwrap()
			.as_ref()
			.map(|attachment| attachment.node.clone())
	}
}

struct ServerInner {
	adapter: Adapter,
	backend: Arc<dyn Backend>,
	config: ServerConfig,
	notifications: Mutex<BTreeMap<String, Arc<ServerNotification>>>,
	/// Only a fully set-up server (all notification nodes created)
	/// answers pings.
	ready: AtomicBool,
}

/// Handle to a running transport server.
#[derive(Clone)]
pub struct Server {
	inner: Arc<ServerInner>,
}

impl Server {
	pub fn new(
		fabric: Arc<dyn Fabric>,
		account: Account,
		backend: Arc<dyn Backend>,
		config: ServerConfig,
	) -> Self {
		let adapter = Adapter::new(fabric, account);
		let inner = Arc::new(ServerInner {
			adapter: adapter.clone(),
			backend,
			config,
			notifications: Mutex::new(BTreeMap::new()),
			ready: AtomicBool::new(false),
		});

		let weak = Arc::downgrade(&inner);
		adapter.on_message(Box::new(move |message| {
			if let Some(inner) = weak.upgrade() {
				if find_extension::<Ping>(&message.payloads).is_some() {
					inner.handle_ping(message.from);
				}
			}
		}));

		let weak = Arc::downgrade(&inner);
		adapter.on_iq_request(Box::new(move |iq| {
			if let Some(inner) = weak.upgrade() {
				inner.handle_request(iq);
			}
		}));

		let weak = Arc::downgrade(&inner);
		adapter.set_disconnect_hook(Box::new(move || {
			if let Some(inner) = weak.upgrade() {
				inner.ready.store(false, Ordering::Relaxed);
				for notification in inner.notifications.lock().unwrap().values() {
					notification.attachment.lock().unwrap().take();
				}
				info!("detached notifications after disconnect");
			}
		}));

		Self { inner }
	}

	pub fn adapter(&self) -> &Adapter {
		&self.inner.adapter
	}

	/// Enables a notification stream.  The waiter task starts polling the
	/// backend immediately; publishing begins once the server is
	/// connected.  Enabling the same type twice is a programming error.
	pub async fn add_notification(&self, mut task: WaiterTask) {
		let name = task.name().to_string();

		// route new states into the sequential publisher task, so that
		// updates reach the node in the order they were seen
		let (updates, updates_rx) = mpsc::unbounded_channel();
		task.set_update_handler(Arc::new(move |state: &serde_json::Value| {
			let _ = updates.send(state.clone());
		}));
		task.start();

		let notification = Arc::new(ServerNotification {
			attachment: Mutex::new(None),
			task: tokio::sync::Mutex::new(task),
		});

		spawn_in_span(Self::publisher_loop(
			name.clone(),
			Arc::downgrade(&notification),
			updates_rx,
		));

		if self.inner.ready.load(Ordering::Relaxed) {
			if let Some(pubsub) = self.inner.adapter.pubsub() {
				if let Err(error) = Self::attach_notification(&pubsub, &notification).await {
					warn!(ty = name, "late notification attach failed: {error}");
				}
			}
		}

		let previous = self
			.inner
			.notifications
			.lock()
			.unwrap()
			.insert(name, notification);
		assert!(previous.is_none(), "notification type enabled twice");
	}

	/// Consumes queued updates and publishes them one by one.  The
	/// attachment is snapshotted per update and no lock is held across
	/// the publish, which blocks until the broker confirms (or a
	/// disconnect wakes it).
	async fn publisher_loop(
		ty: String,
		notification: Weak<ServerNotification>,
		mut updates: mpsc::UnboundedReceiver<serde_json::Value>,
	) {
		while let Some(state) = updates.recv().await {
			let Some(notification) = notification.upgrade() else {
				return;
			};
			let attachment = notification.attachment.lock().unwrap().clone();
			let Some(attachment) = attachment else {
				debug!(ty, "dropping update while detached");
				continue;
			};

			let payload = NotificationUpdate::new(&ty, state).to_tag();
			if let Err(error) = attachment.pubsub.publish(&attachment.node, payload).await {
				warn!(ty, "publishing update failed: {error}");
			}
		}
	}

	async fn attach_notification(
		pubsub: &PubSub,
		notification: &Arc<ServerNotification>,
	) -> Result<()> {
		let node = pubsub.create_node().await?;
		*notification.attachment.lock().unwrap() = Some(Attachment {
			pubsub: pubsub.clone(),
			node,
		});
		Ok(())
	}

	/// Connects to the fabric and sets up all notification nodes.  Only
	/// returns true once the server is fully ready.
	pub async fn connect(&self, priority: i8) -> Result<bool> {
		if !self.inner.adapter.connect(priority).await? {
			return Ok(false);
		}

		let notifications: Vec<Arc<ServerNotification>> = self
			.inner
			.notifications
			.lock()
			.unwrap()
			.values()
			.cloned()
			.collect();
		if !notifications.is_empty() {
			let pubsub = self
				.inner
				.adapter
				.attach_pubsub(&self.inner.config.pubsub_service)
				.ok_or_else(|| eyre!("connection vanished during setup"))?;
			for notification in &notifications {
				Self::attach_notification(&pubsub, notification).await?;
			}
		}

		self.inner.ready.store(true, Ordering::Relaxed);
		info!("server is ready");
		Ok(true)
	}

	pub async fn disconnect(&self) {
		self.inner.adapter.disconnect().await;
	}

	pub fn is_connected(&self) -> bool {
		self.inner.adapter.is_connected()
	}

	/// Full teardown: waiter tasks are stopped and joined after the
	/// connection is gone.
	pub async fn shutdown(&self) {
		self.disconnect().await;
		let notifications: Vec<Arc<ServerNotification>> = self
			.inner
			.notifications
			.lock()
			.unwrap()
			.values()
			.cloned()
			.collect();
		for notification in notifications {
			let mut task = notification.task.lock().await;
			task.clear_update_handler();
			task.stop().await;
		}
	}

	/// The pub/sub node currently carrying the given notification type.
	pub fn notification_node(&self, ty: &str) -> Option<NodeId> {
		self.inner
			.notifications
			.lock()
			.unwrap()
			.get(ty)
			.and_then(|notification| notification.node())
	}
}

impl ServerInner {
	/// Replies to a handshake ping with a directed pong presence,
	/// advertising the notification nodes if there are any.
	fn handle_ping(&self, from: crate::types::Identity) {
		if !self.ready.load(Ordering::Relaxed) {
			warn!(%from, "not ready yet, ignoring ping");
			return;
		}
		info!(%from, "answering ping");

		let mut presence = Presence::available(from);
		presence.payloads.push(
			Pong {
				version: self.config.version.clone(),
			}
			.to_tag(),
		);

		let notifications = self.notifications.lock().unwrap();
		if !notifications.is_empty() {
			let mut advertisement =
				SupportedNotifications::new(self.config.pubsub_service.clone());
			for (ty, notification) in notifications.iter() {
				let Some(node) = notification.node() else {
					// mid-teardown; the client will ping again
					warn!(ty, "notification lost its node, dropping the pong");
					return;
				};
				advertisement.add(ty.clone(), node);
			}
			presence.payloads.push(advertisement.to_tag());
		}
		drop(notifications);

		self.adapter.send(Stanza::Presence(presence));
	}

	/// Dispatches a forwarded call to the backend on its own task and
	/// replies with an IQ result.  JSON-RPC errors ride inside a normal
	/// result; only transport-level problems would be IQ errors.
	fn handle_request(self: &Arc<Self>, iq: Iq) {
		if iq.kind != IqKind::Get {
			warn!(from = %iq.from, "ignoring IQ of unexpected subtype");
			return;
		}
		let Some(request) = find_extension::<RpcRequest>(&iq.payloads) else {
			warn!(from = %iq.from, "ignoring IQ without a valid request");
			return;
		};

		info!(from = %iq.from, method = request.method, "answering request");
		let inner = self.clone();
		spawn_in_span(async move {
			let response = match inner
				.backend
				.handle_method(&request.method, &request.params)
				.await
			{
				Ok(result) => RpcResponse::Success { result },
				Err(error) => RpcResponse::Error {
					code: error.code,
					message: error.message,
					data: error.data,
				},
			};

			let reply = Iq {
				from: iq.to,
				to: iq.from,
				id: iq.id,
				kind: IqKind::Result,
				payloads: vec![response.to_tag()],
			};
			inner.adapter.send(Stanza::Iq(reply));
		});
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::client::{Client, ClientConfig};
	use crate::messaging::memory::MemoryBroker;
	use crate::rpc::RpcError;
	use crate::types::Identity;
	use mockall::mock;
	use serde_json::{json, Value};
	use std::time::Duration;

	mock! {
		pub Gsp {}

		#[async_trait::async_trait]
		impl Backend for Gsp {
			async fn handle_method(
				&self,
				method: &str,
				params: &Value,
			) -> Result<Value, RpcError>;
		}
	}

	async fn server_with_backend(broker: &MemoryBroker, backend: MockGsp) -> Server {
		broker.add_account("srv", "pwd");
		let server = Server::new(
			Arc::new(broker.clone()),
			Account::new(Identity::bare("srv", "example.org"), "pwd"),
			Arc::new(backend),
			ServerConfig {
				version: "v1".to_string(),
				pubsub_service: "pubsub.example.org".to_string(),
			},
		);
		assert!(server.connect(10).await.unwrap());
		server
	}

	async fn connected_client(broker: &MemoryBroker) -> Client {
		broker.add_account("cli", "pwd");
		let mut config = ClientConfig::new(Identity::bare("srv", "example.org"), "v1");
		config.timeout = Duration::from_millis(500);
		let client = Client::new(
			Arc::new(broker.clone()),
			Account::new(Identity::bare("cli", "example.org"), "pwd"),
			config,
		);
		assert!(client.connect().await.unwrap());
		client
	}

	#[tokio::test]
	async fn backend_sees_the_forwarded_arguments() {
		let mut backend = MockGsp::new();
		backend
			.expect_handle_method()
			.withf(|method, params| method == "getstate" && *params == json!(["arg", 42]))
			.returning(|_, _| Ok(json!({"answer": true})));

		let broker = MemoryBroker::new();
		let server = server_with_backend(&broker, backend).await;
		let client = connected_client(&broker).await;

		let result = client
			.forward_method("getstate", json!(["arg", 42]))
			.await
			.unwrap();
		assert_eq!(result, json!({"answer": true}));

		client.disconnect().await;
		server.shutdown().await;
	}

	#[tokio::test]
	async fn backend_errors_relay_code_message_and_data() {
		let mut backend = MockGsp::new();
		backend.expect_handle_method().returning(|_, _| {
			Err(RpcError::new(-7, "out of range", json!({"limit": 10})))
		});

		let broker = MemoryBroker::new();
		let server = server_with_backend(&broker, backend).await;
		let client = connected_client(&broker).await;

		let error = client.forward_method("bad", json!([])).await.unwrap_err();
		assert_eq!(error.code, -7);
		assert_eq!(error.message, "out of range");
		assert_eq!(error.data, json!({"limit": 10}));

		client.disconnect().await;
		server.shutdown().await;
	}
}
