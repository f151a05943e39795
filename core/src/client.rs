//! Client assembly: discovery of a live server instance, forwarding of
//! method calls and gated notification waits.
//!
//! A client starts with only the bare server identity.  Before the first
//! request it pings that identity and accepts the first pong presence
//! whose version matches the expected backend version and whose
//! advertisement covers every registered notification type.  Concurrent
//! callers coalesce onto one in-flight ping.  The selection is cleared on
//! disconnect, on unavailable presence from the selected identity and on
//! a protocol-level "service unavailable" reply; the next call then
//! re-runs discovery.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use color_eyre::Result;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::messaging::{
	Adapter, Fabric, Message, NodeId, Presence, PresenceKind, Stanza,
};
use crate::notifications::{NotificationState, NotificationType};
use crate::pubsub::ItemCallback;
use crate::rpc::{CallOutcome, RpcCall, RpcError, DEFAULT_TIMEOUT};
use crate::types::{Account, Identity};
use crate::utils::spawn_in_span;
use crate::wire::stanzas::{find_extension, Extension, Ping, Pong, RpcRequest, SupportedNotifications};

/// Negative presence priority, so the client never receives traffic
/// addressed to its bare identity.
const CLIENT_PRIORITY: i8 = -1;

#[derive(Clone, Debug)]
pub struct ClientConfig {
	/// Bare identity of the server to discover.
	pub server: Identity,
	/// Backend version the server must advertise, compared for exact
	/// equality.
	pub expected_version: String,
	/// Timeout applied to discovery and to each forwarded call.
	pub timeout: Duration,
}

impl ClientConfig {
	pub fn new(server: Identity, expected_version: impl Into<String>) -> Self {
		Self {
			server: server.to_bare(),
			expected_version: expected_version.into(),
			timeout: DEFAULT_TIMEOUT,
		}
	}
}

struct PingAttempt {
	deadline: Instant,
}

struct ClientInner {
	adapter: Adapter,
	config: ClientConfig,
	/// The currently selected full server identity, if any.
	selected: Mutex<Option<Identity>>,
	/// In-flight ping shared by all callers waiting on discovery.
	ping: Mutex<Option<PingAttempt>>,
	ping_notify: Notify,
	notifications: Mutex<BTreeMap<String, Arc<NotificationState>>>,
	subscribe_tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to a running transport client.
#[derive(Clone)]
pub struct Client {
	inner: Arc<ClientInner>,
}

impl Client {
	pub fn new(fabric: Arc<dyn Fabric>, account: Account, config: ClientConfig) -> Self {
		let adapter = Adapter::new(fabric, account);
		let inner = Arc::new(ClientInner {
			adapter: adapter.clone(),
			config,
			selected: Mutex::new(None),
			ping: Mutex::new(None),
			ping_notify: Notify::new(),
			notifications: Mutex::new(BTreeMap::new()),
			subscribe_tasks: Mutex::new(Vec::new()),
		});

		let weak = Arc::downgrade(&inner);
		adapter.on_presence(Box::new(move |presence| {
			if let Some(inner) = weak.upgrade() {
				ClientInner::handle_presence(&inner, presence);
			}
		}));

		let weak = Arc::downgrade(&inner);
		adapter.set_disconnect_hook(Box::new(move || {
			if let Some(inner) = weak.upgrade() {
				inner.clear_selection();
			}
		}));

		Self { inner }
	}

	pub fn adapter(&self) -> &Adapter {
		&self.inner.adapter
	}

	/// Registers interest in a notification type.  Must happen before
	/// discovery; a server is only accepted if it advertises every
	/// registered type.  Registering the same type twice is a programming
	/// error.
	pub fn register_notification(&self, ty: Arc<dyn NotificationType>) {
		let record = NotificationState::new(ty);
		let previous = self
			.inner
			.notifications
			.lock()
			.unwrap()
			.insert(record.name().to_string(), record);
		assert!(
			previous.is_none(),
			"notification type registered twice",
		);
	}

	pub async fn connect(&self) -> Result<bool> {
		self.inner.adapter.connect(CLIENT_PRIORITY).await
	}

	/// Tears the client down: blocked subscription exchanges are woken,
	/// their tasks joined, and the connection closed.
	pub async fn disconnect(&self) {
		self.inner.adapter.detach_pubsub();
		let tasks: Vec<_> = self.inner.subscribe_tasks.lock().unwrap().drain(..).collect();
		for task in tasks {
			let _ = task.await;
		}
		self.inner.adapter.disconnect().await;
	}

	pub fn is_connected(&self) -> bool {
		self.inner.adapter.is_connected()
	}

	/// Forwards a method call to the selected server and blocks for the
	/// correlated reply.
	pub async fn forward_method(&self, method: &str, params: Value) -> Result<Value, RpcError> {
		let Some(server) = self.ensure_selected().await else {
			return Err(RpcError::internal(format!(
				"could not discover server for {}",
				self.inner.config.server,
			)));
		};

		let call = RpcCall::send(
			&self.inner.adapter,
			server.clone(),
			RpcRequest::new(method, params),
		);
		match call.wait(self.inner.config.timeout).await {
			CallOutcome::Success(result) => Ok(result),
			CallOutcome::Error(error) => Err(error),
			CallOutcome::Unavailable => {
				self.inner.clear_selection_if(&server);
				Err(RpcError::internal("selected server is unavailable"))
			},
			CallOutcome::Timeout => Err(RpcError::internal(format!(
				"timeout waiting for result from {server}",
			))),
		}
	}

	/// Waits for a change of the given notification type relative to the
	/// caller's known state id.  Discovery runs first so that the
	/// subscription exists; its failure only means the wait can end
	/// without a state.
	pub async fn wait_for_change(&self, ty: &str, known: Value) -> Result<Value, RpcError> {
		let record = self.inner.notifications.lock().unwrap().get(ty).cloned();
		let Some(record) = record else {
			return Err(RpcError::internal(format!(
				"not waiting for notifications of type {ty}",
			)));
		};
		if self.ensure_selected().await.is_none() {
			debug!(ty, "no server selected while waiting for a change");
		}
		Ok(record.wait_for_change(&known).await)
	}

	/// Forces discovery to complete and returns the selected server's
	/// resource, or the empty string if none could be found in time.
	pub async fn server_resource(&self) -> String {
		match self.ensure_selected().await {
			Some(identity) => identity.resource().unwrap_or_default().to_string(),
			None => String::new(),
		}
	}

	/// Makes sure a full server identity is selected, pinging the bare
	/// target if necessary.  Concurrent callers share one in-flight ping.
	async fn ensure_selected(&self) -> Option<Identity> {
		let inner = &self.inner;
		if let Some(identity) = inner.selected.lock().unwrap().clone() {
			return Some(identity);
		}

		let deadline = {
			let mut ping = inner.ping.lock().unwrap();
			match ping.as_ref() {
				Some(attempt) if attempt.deadline > Instant::now() => attempt.deadline,
				_ => {
					info!(server = %inner.config.server, "sending discovery ping");
					let deadline = Instant::now() + inner.config.timeout;
					*ping = Some(PingAttempt { deadline });

					let mut message = Message::to(inner.config.server.clone());
					message.payloads.push(Ping.to_tag());
					inner.adapter.send(Stanza::Message(message));
					deadline
				},
			}
		};

		loop {
			let notified = inner.ping_notify.notified();
			tokio::pin!(notified);
			notified.as_mut().enable();

			if let Some(identity) = inner.selected.lock().unwrap().clone() {
				return Some(identity);
			}

			if tokio::time::timeout_at(deadline, notified).await.is_err() {
				warn!(server = %inner.config.server, "discovery timed out");
				let mut ping = inner.ping.lock().unwrap();
				if ping.as_ref().is_some_and(|attempt| attempt.deadline == deadline) {
					*ping = None;
				}
				return inner.selected.lock().unwrap().clone();
			}
		}
	}
}

impl ClientInner {
	fn clear_selection(&self) {
		if self.selected.lock().unwrap().take().is_some() {
			info!("cleared the selected server identity");
		}
	}

	fn clear_selection_if(&self, identity: &Identity) {
		let mut selected = self.selected.lock().unwrap();
		if selected.as_ref() == Some(identity) {
			info!(%identity, "selected server became unavailable");
			*selected = None;
		}
	}

	fn handle_presence(inner: &Arc<ClientInner>, presence: Presence) {
		match presence.kind {
			PresenceKind::Unavailable => inner.clear_selection_if(&presence.from),
			PresenceKind::Available => Self::handle_pong(inner, presence),
		}
	}

	/// Gate and accept a handshake reply.  The first acceptable pong
	/// wins; anything else is logged and ignored.
	fn handle_pong(inner: &Arc<ClientInner>, presence: Presence) {
		let Some(pong) = find_extension::<Pong>(&presence.payloads) else {
			return;
		};

		if !presence.from.same_bare(&inner.config.server) {
			warn!(from = %presence.from, "ignoring pong from a foreign identity");
			return;
		}
		if pong.version != inner.config.expected_version {
			warn!(
				got = pong.version,
				expected = inner.config.expected_version,
				"ignoring pong with mismatched version",
			);
			return;
		}

		let registered: Vec<String> =
			inner.notifications.lock().unwrap().keys().cloned().collect();
		let advertised = find_extension::<SupportedNotifications>(&presence.payloads);
		if !registered.is_empty() {
			let Some(advertised) = &advertised else {
				warn!(from = %presence.from, "ignoring pong without notification support");
				return;
			};
			if let Some(missing) = registered
				.iter()
				.find(|ty| !advertised.notifications.contains_key(*ty))
			{
				warn!(
					from = %presence.from,
					ty = missing,
					"ignoring pong lacking a registered notification type",
				);
				return;
			}
		}

		{
			let mut selected = inner.selected.lock().unwrap();
			if selected.is_some() {
				// multiple replies: the first one was picked already
				return;
			}
			*selected = Some(presence.from.clone());
		}
		info!(server = %presence.from, "selected full server identity");

		// make ourselves visible to the server
		inner
			.adapter
			.send(Stanza::Presence(Presence::available(presence.from.clone())));

		if !registered.is_empty() {
			let advertised = advertised.expect("advertisement was checked above");
			Self::spawn_subscriptions(inner, &registered, &advertised);
		}

		inner.ping.lock().unwrap().take();
		inner.ping_notify.notify_waiters();
	}

	/// Re-points the pub/sub attachment at the advertised service and
	/// subscribes to the per-type nodes.  Subscribing is itself a
	/// request/response exchange with the broker, so it runs on its own
	/// task; old subscriptions are simply abandoned with the replaced
	/// attachment.
	fn spawn_subscriptions(
		inner: &Arc<ClientInner>,
		registered: &[String],
		advertised: &SupportedNotifications,
	) {
		let adapter = inner.adapter.clone();
		let service = advertised.service.clone();
		let nodes: Vec<(Arc<NotificationState>, NodeId)> = {
			let notifications = inner.notifications.lock().unwrap();
			registered
				.iter()
				.map(|ty| {
					(
						notifications[ty].clone(),
						advertised.notifications[ty].clone(),
					)
				})
				.collect()
		};

		let task = spawn_in_span(async move {
			let Some(pubsub) = adapter.attach_pubsub(&service) else {
				warn!("cannot attach pub/sub while disconnected");
				return;
			};
			for (record, node) in nodes {
				let callback: ItemCallback = {
					let record = record.clone();
					Arc::new(move |tag| record.on_item(&tag))
				};
				if !pubsub.subscribe(&node, callback).await {
					warn!(ty = record.name(), %node, "subscription failed");
				}
			}
		});

		let mut tasks = inner.subscribe_tasks.lock().unwrap();
		tasks.retain(|task| !task.is_finished());
		tasks.push(task);
	}
}
