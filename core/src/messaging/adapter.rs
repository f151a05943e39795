//! Connection adapter owning a fabric session.
//!
//! The adapter hides the low-level connection behind handler registration
//! and a best-effort [`send`](Adapter::send).  Exactly one receive task per
//! adapter consumes the session's event stream and dispatches stanzas; all
//! outbound traffic goes through the session's channels, so handlers may
//! send from within the receive path without re-entering any lock.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};

use color_eyre::Result;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
	BrokerCall, ConnectOptions, Event, Fabric, Iq, IqKind, Session, Stanza, TlsConfig,
};
use crate::pubsub::PubSub;
use crate::types::{Account, Identity};
use crate::utils::spawn_in_span;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
	Disconnected,
	Connecting,
	Connected,
}

pub type MessageHandler = Box<dyn Fn(super::Message) + Send + Sync>;
pub type PresenceHandler = Box<dyn Fn(super::Presence) + Send + Sync>;
pub type IqRequestHandler = Box<dyn Fn(Iq) + Send + Sync>;
pub type DisconnectHook = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Handlers {
	message: Option<MessageHandler>,
	presence: Option<PresenceHandler>,
	iq_request: Option<IqRequestHandler>,
}

/// Live-session handles used by the synchronous send paths.
struct IoHandles {
	local: Identity,
	stanzas: mpsc::UnboundedSender<Stanza>,
	broker: mpsc::UnboundedSender<BrokerCall>,
}

/// State owned for the duration of one connection.
struct Connection {
	stop: Arc<Notify>,
	task: JoinHandle<()>,
}

struct AdapterInner {
	fabric: Arc<dyn Fabric>,
	account: Account,
	tls: Mutex<TlsConfig>,
	state: watch::Sender<ConnectionState>,
	connection: tokio::sync::Mutex<Option<Connection>>,
	io: Mutex<Option<IoHandles>>,
	handlers: Mutex<Handlers>,
	/// Pending reply channels of sent IQs, keyed by correlation id.
	pending_iqs: Mutex<HashMap<String, mpsc::UnboundedSender<Iq>>>,
	pubsub: Mutex<Option<PubSub>>,
	disconnect_hook: Mutex<Option<DisconnectHook>>,
}

/// Cloneable handle to a fabric connection.
#[derive(Clone)]
pub struct Adapter {
	inner: Arc<AdapterInner>,
}

impl Adapter {
	pub fn new(fabric: Arc<dyn Fabric>, account: Account) -> Self {
		let (state, _) = watch::channel(ConnectionState::Disconnected);
		Self {
			inner: Arc::new(AdapterInner {
				fabric,
				account,
				tls: Mutex::new(TlsConfig::default()),
				state,
				connection: tokio::sync::Mutex::new(None),
				io: Mutex::new(None),
				handlers: Mutex::new(Handlers::default()),
				pending_iqs: Mutex::new(HashMap::new()),
				pubsub: Mutex::new(None),
				disconnect_hook: Mutex::new(None),
			}),
		}
	}

	/// Overrides system trust for TLS verification.
	pub fn set_root_ca(&self, path: PathBuf) {
		self.inner.tls.lock().unwrap().root_ca = Some(path);
	}

	/// Opts into accepting certificates with chain verification errors.
	pub fn set_allow_invalid_chain(&self, allow: bool) {
		self.inner.tls.lock().unwrap().allow_invalid_chain = allow;
	}

	pub fn on_message(&self, handler: MessageHandler) {
		self.inner.handlers.lock().unwrap().message = Some(handler);
	}

	pub fn on_presence(&self, handler: PresenceHandler) {
		self.inner.handlers.lock().unwrap().presence = Some(handler);
	}

	pub fn on_iq_request(&self, handler: IqRequestHandler) {
		self.inner.handlers.lock().unwrap().iq_request = Some(handler);
	}

	/// Installs the hook invoked first on every disconnect, before any
	/// teardown happens.
	pub fn set_disconnect_hook(&self, hook: DisconnectHook) {
		*self.inner.disconnect_hook.lock().unwrap() = Some(hook);
	}

	pub fn is_connected(&self) -> bool {
		*self.inner.state.borrow() == ConnectionState::Connected
	}

	pub fn state(&self) -> watch::Receiver<ConnectionState> {
		self.inner.state.subscribe()
	}

	/// The full identity assigned to the live connection, if any.
	pub fn local(&self) -> Option<Identity> {
		self.inner.io.lock().unwrap().as_ref().map(|io| io.local.clone())
	}

	/// Opens the connection with the given presence priority.  Returns
	/// false when the fabric rejects the attempt (authentication, TLS or
	/// reachability); the adapter is left disconnected in that case.
	pub async fn connect(&self, priority: i8) -> Result<bool> {
		let mut connection = self.inner.connection.lock().await;
		if connection.is_some() {
			return Ok(true);
		}

		info!(
			account = %self.inner.account.identity,
			priority, "connecting to the messaging fabric",
		);
		self.inner.state.send_replace(ConnectionState::Connecting);

		let options = ConnectOptions {
			priority,
			tls: self.inner.tls.lock().unwrap().clone(),
		};
		let session = match self.inner.fabric.connect(&self.inner.account, &options).await {
			Ok(session) => session,
			Err(error) => {
				warn!(
					account = %self.inner.account.identity,
					"connection failed: {error}",
				);
				self.inner.state.send_replace(ConnectionState::Disconnected);
				return Ok(false);
			},
		};

		let Session {
			local,
			stanzas,
			events,
			broker,
		} = session;
		info!(%local, "connected to the messaging fabric");

		*self.inner.io.lock().unwrap() = Some(IoHandles {
			local,
			stanzas,
			broker,
		});

		let stop = Arc::new(Notify::new());
		let task = spawn_in_span(Self::receive_loop(
			Arc::downgrade(&self.inner),
			events,
			stop.clone(),
		));
		*connection = Some(Connection { stop, task });
		self.inner.state.send_replace(ConnectionState::Connected);
		Ok(true)
	}

	/// Shuts the connection down.  Safe to call on an already-closed
	/// adapter; guarantees that the receive task has exited on return.
	pub async fn disconnect(&self) {
		let mut connection = self.inner.connection.lock().await;
		let Some(conn) = connection.take() else {
			return;
		};
		info!(account = %self.inner.account.identity, "disconnecting");

		Self::run_teardown(&self.inner);

		conn.stop.notify_waiters();
		let _ = conn.task.await;
		self.inner.state.send_replace(ConnectionState::Disconnected);
	}

	/// Disconnect steps shared between the explicit and fabric-initiated
	/// paths: subclass hook first, then pub/sub teardown, then dropping
	/// the session handles.
	fn run_teardown(inner: &Arc<AdapterInner>) {
		if let Some(hook) = inner.disconnect_hook.lock().unwrap().as_ref() {
			hook();
		}
		if let Some(pubsub) = inner.pubsub.lock().unwrap().take() {
			pubsub.shutdown();
		}
		inner.io.lock().unwrap().take();
		inner.pending_iqs.lock().unwrap().clear();
	}

	/// Best-effort send.  The stanza's sender is stamped with the live
	/// connection's full identity.
	pub fn send(&self, mut stanza: Stanza) {
		let io = self.inner.io.lock().unwrap();
		let Some(io) = io.as_ref() else {
			warn!("dropping stanza sent while disconnected");
			return;
		};
		stanza.set_from(io.local.clone());
		if io.stanzas.send(stanza).is_err() {
			warn!("dropping stanza: session channel is closed");
		}
	}

	/// Sends an IQ and registers its correlation id, returning the channel
	/// on which matching replies are delivered.  The registration lives
	/// until [`Adapter::unregister_iq`] or connection teardown.
	pub fn send_iq_expecting_reply(&self, iq: Iq) -> mpsc::UnboundedReceiver<Iq> {
		let (tx, rx) = mpsc::unbounded_channel();
		self.inner
			.pending_iqs
			.lock()
			.unwrap()
			.insert(iq.id.clone(), tx);
		self.send(Stanza::Iq(iq));
		rx
	}

	pub fn unregister_iq(&self, id: &str) {
		self.inner.pending_iqs.lock().unwrap().remove(id);
	}

	/// Attaches the pub/sub service, replacing (and tearing down) any
	/// prior attachment.  Requires a live connection.
	pub fn attach_pubsub(&self, service: &str) -> Option<PubSub> {
		let broker = {
			let io = self.inner.io.lock().unwrap();
			io.as_ref()?.broker.clone()
		};
		let pubsub = PubSub::new(service.to_string(), broker);
		if let Some(old) = self
			.inner
			.pubsub
			.lock()
			.unwrap()
			.replace(pubsub.clone())
		{
			old.shutdown();
		}
		Some(pubsub)
	}

	pub fn detach_pubsub(&self) {
		if let Some(pubsub) = self.inner.pubsub.lock().unwrap().take() {
			pubsub.shutdown();
		}
	}

	pub fn pubsub(&self) -> Option<PubSub> {
		self.inner.pubsub.lock().unwrap().clone()
	}

	async fn receive_loop(
		weak: Weak<AdapterInner>,
		mut events: mpsc::UnboundedReceiver<Event>,
		stop: Arc<Notify>,
	) {
		loop {
			tokio::select! {
				// explicit disconnect; its caller runs the teardown
				_ = stop.notified() => return,
				event = events.recv() => {
					let Some(inner) = weak.upgrade() else {
						return;
					};
					match event {
						Some(Event::Stanza(stanza)) => Self::dispatch(&inner, stanza),
						Some(Event::PubSubItem { node, payload, retract }) => {
							if retract {
								continue;
							}
							let pubsub = inner.pubsub.lock().unwrap().clone();
							match pubsub {
								Some(pubsub) => pubsub.dispatch_item(&node, payload),
								None => debug!(%node, "pub/sub item without attachment"),
							}
						},
						Some(Event::Disconnected { reason }) => {
							warn!("fabric dropped the connection: {reason}");
							Self::remote_disconnect(&inner).await;
							return;
						},
						None => {
							Self::remote_disconnect(&inner).await;
							return;
						},
					}
				},
			}
		}
	}

	fn dispatch(inner: &Arc<AdapterInner>, stanza: Stanza) {
		match stanza {
			Stanza::Message(message) => {
				if let Some(handler) = inner.handlers.lock().unwrap().message.as_ref() {
					handler(message);
				}
			},
			Stanza::Presence(presence) => {
				if let Some(handler) = inner.handlers.lock().unwrap().presence.as_ref() {
					handler(presence);
				}
			},
			Stanza::Iq(iq) => match &iq.kind {
				IqKind::Get => {
					if let Some(handler) = inner.handlers.lock().unwrap().iq_request.as_ref() {
						handler(iq);
					}
				},
				IqKind::Result | IqKind::Error(_) => {
					let pending = inner.pending_iqs.lock().unwrap();
					match pending.get(&iq.id) {
						Some(tx) => {
							if tx.send(iq).is_err() {
								debug!("reply for an abandoned call");
							}
						},
						None => warn!(id = iq.id, "ignoring IQ reply without a waiting call"),
					}
				},
			},
		}
	}

	/// Cleanup for a connection the fabric closed on its own.  If an
	/// explicit disconnect holds the connection lock concurrently, that
	/// call owns the teardown and this task just exits.
	async fn remote_disconnect(inner: &Arc<AdapterInner>) {
		let Ok(mut connection) = inner.connection.try_lock() else {
			return;
		};
		// drop the handle without awaiting it: this *is* the receive task
		connection.take();
		Self::run_teardown(inner);
		inner.state.send_replace(ConnectionState::Disconnected);
	}
}
