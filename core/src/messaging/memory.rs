//! In-memory [`Fabric`] implementation.
//!
//! [`MemoryBroker`] plays the role of the whole messaging infrastructure:
//! account authentication, resource assignment, stanza routing (including
//! the rule that bare-addressed traffic only reaches non-negative-priority
//! connections), directed and unavailable presence, and a pub/sub service
//! with acknowledged create/publish/subscribe/delete semantics.  It exists
//! so that servers and clients can be exercised end to end without any
//! real messaging stack; failure injection hooks cover the error paths.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use super::{
	BrokerCall, BrokerError, BrokerRequest, ConnectOptions, Event, Fabric, FabricError, Iq,
	IqKind, NodeId, Presence, PresenceKind, Session, Stanza, StanzaError,
};
use crate::types::{Account, Identity};
use crate::utils::spawn_in_span;

/// Error kinds that can be injected for connection attempts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectFailure {
	Auth,
	Tls,
}

struct SessionHandle {
	events: mpsc::UnboundedSender<Event>,
	priority: i8,
}

struct NodeRecord {
	owner: Identity,
	subscribers: HashSet<Identity>,
}

#[derive(Default)]
struct BrokerShared {
	accounts: Mutex<HashMap<String, String>>,
	sessions: Mutex<HashMap<Identity, SessionHandle>>,
	nodes: Mutex<HashMap<NodeId, NodeRecord>>,
	denied: Mutex<HashMap<String, ConnectFailure>>,
	next_resource: AtomicU64,
}

/// The in-memory broker; cloning yields another handle onto the same
/// simulated infrastructure.
#[derive(Clone, Default)]
pub struct MemoryBroker {
	shared: Arc<BrokerShared>,
}

impl MemoryBroker {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn add_account(&self, user: &str, password: &str) {
		self.shared
			.accounts
			.lock()
			.unwrap()
			.insert(user.to_string(), password.to_string());
	}

	pub fn has_account(&self, user: &str) -> bool {
		self.shared.accounts.lock().unwrap().contains_key(user)
	}

	/// Makes every future connection attempt of the given user fail with
	/// the given error until [`MemoryBroker::allow_connections`].
	pub fn deny_connections(&self, user: &str, failure: ConnectFailure) {
		self.shared
			.denied
			.lock()
			.unwrap()
			.insert(user.to_string(), failure);
	}

	pub fn allow_connections(&self, user: &str) {
		self.shared.denied.lock().unwrap().remove(user);
	}

	pub fn live_sessions(&self) -> usize {
		self.shared.sessions.lock().unwrap().len()
	}

	/// Forcibly closes the given live connection, as a broker-initiated
	/// disconnect: the session receives a `Disconnected` event and its
	/// unavailable presence is broadcast.
	pub fn drop_session(&self, identity: &Identity) {
		let handle = self.shared.sessions.lock().unwrap().remove(identity);
		if let Some(handle) = handle {
			let _ = handle.events.send(Event::Disconnected {
				reason: "dropped by the broker".to_string(),
			});
			self.session_closed(identity);
		}
	}

	/// Cleanup shared between broker-initiated and client-initiated
	/// session ends: owned nodes disappear and unavailable presence goes
	/// out to everybody still connected.
	fn session_closed(&self, identity: &Identity) {
		self.shared
			.nodes
			.lock()
			.unwrap()
			.retain(|_, record| record.owner != *identity);

		let sessions = self.shared.sessions.lock().unwrap();
		for (peer, handle) in sessions.iter() {
			let _ = handle.events.send(Event::Stanza(Stanza::Presence(Presence {
				from: identity.clone(),
				to: peer.clone(),
				kind: PresenceKind::Unavailable,
				payloads: Vec::new(),
			})));
		}
	}

	fn route(&self, local: &Identity, mut stanza: Stanza) {
		stanza.set_from(local.clone());
		let to = stanza.to().clone();

		let sessions = self.shared.sessions.lock().unwrap();
		if to.is_bare() {
			// bare-addressed traffic skips negative-priority connections
			for (peer, handle) in sessions.iter() {
				if peer.same_bare(&to) && handle.priority >= 0 {
					let _ = handle.events.send(Event::Stanza(stanza.clone()));
				}
			}
			return;
		}

		match sessions.get(&to) {
			Some(handle) => {
				let _ = handle.events.send(Event::Stanza(stanza));
			},
			None => {
				debug!(%to, "no session for directed stanza");
				// a request to a gone full identity bounces back as a
				// protocol-level service-unavailable error
				if let Stanza::Iq(iq) = stanza {
					if iq.kind == IqKind::Get {
						if let Some(sender) = sessions.get(local) {
							let _ = sender.events.send(Event::Stanza(Stanza::Iq(Iq {
								from: to,
								to: local.clone(),
								id: iq.id,
								kind: IqKind::Error(StanzaError::ServiceUnavailable),
								payloads: Vec::new(),
							})));
						}
					}
				}
			},
		}
	}

	fn handle_broker_call(&self, local: &Identity, call: BrokerCall) {
		let BrokerCall { request, reply, .. } = call;
		let result = match request {
			BrokerRequest::CreateNode { node } => {
				let mut nodes = self.shared.nodes.lock().unwrap();
				if nodes.contains_key(&node) {
					Err(BrokerError::NodeExists(node))
				} else {
					nodes.insert(
						node,
						NodeRecord {
							owner: local.clone(),
							subscribers: HashSet::new(),
						},
					);
					Ok(())
				}
			},
			BrokerRequest::DeleteNode { node } => {
				let mut nodes = self.shared.nodes.lock().unwrap();
				match nodes.get(&node) {
					Some(record) if record.owner == *local => {
						nodes.remove(&node);
						Ok(())
					},
					Some(_) => Err(BrokerError::NotOwner(node)),
					None => Err(BrokerError::NoSuchNode(node)),
				}
			},
			BrokerRequest::Publish { node, payload } => {
				let nodes = self.shared.nodes.lock().unwrap();
				match nodes.get(&node) {
					Some(record) if record.owner == *local => {
						let sessions = self.shared.sessions.lock().unwrap();
						for subscriber in &record.subscribers {
							if let Some(handle) = sessions.get(subscriber) {
								let _ = handle.events.send(Event::PubSubItem {
									node: node.clone(),
									payload: payload.clone(),
									retract: false,
								});
							}
						}
						Ok(())
					},
					Some(_) => Err(BrokerError::NotOwner(node)),
					None => Err(BrokerError::NoSuchNode(node)),
				}
			},
			BrokerRequest::Subscribe { node } => {
				let mut nodes = self.shared.nodes.lock().unwrap();
				match nodes.get_mut(&node) {
					Some(record) => {
						record.subscribers.insert(local.clone());
						Ok(())
					},
					None => Err(BrokerError::NoSuchNode(node)),
				}
			},
			BrokerRequest::Unsubscribe { node } => {
				let mut nodes = self.shared.nodes.lock().unwrap();
				match nodes.get_mut(&node) {
					Some(record) => {
						record.subscribers.remove(local);
						Ok(())
					},
					None => Err(BrokerError::NoSuchNode(node)),
				}
			},
		};
		let _ = reply.send(result);
	}

	async fn serve_session(
		self,
		local: Identity,
		mut stanzas: mpsc::UnboundedReceiver<Stanza>,
		mut broker_calls: mpsc::UnboundedReceiver<BrokerCall>,
	) {
		loop {
			tokio::select! {
				stanza = stanzas.recv() => match stanza {
					Some(stanza) => self.route(&local, stanza),
					None => break,
				},
				call = broker_calls.recv() => match call {
					Some(call) => self.handle_broker_call(&local, call),
					None => break,
				},
			}
		}

		// the client hung up; only clean up if the broker has not already
		if self.shared.sessions.lock().unwrap().remove(&local).is_some() {
			self.session_closed(&local);
		}
	}
}

#[async_trait]
impl Fabric for MemoryBroker {
	async fn connect(
		&self,
		account: &Account,
		options: &ConnectOptions,
	) -> Result<Session, FabricError> {
		let user = account.identity.user();
		if let Some(failure) = self.shared.denied.lock().unwrap().get(user) {
			return Err(match failure {
				ConnectFailure::Auth => FabricError::Auth,
				ConnectFailure::Tls => {
					FabricError::Tls("certificate chain verification failed".to_string())
				},
			});
		}

		let known = self.shared.accounts.lock().unwrap().get(user).cloned();
		if known.as_deref() != Some(account.password.as_str()) {
			return Err(FabricError::Auth);
		}

		let resource = format!(
			"res-{}",
			self.shared.next_resource.fetch_add(1, Ordering::Relaxed) + 1,
		);
		let local = account.identity.with_resource(resource);

		let (stanza_tx, stanza_rx) = mpsc::unbounded_channel();
		let (event_tx, event_rx) = mpsc::unbounded_channel();
		let (broker_tx, broker_rx) = mpsc::unbounded_channel();

		self.shared.sessions.lock().unwrap().insert(
			local.clone(),
			SessionHandle {
				events: event_tx,
				priority: options.priority,
			},
		);

		spawn_in_span(self.clone().serve_session(local.clone(), stanza_rx, broker_rx));

		Ok(Session {
			local,
			stanzas: stanza_tx,
			events: event_rx,
			broker: broker_tx,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::messaging::Message;

	async fn connected_session(broker: &MemoryBroker, user: &str, priority: i8) -> Session {
		broker.add_account(user, "pwd");
		let account = Account::new(Identity::bare(user, "example.org"), "pwd");
		broker
			.connect(
				&account,
				&ConnectOptions {
					priority,
					tls: Default::default(),
				},
			)
			.await
			.unwrap()
	}

	#[tokio::test]
	async fn authentication_is_checked() {
		let broker = MemoryBroker::new();
		broker.add_account("alice", "secret");
		let account = Account::new(Identity::bare("alice", "example.org"), "wrong");
		let options = ConnectOptions {
			priority: 0,
			tls: Default::default(),
		};
		assert!(matches!(
			broker.connect(&account, &options).await,
			Err(FabricError::Auth)
		));
	}

	#[tokio::test]
	async fn bare_routing_skips_negative_priority() {
		let broker = MemoryBroker::new();
		let mut listener = connected_session(&broker, "srv", 10).await;
		let mut hidden = connected_session(&broker, "srv", -1).await;
		let sender = connected_session(&broker, "alice", -1).await;

		sender
			.stanzas
			.send(Stanza::Message(Message::to(Identity::bare(
				"srv",
				"example.org",
			))))
			.unwrap();

		let event = listener.events.recv().await.unwrap();
		assert!(matches!(event, Event::Stanza(Stanza::Message(_))));
		// nothing may reach the negative-priority connection
		assert!(hidden.events.try_recv().is_err());
	}

	#[tokio::test]
	async fn request_to_gone_resource_bounces() {
		let broker = MemoryBroker::new();
		let mut sender = connected_session(&broker, "alice", -1).await;

		sender
			.stanzas
			.send(Stanza::Iq(Iq {
				from: sender.local.clone(),
				to: Identity::full("srv", "example.org", "res-none"),
				id: "call-1".to_string(),
				kind: IqKind::Get,
				payloads: Vec::new(),
			}))
			.unwrap();

		let event = sender.events.recv().await.unwrap();
		let Event::Stanza(Stanza::Iq(iq)) = event else {
			panic!("expected an IQ bounce");
		};
		assert_eq!(iq.id, "call-1");
		assert_eq!(iq.kind, IqKind::Error(StanzaError::ServiceUnavailable));
	}

	#[tokio::test]
	async fn unavailable_presence_goes_out_on_session_end() {
		let broker = MemoryBroker::new();
		let server = connected_session(&broker, "srv", 10).await;
		let mut watcher = connected_session(&broker, "alice", -1).await;
		let server_identity = server.local.clone();

		drop(server);
		let event = watcher.events.recv().await.unwrap();
		let Event::Stanza(Stanza::Presence(presence)) = event else {
			panic!("expected unavailable presence");
		};
		assert_eq!(presence.kind, PresenceKind::Unavailable);
		assert_eq!(presence.from, server_identity);
	}
}
