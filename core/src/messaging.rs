//! The narrow messaging capability the transport core is built on.
//!
//! The core never talks to a concrete messaging stack directly.  It depends
//! on [`Fabric`], which hands out a [`Session`] consisting of a stanza sink,
//! an inbound event stream and a channel for broker pub/sub requests.  A
//! production deployment implements the trait on top of a real XMPP stack;
//! tests use the in-memory implementation in [`memory`].

use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::types::{Account, Identity};

pub mod adapter;
pub mod memory;
pub mod tcp;

pub use adapter::Adapter;

/// A node of the opaque XML-ish payload trees carried inside stanzas.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
	name: String,
	attrs: BTreeMap<String, String>,
	text: String,
	children: Vec<Tag>,
}

impl Tag {
	pub fn new(name: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			..Default::default()
		}
	}

	pub fn with_text(name: impl Into<String>, text: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			text: text.into(),
			..Default::default()
		}
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn text(&self) -> &str {
		&self.text
	}

	pub fn attr(&self, name: &str) -> Option<&str> {
		self.attrs.get(name).map(String::as_str)
	}

	pub fn set_attr(&mut self, name: impl Into<String>, value: impl Display) {
		self.attrs.insert(name.into(), value.to_string());
	}

	pub fn children(&self) -> &[Tag] {
		&self.children
	}

	pub fn child(&self, name: &str) -> Option<&Tag> {
		self.children.iter().find(|c| c.name == name)
	}

	pub fn has_child(&self, name: &str) -> bool {
		self.child(name).is_some()
	}

	pub fn push_child(&mut self, child: Tag) {
		self.children.push(child);
	}
}

/// An addressed unit on the fabric.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Stanza {
	Message(Message),
	Presence(Presence),
	Iq(Iq),
}

impl Stanza {
	pub fn to(&self) -> &Identity {
		match self {
			Stanza::Message(m) => &m.to,
			Stanza::Presence(p) => &p.to,
			Stanza::Iq(iq) => &iq.to,
		}
	}

	pub(crate) fn set_from(&mut self, from: Identity) {
		match self {
			Stanza::Message(m) => m.from = from,
			Stanza::Presence(p) => p.from = from,
			Stanza::Iq(iq) => iq.from = from,
		}
	}
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
	pub from: Identity,
	pub to: Identity,
	pub payloads: Vec<Tag>,
}

impl Message {
	pub fn to(to: Identity) -> Self {
		Self {
			from: to.to_bare(),
			to,
			payloads: Vec::new(),
		}
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PresenceKind {
	Available,
	Unavailable,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Presence {
	pub from: Identity,
	pub to: Identity,
	pub kind: PresenceKind,
	pub payloads: Vec<Tag>,
}

impl Presence {
	pub fn available(to: Identity) -> Self {
		Self {
			from: to.to_bare(),
			to,
			kind: PresenceKind::Available,
			payloads: Vec::new(),
		}
	}
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IqKind {
	Get,
	Result,
	Error(StanzaError),
}

/// Protocol-level error condition carried by an error IQ.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StanzaError {
	ServiceUnavailable,
	Other(String),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Iq {
	pub from: Identity,
	pub to: Identity,
	/// Correlation id matching a reply to its request.
	pub id: String,
	pub kind: IqKind,
	pub payloads: Vec<Tag>,
}

/// Name of a broker pub/sub node.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl Display for NodeId {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// A single pub/sub operation against the broker.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum BrokerRequest {
	CreateNode { node: NodeId },
	DeleteNode { node: NodeId },
	Publish { node: NodeId, payload: Tag },
	Subscribe { node: NodeId },
	Unsubscribe { node: NodeId },
}

#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum BrokerError {
	#[error("node {0} already exists")]
	NodeExists(NodeId),
	#[error("node {0} does not exist")]
	NoSuchNode(NodeId),
	#[error("node {0} is owned by another party")]
	NotOwner(NodeId),
	#[error("broker connection is closed")]
	Disconnected,
}

/// A broker request together with the channel its acknowledgment is
/// delivered on.
#[derive(Debug)]
pub struct BrokerCall {
	pub service: String,
	pub request: BrokerRequest,
	pub reply: oneshot::Sender<Result<(), BrokerError>>,
}

/// Inbound traffic and connection-level events of a live session.
#[derive(Debug)]
pub enum Event {
	Stanza(Stanza),
	/// An item published on a node this session is subscribed to.
	PubSubItem {
		node: NodeId,
		payload: Tag,
		retract: bool,
	},
	/// The fabric dropped the connection.
	Disconnected { reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum FabricError {
	#[error("authentication failed")]
	Auth,
	#[error("TLS handshake rejected: {0}")]
	Tls(String),
	#[error("fabric unreachable: {0}")]
	Unreachable(String),
}

/// TLS settings applied when opening a connection.
#[derive(Clone, Debug, Default)]
pub struct TlsConfig {
	/// Overrides system trust for certificate verification.
	pub root_ca: Option<PathBuf>,
	/// Accept certificates whose chain fails verification.  Off by
	/// default; a bad chain then aborts the connection.
	pub allow_invalid_chain: bool,
}

/// Parameters for opening a connection.
#[derive(Clone, Debug)]
pub struct ConnectOptions {
	/// Presence priority.  Servers use a normal priority; clients use a
	/// negative one so they never receive traffic addressed to the bare
	/// identity.
	pub priority: i8,
	pub tls: TlsConfig,
}

/// A live, authenticated connection to the fabric.
pub struct Session {
	/// Full identity assigned to this connection.
	pub local: Identity,
	/// Outbound stanzas; sends are best-effort and never block.
	pub stanzas: mpsc::UnboundedSender<Stanza>,
	/// Inbound events; closes when the connection dies.
	pub events: mpsc::UnboundedReceiver<Event>,
	/// Pub/sub operations; acknowledgments arrive on the per-call reply
	/// channel.
	pub broker: mpsc::UnboundedSender<BrokerCall>,
}

/// The messaging capability the core is parametric over.
#[async_trait]
pub trait Fabric: Send + Sync + 'static {
	/// Opens a TLS connection with the given credentials.  Authentication
	/// and TLS failures are reported as [`FabricError`]; everything after
	/// a successful connect flows through the returned [`Session`].
	async fn connect(
		&self,
		account: &Account,
		options: &ConnectOptions,
	) -> Result<Session, FabricError>;
}
