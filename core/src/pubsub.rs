//! Facade over the broker's pub/sub capability.
//!
//! A server creates and owns nodes and is the only party publishing to
//! them; a client subscribes to nodes owned by somebody else.  All broker
//! calls block on the broker's acknowledgment, and every blocked call is
//! registered with a teardown controller so that [`PubSub::shutdown`] can
//! complete it synthetically instead of leaving the caller hanging when
//! the connection goes away mid-call.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use color_eyre::{eyre::eyre, Result};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::messaging::{BrokerCall, BrokerRequest, NodeId, Tag};
use crate::shutdown::Controller;

pub type ItemCallback = Arc<dyn Fn(Tag) + Send + Sync>;

struct PubSubInner {
	service: String,
	broker: mpsc::UnboundedSender<BrokerCall>,
	/// Completes blocked broker calls when the facade is torn down.
	teardown: Controller<String>,
	owned: Mutex<HashSet<NodeId>>,
	subscriptions: Mutex<HashMap<NodeId, ItemCallback>>,
}

#[derive(Clone)]
pub struct PubSub {
	inner: Arc<PubSubInner>,
}

impl PubSub {
	pub(crate) fn new(service: String, broker: mpsc::UnboundedSender<BrokerCall>) -> Self {
		Self {
			inner: Arc::new(PubSubInner {
				service,
				broker,
				teardown: Controller::new(),
				owned: Mutex::new(HashSet::new()),
				subscriptions: Mutex::new(HashMap::new()),
			}),
		}
	}

	pub fn service(&self) -> &str {
		&self.inner.service
	}

	async fn call(&self, request: BrokerRequest) -> Result<()> {
		let (reply, ack) = oneshot::channel();
		self.inner
			.broker
			.send(BrokerCall {
				service: self.inner.service.clone(),
				request,
				reply,
			})
			.map_err(|_| eyre!("broker connection is closed"))?;

		match self.inner.teardown.with_cancel(ack).await {
			Ok(Ok(Ok(()))) => Ok(()),
			Ok(Ok(Err(error))) => Err(eyre!(error)),
			Ok(Err(_)) => Err(eyre!("broker reply channel closed")),
			Err(reason) => Err(eyre!("pub/sub torn down while waiting for the broker: {reason}")),
		}
	}

	/// Creates an ephemeral, single-publisher node owned by this party.
	/// Blocks until the broker confirms.
	pub async fn create_node(&self) -> Result<NodeId> {
		let node = NodeId(Uuid::new_v4().to_string());
		self.call(BrokerRequest::CreateNode { node: node.clone() })
			.await?;
		self.inner.owned.lock().unwrap().insert(node.clone());
		debug!(%node, "created pub/sub node");
		Ok(node)
	}

	/// Publishes a single item to an owned node.  Blocks until the broker
	/// confirms.
	pub async fn publish(&self, node: &NodeId, payload: Tag) -> Result<()> {
		assert!(
			self.inner.owned.lock().unwrap().contains(node),
			"publish into unowned node {node}",
		);
		self.call(BrokerRequest::Publish {
			node: node.clone(),
			payload,
		})
		.await
	}

	/// Subscribes to a node owned by some other party.  Each received item
	/// that is not a retraction is passed to the callback.
	pub async fn subscribe(&self, node: &NodeId, callback: ItemCallback) -> bool {
		match self
			.call(BrokerRequest::Subscribe { node: node.clone() })
			.await
		{
			Ok(()) => {
				self.inner
					.subscriptions
					.lock()
					.unwrap()
					.insert(node.clone(), callback);
				debug!(%node, "subscribed to pub/sub node");
				true
			},
			Err(error) => {
				warn!(%node, "subscribing failed: {error}");
				false
			},
		}
	}

	pub(crate) fn dispatch_item(&self, node: &NodeId, payload: Tag) {
		let callback = self.inner.subscriptions.lock().unwrap().get(node).cloned();
		match callback {
			Some(callback) => callback(payload),
			None => warn!(%node, "ignoring item for non-subscribed node"),
		}
	}

	/// Tears the facade down: unsubscribes from every subscription and
	/// deletes every owned node without waiting for acknowledgments (those
	/// may race the shutdown of the underlying connection), and wakes
	/// every call still blocked on a broker reply.
	pub(crate) fn shutdown(&self) {
		let _ = self
			.inner
			.teardown
			.trigger_shutdown("pub/sub detached".to_string());

		let fire_and_forget = |request: BrokerRequest| {
			let (reply, _) = oneshot::channel();
			let _ = self.inner.broker.send(BrokerCall {
				service: self.inner.service.clone(),
				request,
				reply,
			});
		};

		let subscriptions: Vec<NodeId> =
			self.inner.subscriptions.lock().unwrap().drain().map(|(node, _)| node).collect();
		info!(
			"unsubscribing from {} nodes on pub/sub teardown",
			subscriptions.len(),
		);
		for node in subscriptions {
			fire_and_forget(BrokerRequest::Unsubscribe { node });
		}

		let owned: Vec<NodeId> = self.inner.owned.lock().unwrap().drain().collect();
		info!("deleting {} owned nodes on pub/sub teardown", owned.len());
		for node in owned {
			fire_and_forget(BrokerRequest::DeleteNode { node });
		}
	}
}
