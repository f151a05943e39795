//! Client-side request/response correlation.
//!
//! Every forwarded call becomes an [`RpcCall`]: an IQ sent to the selected
//! server whose correlation id is registered with the adapter.  The caller
//! then waits for a terminal outcome.  A call transitions to exactly one
//! terminal state; replies that arrive afterwards find no registration and
//! are dropped by the adapter.

use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::messaging::{Adapter, Iq, IqKind, Stanza, StanzaError};
use crate::types::Identity;
use crate::wire::stanzas::{find_extension, Extension, RpcRequest, RpcResponse};

/// Default per-call timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

pub const ERROR_METHOD_NOT_FOUND: i64 = -32601;
pub const ERROR_INTERNAL: i64 = -32603;

/// A JSON-RPC error as it travels over the wire and surfaces to callers.
#[derive(Clone, Debug, thiserror::Error, PartialEq)]
#[error("RPC error {code}: {message}")]
pub struct RpcError {
	pub code: i64,
	pub message: String,
	pub data: Value,
}

impl RpcError {
	pub fn new(code: i64, message: impl Into<String>, data: Value) -> Self {
		Self {
			code,
			message: message.into(),
			data,
		}
	}

	pub fn internal(message: impl Into<String>) -> Self {
		Self::new(ERROR_INTERNAL, message, Value::Null)
	}

	pub fn method_not_found(method: &str) -> Self {
		Self::new(
			ERROR_METHOD_NOT_FOUND,
			format!("method not found: {method}"),
			Value::Null,
		)
	}
}

/// Terminal state of an in-flight call.
#[derive(Clone, Debug, PartialEq)]
pub enum CallOutcome {
	Success(Value),
	/// The backend raised a JSON-RPC error.
	Error(RpcError),
	/// The server answered with protocol-level "service unavailable";
	/// the selected identity is stale.
	Unavailable,
	Timeout,
}

/// An outgoing request awaiting its correlated reply.
pub struct RpcCall {
	adapter: Adapter,
	server: Identity,
	id: String,
	replies: mpsc::UnboundedReceiver<Iq>,
}

impl RpcCall {
	/// Builds and sends the request stanza to the given server identity.
	pub fn send(adapter: &Adapter, server: Identity, request: RpcRequest) -> Self {
		let id = Uuid::new_v4().to_string();
		debug!(method = request.method, %server, id, "sending RPC request");
		let iq = Iq {
			from: server.to_bare(),
			to: server.clone(),
			id: id.clone(),
			kind: IqKind::Get,
			payloads: vec![request.to_tag()],
		};
		let replies = adapter.send_iq_expecting_reply(iq);
		Self {
			adapter: adapter.clone(),
			server,
			id,
			replies,
		}
	}

	/// The identity the request was sent to.
	pub fn server(&self) -> &Identity {
		&self.server
	}

	/// Blocks until the call reaches a terminal state or the timeout
	/// expires.  Non-terminal replies (wrong subtype, missing or invalid
	/// response extension) are logged and ignored; the wait continues.
	pub async fn wait(mut self, timeout: Duration) -> CallOutcome {
		let deadline = Instant::now() + timeout;
		loop {
			match tokio::time::timeout_at(deadline, self.replies.recv()).await {
				Err(_) => {
					warn!(server = %self.server, "call timed out");
					return CallOutcome::Timeout;
				},
				Ok(Some(iq)) => {
					if let Some(outcome) = Self::interpret(iq) {
						return outcome;
					}
				},
				Ok(None) => {
					// connection teardown cleared the registration; the
					// call runs out its deadline like any other orphan
					tokio::time::sleep_until(deadline).await;
					return CallOutcome::Timeout;
				},
			}
		}
	}

	fn interpret(iq: Iq) -> Option<CallOutcome> {
		match &iq.kind {
			IqKind::Error(StanzaError::ServiceUnavailable) => {
				warn!(from = %iq.from, "service unavailable, the selected server is gone");
				Some(CallOutcome::Unavailable)
			},
			IqKind::Error(error) => {
				warn!(from = %iq.from, "ignoring IQ error reply: {error:?}");
				None
			},
			IqKind::Get => {
				warn!(from = %iq.from, "ignoring IQ of unexpected subtype");
				None
			},
			IqKind::Result => match find_extension::<RpcResponse>(&iq.payloads) {
				None => {
					warn!(from = %iq.from, "ignoring IQ result without a valid response");
					None
				},
				Some(RpcResponse::Success { result }) => Some(CallOutcome::Success(result)),
				Some(RpcResponse::Error {
					code,
					message,
					data,
				}) => Some(CallOutcome::Error(RpcError::new(code, message, data))),
			},
		}
	}
}

impl Drop for RpcCall {
	fn drop(&mut self) {
		self.adapter.unregister_iq(&self.id);
	}
}
