//! Typed stanza extensions of the transport protocol.
//!
//! Every extension lives under the marker namespace [`XMLNS`].  Parsing is
//! forgiving towards the outside world: anything malformed is logged and
//! treated as if the extension were absent.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::warn;

use crate::messaging::{NodeId, Tag};
use crate::wire::{decode_json, encode_json};

/// Marker XML namespace of all protocol extensions.
pub const XMLNS: &str = "https://xaya.io/charon/";

/// A payload tag that can be embedded in (and recovered from) a stanza.
pub trait Extension: Sized {
	/// Tag name of this extension.
	const TAG: &'static str;

	/// Parses the extension from a tag already matched on name and
	/// namespace.  Returns `None` (after logging) for malformed content.
	fn parse(tag: &Tag) -> Option<Self>;

	/// Serialises the extension body (without the namespace attribute).
	fn body(&self) -> Tag;

	fn to_tag(&self) -> Tag {
		let mut tag = self.body();
		debug_assert_eq!(tag.name(), Self::TAG);
		tag.set_attr("xmlns", XMLNS);
		tag
	}
}

/// Looks up and parses an extension among a stanza's payload tags.
pub fn find_extension<E: Extension>(payloads: &[Tag]) -> Option<E> {
	payloads
		.iter()
		.find(|tag| tag.name() == E::TAG && tag.attr("xmlns") == Some(XMLNS))
		.and_then(E::parse)
}

/// Handshake request, carried in a message to the bare server identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ping;

impl Extension for Ping {
	const TAG: &'static str = "ping";

	fn parse(_tag: &Tag) -> Option<Self> {
		Some(Ping)
	}

	fn body(&self) -> Tag {
		Tag::new(Self::TAG)
	}
}

/// Handshake reply, carried in a directed presence from a server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pong {
	pub version: String,
}

impl Extension for Pong {
	const TAG: &'static str = "pong";

	fn parse(tag: &Tag) -> Option<Self> {
		let Some(version) = tag.attr("version") else {
			warn!("pong tag has no version attribute");
			return None;
		};
		Some(Pong {
			version: version.to_string(),
		})
	}

	fn body(&self) -> Tag {
		let mut tag = Tag::new(Self::TAG);
		tag.set_attr("version", &self.version);
		tag
	}
}

/// Advertisement of the pub/sub service and per-type nodes a server
/// offers, attached alongside a pong.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SupportedNotifications {
	pub service: String,
	pub notifications: BTreeMap<String, NodeId>,
}

impl SupportedNotifications {
	pub fn new(service: impl Into<String>) -> Self {
		Self {
			service: service.into(),
			notifications: BTreeMap::new(),
		}
	}

	pub fn add(&mut self, ty: impl Into<String>, node: NodeId) {
		self.notifications.insert(ty.into(), node);
	}
}

impl Extension for SupportedNotifications {
	const TAG: &'static str = "notifications";

	fn parse(tag: &Tag) -> Option<Self> {
		let Some(service) = tag.attr("service") else {
			warn!("notifications tag has no service attribute");
			return None;
		};

		let mut notifications = BTreeMap::new();
		for child in tag.children() {
			if child.name() != "notification" {
				warn!("unexpected child in notifications tag: {}", child.name());
				return None;
			}
			let Some(ty) = child.attr("type") else {
				warn!("notification entry has no type attribute");
				return None;
			};
			if child.text().is_empty() {
				warn!("notification entry for {ty} has no node");
				return None;
			}
			notifications.insert(ty.to_string(), NodeId(child.text().to_string()));
		}

		Some(SupportedNotifications {
			service: service.to_string(),
			notifications,
		})
	}

	fn body(&self) -> Tag {
		let mut tag = Tag::new(Self::TAG);
		tag.set_attr("service", &self.service);
		for (ty, node) in &self.notifications {
			let mut child = Tag::with_text("notification", &node.0);
			child.set_attr("type", ty);
			tag.push_child(child);
		}
		tag
	}
}

/// A forwarded method call, carried in an IQ of subtype get.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RpcRequest {
	pub method: String,
	pub params: Value,
}

impl RpcRequest {
	pub fn new(method: impl Into<String>, params: Value) -> Self {
		Self {
			method: method.into(),
			params,
		}
	}
}

impl Extension for RpcRequest {
	const TAG: &'static str = "request";

	fn parse(tag: &Tag) -> Option<Self> {
		let Some(method) = tag.child("method") else {
			warn!("request tag has no method child");
			return None;
		};
		if method.text().is_empty() {
			warn!("request tag has an empty method");
			return None;
		}

		let Some(params_tag) = tag.child("params") else {
			warn!("request tag has no params child");
			return None;
		};
		let params = match decode_json(params_tag) {
			Ok(params) => params,
			Err(error) => {
				warn!("failed decoding request params: {error}");
				return None;
			},
		};
		if !params.is_object() && !params.is_array() {
			warn!("request params is neither object nor array");
			return None;
		}

		Some(RpcRequest {
			method: method.text().to_string(),
			params,
		})
	}

	fn body(&self) -> Tag {
		let mut tag = Tag::new(Self::TAG);
		tag.push_child(Tag::with_text("method", &self.method));
		tag.push_child(encode_json("params", &self.params));
		tag
	}
}

/// Outcome of a forwarded call, carried in an IQ of subtype result.
/// JSON-RPC errors ride inside a normal result stanza; the error form
/// here is the backend's error, not a transport failure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RpcResponse {
	Success {
		result: Value,
	},
	Error {
		code: i64,
		message: String,
		data: Value,
	},
}

impl Extension for RpcResponse {
	const TAG: &'static str = "response";

	fn parse(tag: &Tag) -> Option<Self> {
		if let Some(result_tag) = tag.child("result") {
			if tag.has_child("error") {
				warn!("response tag has both result and error children");
				return None;
			}
			return match decode_json(result_tag) {
				Ok(result) => Some(RpcResponse::Success { result }),
				Err(error) => {
					warn!("failed decoding response result: {error}");
					None
				},
			};
		}

		let Some(error_tag) = tag.child("error") else {
			warn!("response tag has neither result nor error");
			return None;
		};
		let Some(code) = error_tag.attr("code").and_then(|c| c.parse().ok()) else {
			warn!("response error has no usable code attribute");
			return None;
		};
		let message = error_tag
			.child("message")
			.map(|t| t.text().to_string())
			.unwrap_or_default();
		let data = match error_tag.child("data") {
			Some(data_tag) => match decode_json(data_tag) {
				Ok(data) => data,
				Err(error) => {
					warn!("failed decoding response error data: {error}");
					return None;
				},
			},
			None => Value::Null,
		};

		Some(RpcResponse::Error {
			code,
			message,
			data,
		})
	}

	fn body(&self) -> Tag {
		let mut tag = Tag::new(Self::TAG);
		match self {
			RpcResponse::Success { result } => {
				tag.push_child(encode_json("result", result));
			},
			RpcResponse::Error {
				code,
				message,
				data,
			} => {
				let mut error = Tag::new("error");
				error.set_attr("code", code);
				if !message.is_empty() {
					error.push_child(Tag::with_text("message", message));
				}
				if !data.is_null() {
					error.push_child(encode_json("data", data));
				}
				tag.push_child(error);
			},
		}
		tag
	}
}

/// A state update published as a pub/sub item.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NotificationUpdate {
	pub ty: String,
	pub state: Value,
}

impl NotificationUpdate {
	pub fn new(ty: impl Into<String>, state: Value) -> Self {
		Self {
			ty: ty.into(),
			state,
		}
	}
}

impl Extension for NotificationUpdate {
	const TAG: &'static str = "update";

	fn parse(tag: &Tag) -> Option<Self> {
		let Some(ty) = tag.attr("type") else {
			warn!("update tag has no type attribute");
			return None;
		};
		let state = match decode_json(tag) {
			Ok(state) => state,
			Err(error) => {
				warn!("failed decoding update state: {error}");
				return None;
			},
		};
		Some(NotificationUpdate {
			ty: ty.to_string(),
			state,
		})
	}

	fn body(&self) -> Tag {
		let mut tag = encode_json(Self::TAG, &self.state);
		tag.set_attr("type", &self.ty);
		tag
	}
}
