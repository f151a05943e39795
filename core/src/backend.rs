//! The backend contract: the local JSON-RPC service a server proxies to.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::rpc::RpcError;

/// A service able to answer forwarded method calls.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
	/// Answers a call to the given method.  Returns the JSON result on
	/// success and an [`RpcError`] to be relayed verbatim otherwise.
	async fn handle_method(&self, method: &str, params: &Value) -> Result<Value, RpcError>;
}

#[derive(Serialize)]
struct RequestEnvelope<'a> {
	jsonrpc: &'static str,
	id: u64,
	method: &'a str,
	params: &'a Value,
}

#[derive(Deserialize, Serialize, Debug)]
pub struct ErrorObject {
	pub code: i64,
	pub message: String,
	#[serde(default)]
	pub data: Value,
}

#[derive(Deserialize)]
struct ResponseEnvelope {
	result: Option<Value>,
	error: Option<ErrorObject>,
}

static NEXT_CALL_ID: AtomicU64 = AtomicU64::new(1);

/// One JSON-RPC 2.0 call over HTTP.  Transport failures surface as
/// internal errors; error objects in the response surface verbatim.
pub(crate) async fn http_call(
	client: &reqwest::Client,
	url: &str,
	method: &str,
	params: &Value,
) -> Result<Value, RpcError> {
	let envelope = RequestEnvelope {
		jsonrpc: "2.0",
		id: NEXT_CALL_ID.fetch_add(1, Ordering::Relaxed),
		method,
		params,
	};
	let response = client
		.post(url)
		.json(&envelope)
		.send()
		.await
		.map_err(|error| RpcError::internal(format!("backend request failed: {error}")))?;
	let envelope: ResponseEnvelope = response
		.json()
		.await
		.map_err(|error| RpcError::internal(format!("invalid backend response: {error}")))?;

	match envelope.error {
		Some(error) => Err(RpcError::new(error.code, error.message, error.data)),
		None => Ok(envelope.result.unwrap_or(Value::Null)),
	}
}

/// Backend that forwards an allow-listed set of methods to an HTTP
/// JSON-RPC endpoint and rejects everything else with "method not found".
pub struct ForwardingBackend {
	url: String,
	allowed: HashSet<String>,
	client: reqwest::Client,
}

impl ForwardingBackend {
	pub fn new(url: impl Into<String>) -> Self {
		Self {
			url: url.into(),
			allowed: HashSet::new(),
			client: reqwest::Client::new(),
		}
	}

	pub fn allow_method(&mut self, method: impl Into<String>) {
		self.allowed.insert(method.into());
	}

	pub fn allowed_methods(&self) -> impl Iterator<Item = &str> {
		self.allowed.iter().map(String::as_str)
	}
}

#[async_trait]
impl Backend for ForwardingBackend {
	async fn handle_method(&self, method: &str, params: &Value) -> Result<Value, RpcError> {
		if !self.allowed.contains(method) {
			debug!(method, "rejecting method outside the allow list");
			return Err(RpcError::method_not_found(method));
		}
		http_call(&self.client, &self.url, method, params).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::rpc::ERROR_METHOD_NOT_FOUND;
	use serde_json::json;

	#[tokio::test]
	async fn methods_outside_the_allow_list_are_rejected() {
		let mut backend = ForwardingBackend::new("http://127.0.0.1:1/rpc");
		backend.allow_method("echo");

		let error = backend
			.handle_method("getstate", &json!([]))
			.await
			.unwrap_err();
		assert_eq!(error.code, ERROR_METHOD_NOT_FOUND);
	}

	#[tokio::test]
	async fn transport_failure_is_an_internal_error() {
		// nothing listens on this port
		let mut backend = ForwardingBackend::new("http://127.0.0.1:9/rpc");
		backend.allow_method("echo");

		let error = backend.handle_method("echo", &json!(["x"])).await.unwrap_err();
		assert_eq!(error.code, crate::rpc::ERROR_INTERNAL);
	}
}
