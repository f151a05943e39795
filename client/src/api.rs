//! Local HTTP endpoint speaking JSON-RPC 2.0.
//!
//! Forwarded methods travel through the transport client to the selected
//! server; the per-type wait methods map onto gated notification waits;
//! a `stop` notification shuts the process down.

use std::collections::{BTreeMap, BTreeSet};
use std::convert::Infallible;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};
use warp::{Filter, Rejection, Reply};

use charon_core::client::Client;
use charon_core::rpc::RpcError;
use charon_core::shutdown::Controller;

#[derive(Clone)]
pub struct ApiState {
	pub client: Client,
	/// Methods forwarded to the remote server.
	pub forwarded: Arc<BTreeSet<String>>,
	/// Wait methods, mapped to their notification type.
	pub waits: Arc<BTreeMap<String, String>>,
	pub shutdown: Controller<String>,
}

#[derive(Deserialize)]
struct Request {
	#[serde(default)]
	id: Value,
	method: String,
	#[serde(default)]
	params: Value,
}

fn with_state(state: ApiState) -> impl Filter<Extract = (ApiState,), Error = Infallible> + Clone {
	warp::any().map(move || state.clone())
}

pub fn route(state: ApiState) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
	warp::post()
		.and(warp::path::end())
		.and(with_state(state))
		.and(warp::body::json())
		.and_then(handle)
}

async fn handle(state: ApiState, request: Request) -> Result<impl Reply, Infallible> {
	debug!(method = request.method, "local RPC call");

	if request.method == "stop" {
		info!("received stop request");
		let _ = state.shutdown.trigger_shutdown("stop requested".to_string());
		return Ok(warp::reply::json(&json!({
			"jsonrpc": "2.0",
			"id": request.id,
			"result": Value::Null,
		})));
	}

	let outcome = if let Some(ty) = state.waits.get(&request.method) {
		let known = request
			.params
			.get(0)
			.cloned()
			.unwrap_or(Value::Null);
		state.client.wait_for_change(ty, known).await
	} else if state.forwarded.contains(&request.method) {
		state.client.forward_method(&request.method, request.params).await
	} else {
		Err(RpcError::method_not_found(&request.method))
	};

	let body = match outcome {
		Ok(result) => json!({
			"jsonrpc": "2.0",
			"id": request.id,
			"result": result,
		}),
		Err(error) => json!({
			"jsonrpc": "2.0",
			"id": request.id,
			"error": {
				"code": error.code,
				"message": error.message,
				"data": error.data,
			},
		}),
	};
	Ok(warp::reply::json(&body))
}

#[cfg(test)]
mod tests {
	use super::*;
	use async_trait::async_trait;
	use charon_core::backend::Backend;
	use charon_core::client::ClientConfig;
	use charon_core::messaging::memory::MemoryBroker;
	use charon_core::rpc::ERROR_METHOD_NOT_FOUND;
	use charon_core::server::{Server, ServerConfig};
	use charon_core::types::{Account, Identity};
	use std::time::Duration;

	struct EchoBackend;

	#[async_trait]
	impl Backend for EchoBackend {
		async fn handle_method(&self, method: &str, params: &Value) -> Result<Value, RpcError> {
			match method {
				"echo" => Ok(params[0].clone()),
				other => Err(RpcError::method_not_found(other)),
			}
		}
	}

	async fn test_state() -> (ApiState, Server) {
		let broker = MemoryBroker::new();
		broker.add_account("srv", "pwd");
		broker.add_account("cli", "pwd");

		let server = Server::new(
			Arc::new(broker.clone()),
			Account::new(Identity::bare("srv", "example.org"), "pwd"),
			Arc::new(EchoBackend),
			ServerConfig {
				version: "v1".to_string(),
				pubsub_service: "pubsub.example.org".to_string(),
			},
		);
		assert!(server.connect(10).await.unwrap());

		let mut config = ClientConfig::new(Identity::bare("srv", "example.org"), "v1");
		config.timeout = Duration::from_secs(2);
		let client = Client::new(
			Arc::new(broker),
			Account::new(Identity::bare("cli", "example.org"), "pwd"),
			config,
		);
		assert!(client.connect().await.unwrap());

		let state = ApiState {
			client,
			forwarded: Arc::new(["echo".to_string()].into_iter().collect()),
			waits: Arc::new(BTreeMap::new()),
			shutdown: Controller::new(),
		};
		(state, server)
	}

	async fn call(state: &ApiState, body: Value) -> Value {
		let response = warp::test::request()
			.method("POST")
			.path("/")
			.json(&body)
			.reply(&route(state.clone()))
			.await;
		assert_eq!(response.status(), 200);
		serde_json::from_slice(response.body()).unwrap()
	}

	#[tokio::test]
	async fn forwards_allowed_methods() {
		let (state, server) = test_state().await;

		let reply = call(
			&state,
			json!({"jsonrpc": "2.0", "id": 1, "method": "echo", "params": ["foo"]}),
		)
		.await;
		assert_eq!(reply["result"], json!("foo"));
		assert_eq!(reply["id"], json!(1));

		state.client.disconnect().await;
		server.shutdown().await;
	}

	#[tokio::test]
	async fn unknown_methods_are_rejected_locally() {
		let (state, server) = test_state().await;

		let reply = call(
			&state,
			json!({"jsonrpc": "2.0", "id": 2, "method": "secret", "params": []}),
		)
		.await;
		assert_eq!(reply["error"]["code"], json!(ERROR_METHOD_NOT_FOUND));

		state.client.disconnect().await;
		server.shutdown().await;
	}

	#[tokio::test]
	async fn stop_triggers_shutdown() {
		let (state, server) = test_state().await;

		let reply = call(&state, json!({"jsonrpc": "2.0", "method": "stop"})).await;
		assert_eq!(reply["result"], Value::Null);
		assert!(state.shutdown.is_triggered());

		state.client.disconnect().await;
		server.shutdown().await;
	}
}
