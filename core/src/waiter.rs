//! Server-side waiter tasks driving long-polls against the backend.
//!
//! One task runs per exposed notification type.  It long-polls the
//! backend's update source in a loop, deduplicates states by their id and
//! hands genuinely new states to the installed update handler (which the
//! server uses to publish on the type's pub/sub node).  The handler is
//! invoked without holding the task's own lock, since publishing blocks
//! on the broker and may only be woken by a disconnect.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde_json::{json, Value};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backend;
use crate::notifications::NotificationType;
use crate::utils::spawn_in_span;

/// Pause after a failed long-poll, with the time already spent in the
/// call subtracted.
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(5);

/// Source of backend state updates for one notification type.
#[async_trait]
pub trait UpdateWaiter: Send + 'static {
	/// Long-polls for a state update.  `Ok(Some(state))` is a candidate
	/// new state, `Ok(None)` means the call returned without news, and
	/// `Err` is a transient failure after which the loop backs off and
	/// retries.
	async fn wait_for_update(&mut self) -> Result<Option<Value>>;
}

pub type UpdateHandler = Arc<dyn Fn(&Value) + Send + Sync>;

#[derive(Default)]
struct WaiterShared {
	/// Latest state seen by the loop; `Null` until the first update.
	current: Mutex<Value>,
	handler: Mutex<Option<UpdateHandler>>,
}

/// A stoppable long-poll loop for one notification type.
pub struct WaiterTask {
	ty: Arc<dyn NotificationType>,
	waiter: Option<Box<dyn UpdateWaiter>>,
	shared: Arc<WaiterShared>,
	backoff: Duration,
	stop_flag: Arc<AtomicBool>,
	stop_notify: Arc<Notify>,
	task: Option<JoinHandle<Box<dyn UpdateWaiter>>>,
}

impl WaiterTask {
	pub fn new(ty: Arc<dyn NotificationType>, waiter: Box<dyn UpdateWaiter>) -> Self {
		Self {
			ty,
			waiter: Some(waiter),
			shared: Arc::new(WaiterShared::default()),
			backoff: DEFAULT_BACKOFF,
			stop_flag: Arc::new(AtomicBool::new(false)),
			stop_notify: Arc::new(Notify::new()),
			task: None,
		}
	}

	pub fn with_backoff(mut self, backoff: Duration) -> Self {
		self.backoff = backoff;
		self
	}

	pub fn ty(&self) -> Arc<dyn NotificationType> {
		self.ty.clone()
	}

	pub fn name(&self) -> &str {
		self.ty.name()
	}

	pub fn current_state(&self) -> Value {
		self.shared.current.lock().unwrap().clone()
	}

	pub fn set_update_handler(&self, handler: UpdateHandler) {
		*self.shared.handler.lock().unwrap() = Some(handler);
	}

	pub fn clear_update_handler(&self) {
		self.shared.handler.lock().unwrap().take();
	}

	/// Starts the polling loop.  Panics when it is already running.
	pub fn start(&mut self) {
		assert!(self.task.is_none(), "waiter task is already running");
		info!(ty = self.name(), "starting waiter task");

		*self.shared.current.lock().unwrap() = Value::Null;
		self.stop_flag.store(false, Ordering::Relaxed);

		let waiter = self.waiter.take().expect("waiter is present while stopped");
		self.task = Some(spawn_in_span(run_loop(
			self.ty.clone(),
			waiter,
			self.shared.clone(),
			self.backoff,
			self.stop_flag.clone(),
			self.stop_notify.clone(),
		)));
	}

	/// Requests the loop to stop and waits for it.  The loop is never
	/// preempted mid-poll; a running long-poll finishes first.
	pub async fn stop(&mut self) {
		let Some(task) = self.task.take() else {
			return;
		};
		info!(ty = self.name(), "stopping waiter task");

		self.stop_flag.store(true, Ordering::Relaxed);
		self.stop_notify.notify_waiters();
		match task.await {
			Ok(waiter) => self.waiter = Some(waiter),
			Err(error) => warn!(ty = self.name(), "waiter task failed: {error}"),
		}
	}
}

async fn run_loop(
	ty: Arc<dyn NotificationType>,
	mut waiter: Box<dyn UpdateWaiter>,
	shared: Arc<WaiterShared>,
	backoff: Duration,
	stop_flag: Arc<AtomicBool>,
	stop_notify: Arc<Notify>,
) -> Box<dyn UpdateWaiter> {
	while !stop_flag.load(Ordering::Relaxed) {
		let started = Instant::now();
		let state = match waiter.wait_for_update().await {
			Err(error) => {
				warn!(ty = ty.name(), "long-poll failed: {error}");
				let elapsed = started.elapsed();
				if elapsed < backoff {
					tokio::select! {
						_ = tokio::time::sleep(backoff - elapsed) => {},
						_ = stop_notify.notified() => {},
					}
				}
				continue;
			},
			Ok(None) => continue,
			Ok(Some(state)) if state.is_null() => continue,
			Ok(Some(state)) => state,
		};

		let new_id = ty.extract_state_id(&state);
		let handler = {
			let mut current = shared.current.lock().unwrap();
			if !current.is_null() && ty.extract_state_id(&current) == new_id {
				continue;
			}
			debug!(ty = ty.name(), ?new_id, "new state id");
			*current = state.clone();
			shared.handler.lock().unwrap().clone()
		};

		// the handler publishes and may block; no lock is held here
		if let Some(handler) = handler {
			handler(&state);
		}
	}

	waiter
}

/// Update source long-polling a backend JSON-RPC method, passing the
/// type's always-block id so the backend call itself never short-circuits.
pub struct RpcUpdateWaiter {
	client: reqwest::Client,
	url: String,
	method: String,
	params: Value,
}

impl RpcUpdateWaiter {
	pub fn new(url: impl Into<String>, method: impl Into<String>, always_block: Value) -> Self {
		Self {
			client: reqwest::Client::new(),
			url: url.into(),
			method: method.into(),
			params: json!([always_block]),
		}
	}
}

#[async_trait]
impl UpdateWaiter for RpcUpdateWaiter {
	async fn wait_for_update(&mut self) -> Result<Option<Value>> {
		debug!(method = self.method, "calling backend waiter RPC");
		let result = backend::http_call(&self.client, &self.url, &self.method, &self.params)
			.await
			.map_err(|error| eyre!("long-polling call returned error: {error}"))?;
		Ok(if result.is_null() { None } else { Some(result) })
	}
}
