//! Notification types and the client-side known state per type.
//!
//! A notification type names a stream of backend state updates and knows
//! how to project a full state value onto a comparable state id.  The
//! server runs one waiter task per type (see [`crate::waiter`]); the
//! client keeps one [`NotificationState`] record per type, fed from the
//! pub/sub subscription and drained through gated, bounded waits.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::messaging::Tag;
use crate::wire::stanzas::{find_extension, NotificationUpdate};

/// Upper bound on a single wait, so that callers periodically return even
/// when no update arrives.
pub const WAIT_BOUND: Duration = Duration::from_secs(5);

/// The interface of one notification stream: its name, the projection of
/// full states onto comparable ids, and the sentinel id that forces a
/// caller to block.
pub trait NotificationType: Send + Sync + 'static {
	fn name(&self) -> &str;

	/// Projects a full state value onto the id that identifies its
	/// "version".  Must be a pure function of its input.
	fn extract_state_id(&self, full_state: &Value) -> Value;

	/// The id value a caller passes to signal "no known state": waits
	/// with this id always block until the next update.
	fn always_block_id(&self) -> Value;
}

/// Game-state updates keyed by the state value itself (a block-hash
/// string).
pub struct StateChange;

impl NotificationType for StateChange {
	fn name(&self) -> &str {
		"state"
	}

	fn extract_state_id(&self, full_state: &Value) -> Value {
		full_state.clone()
	}

	fn always_block_id(&self) -> Value {
		Value::Null
	}
}

/// Pending-move updates keyed by their version counter.
pub struct PendingChange;

impl NotificationType for PendingChange {
	fn name(&self) -> &str {
		"pending"
	}

	fn extract_state_id(&self, full_state: &Value) -> Value {
		full_state["version"].clone()
	}

	fn always_block_id(&self) -> Value {
		Value::Null
	}
}

/// Client-side record of the latest known state of one notification type.
pub struct NotificationState {
	ty: Arc<dyn NotificationType>,
	/// Latest full state; `Null` while nothing has been received.
	current: Mutex<Value>,
	notify: Notify,
}

impl NotificationState {
	pub fn new(ty: Arc<dyn NotificationType>) -> Arc<Self> {
		Arc::new(Self {
			ty,
			current: Mutex::new(Value::Null),
			notify: Notify::new(),
		})
	}

	pub fn name(&self) -> &str {
		self.ty.name()
	}

	pub fn current(&self) -> Value {
		self.current.lock().unwrap().clone()
	}

	fn ready_state(&self, known: &Value) -> Option<Value> {
		let current = self.current.lock().unwrap();
		if !current.is_null()
			&& *known != self.ty.always_block_id()
			&& *known != self.ty.extract_state_id(&current)
		{
			return Some(current.clone());
		}
		None
	}

	/// Returns the current state right away if it differs from the
	/// caller's known id (and that id is not the always-block sentinel);
	/// otherwise waits for the next update, bounded by [`WAIT_BOUND`].
	/// The result may still equal the known state, or be `Null` if no
	/// update was ever received.
	pub async fn wait_for_change(&self, known: &Value) -> Value {
		if let Some(state) = self.ready_state(known) {
			return state;
		}

		let notified = self.notify.notified();
		tokio::pin!(notified);
		notified.as_mut().enable();

		// an update may have raced the arming of the waiter
		if let Some(state) = self.ready_state(known) {
			return state;
		}

		let _ = tokio::time::timeout(WAIT_BOUND, notified).await;
		self.current()
	}

	/// Feeds one received pub/sub item into the record.  Items that are
	/// not valid updates, carry the wrong type or a null state are
	/// dropped.
	pub fn on_item(&self, tag: &Tag) {
		let Some(update) = find_extension::<NotificationUpdate>(std::slice::from_ref(tag)) else {
			warn!(ty = self.name(), "dropping invalid notification item");
			return;
		};
		if update.ty != self.name() {
			warn!(
				expected = self.name(),
				got = update.ty,
				"dropping update of the wrong type",
			);
			return;
		}
		if update.state.is_null() {
			warn!(ty = self.name(), "dropping update with null state");
			return;
		}

		debug!(ty = self.name(), "new notification state");
		*self.current.lock().unwrap() = update.state;
		self.notify.notify_waiters();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::wire::stanzas::Extension;
	use serde_json::json;

	/// Test notification over `{"id": .., "value": ..}` states, keyed by
	/// the id field and blocking forever on a designated sentinel.
	pub struct IdValueNotification {
		name: String,
	}

	impl IdValueNotification {
		pub fn new(name: &str) -> Arc<dyn NotificationType> {
			Arc::new(Self {
				name: name.to_string(),
			})
		}
	}

	impl NotificationType for IdValueNotification {
		fn name(&self) -> &str {
			&self.name
		}

		fn extract_state_id(&self, full_state: &Value) -> Value {
			full_state["id"].clone()
		}

		fn always_block_id(&self) -> Value {
			json!("always block")
		}
	}

	fn update_tag(ty: &str, state: Value) -> Tag {
		NotificationUpdate::new(ty, state).to_tag()
	}

	fn state(id: &str, value: &str) -> Value {
		json!({"id": id, "value": value})
	}

	#[tokio::test(start_paused = true)]
	async fn wait_blocks_without_state() {
		let record = NotificationState::new(IdValueNotification::new("foo"));
		// no state yet: the bounded wait elapses and yields null
		let result = record.wait_for_change(&json!("")).await;
		assert_eq!(result, Value::Null);
	}

	#[tokio::test]
	async fn update_unblocks_waiters() {
		let record = NotificationState::new(IdValueNotification::new("foo"));
		let waiter = {
			let record = record.clone();
			tokio::spawn(async move { record.wait_for_change(&json!("")).await })
		};
		tokio::task::yield_now().await;
		record.on_item(&update_tag("foo", state("a", "first")));
		assert_eq!(waiter.await.unwrap(), state("a", "first"));
	}

	#[tokio::test]
	async fn known_other_id_returns_immediately() {
		let record = NotificationState::new(IdValueNotification::new("foo"));
		record.on_item(&update_tag("foo", state("a", "first")));
		let result = record.wait_for_change(&json!("x")).await;
		assert_eq!(result, state("a", "first"));
	}

	#[tokio::test(start_paused = true)]
	async fn matching_id_blocks_until_update() {
		let record = NotificationState::new(IdValueNotification::new("foo"));
		record.on_item(&update_tag("foo", state("a", "first")));
		// the caller already knows state "a": the wait times out unchanged
		let result = record.wait_for_change(&json!("a")).await;
		assert_eq!(result, state("a", "first"));
	}

	#[tokio::test(start_paused = true)]
	async fn sentinel_always_blocks() {
		let record = NotificationState::new(IdValueNotification::new("foo"));
		record.on_item(&update_tag("foo", state("a", "first")));
		let result = record.wait_for_change(&json!("always block")).await;
		// still the same state: only the bound ended the wait
		assert_eq!(result, state("a", "first"));
	}

	#[tokio::test]
	async fn invalid_items_are_dropped() {
		let record = NotificationState::new(IdValueNotification::new("foo"));
		record.on_item(&update_tag("foo", state("a", "first")));

		// wrong type
		record.on_item(&update_tag("bar", state("b", "second")));
		assert_eq!(record.current(), state("a", "first"));

		// null state never clears the known value
		record.on_item(&update_tag("foo", Value::Null));
		assert_eq!(record.current(), state("a", "first"));

		// not an update tag at all
		record.on_item(&Tag::new("bogus"));
		assert_eq!(record.current(), state("a", "first"));
	}
}
