//! Cooperative shutdown propagation for the tasks making up a server or
//! client process.
//!
//! A [`Controller`] is cloned into every long-running task.  Any holder may
//! trigger shutdown exactly once with a reason; futures wrapped in
//! [`Controller::with_cancel`] resolve early with that reason.  Tasks that
//! need to finish work before the process exits hold a [`DelayToken`]; the
//! [`Completed`](completed::Completed) future resolves only once a reason
//! is set and every token has been dropped.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use color_eyre::{eyre::eyre, Result};

mod completed;
pub mod utils;

pub use completed::Completed;

pub(crate) struct ControllerInner<T: Clone> {
	/// Reason for the shutdown, set exactly once.
	pub reason: Option<T>,
	/// Number of live delay tokens holding off completion.
	pub delay_tokens: usize,
	/// Wakers of futures waiting for the trigger.
	pub on_triggered: Vec<Waker>,
	/// Wakers of futures waiting for full completion.
	pub on_shutdown_complete: Vec<Waker>,
}

/// Shared handle controlling and observing shutdown of a set of tasks.
pub struct Controller<T: Clone> {
	inner: Arc<Mutex<ControllerInner<T>>>,
}

impl<T: Clone> Clone for Controller<T> {
	fn clone(&self) -> Self {
		Self {
			inner: self.inner.clone(),
		}
	}
}

impl<T: Clone> Default for Controller<T> {
	fn default() -> Self {
		Self::new()
	}
}

impl<T: Clone> Controller<T> {
	pub fn new() -> Self {
		Self {
			inner: Arc::new(Mutex::new(ControllerInner {
				reason: None,
				delay_tokens: 0,
				on_triggered: Vec::new(),
				on_shutdown_complete: Vec::new(),
			})),
		}
	}

	/// Triggers the shutdown with the given reason.  Fails if a shutdown
	/// has already been triggered; the first reason wins.
	pub fn trigger_shutdown(&self, reason: T) -> Result<()> {
		let mut inner = self.inner.lock().unwrap();
		if inner.reason.is_some() {
			return Err(eyre!("shutdown has already been triggered"));
		}
		inner.reason = Some(reason);
		for waker in inner.on_triggered.drain(..) {
			waker.wake();
		}
		if inner.delay_tokens == 0 {
			for waker in inner.on_shutdown_complete.drain(..) {
				waker.wake();
			}
		}
		Ok(())
	}

	pub fn is_triggered(&self) -> bool {
		self.inner.lock().unwrap().reason.is_some()
	}

	/// Future that resolves with the reason once shutdown is triggered.
	pub fn triggered_shutdown(&self) -> Triggered<T> {
		Triggered {
			inner: self.inner.clone(),
		}
	}

	/// Future that resolves once shutdown is triggered and all delay
	/// tokens have been dropped.
	pub fn completed_shutdown(&self) -> Completed<T> {
		Completed {
			inner: self.inner.clone(),
		}
	}

	/// Hands out a token that delays completion of the shutdown until it
	/// is dropped.
	pub fn delay_token(&self) -> DelayToken<T> {
		let mut inner = self.inner.lock().unwrap();
		inner.delay_tokens += 1;
		DelayToken {
			inner: self.inner.clone(),
		}
	}

	/// Runs the given future until it resolves or shutdown is triggered,
	/// whichever comes first.  Returns the shutdown reason in the error
	/// case.
	pub async fn with_cancel<F: Future>(&self, future: F) -> Result<F::Output, T> {
		tokio::select! {
			reason = self.triggered_shutdown() => Err(reason),
			output = future => Ok(output),
		}
	}
}

/// See [`Controller::triggered_shutdown`].
pub struct Triggered<T: Clone> {
	inner: Arc<Mutex<ControllerInner<T>>>,
}

impl<T: Clone> Future for Triggered<T> {
	type Output = T;

	fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		let mut inner = self.inner.lock().unwrap();
		if let Some(reason) = inner.reason.as_ref() {
			return Poll::Ready(reason.clone());
		}
		inner.on_triggered.push(cx.waker().clone());
		Poll::Pending
	}
}

/// Token whose existence delays completion of the shutdown.
pub struct DelayToken<T: Clone> {
	inner: Arc<Mutex<ControllerInner<T>>>,
}

impl<T: Clone> Clone for DelayToken<T> {
	fn clone(&self) -> Self {
		self.inner.lock().unwrap().delay_tokens += 1;
		Self {
			inner: self.inner.clone(),
		}
	}
}

impl<T: Clone> Drop for DelayToken<T> {
	fn drop(&mut self) {
		let mut inner = self.inner.lock().unwrap();
		inner.delay_tokens -= 1;
		if inner.delay_tokens == 0 && inner.reason.is_some() {
			for waker in inner.on_shutdown_complete.drain(..) {
				waker.wake();
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::time::Duration;

	#[tokio::test]
	async fn trigger_is_once() {
		let controller = Controller::<String>::new();
		assert!(controller.trigger_shutdown("first".to_string()).is_ok());
		assert!(controller.trigger_shutdown("second".to_string()).is_err());
		assert_eq!(controller.triggered_shutdown().await, "first");
	}

	#[tokio::test]
	async fn with_cancel_resolves_early() {
		let controller = Controller::<String>::new();
		let cancelled = controller.clone();
		tokio::spawn(async move {
			tokio::time::sleep(Duration::from_millis(10)).await;
			let _ = cancelled.trigger_shutdown("stop".to_string());
		});
		let result = controller
			.with_cancel(tokio::time::sleep(Duration::from_secs(60)))
			.await;
		assert_eq!(result.unwrap_err(), "stop");
	}

	#[tokio::test]
	async fn completion_waits_for_delay_tokens() {
		let controller = Controller::<String>::new();
		let token = controller.delay_token();
		controller.trigger_shutdown("done".to_string()).unwrap();

		let completed = controller.completed_shutdown();
		tokio::spawn(async move {
			tokio::time::sleep(Duration::from_millis(10)).await;
			drop(token);
		});
		assert_eq!(completed.await, "done");
	}
}
