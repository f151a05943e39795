use std::future::Future;
use std::pin::Pin;
use std::{
	sync::{Arc, Mutex},
	task::{Context, Poll},
};

use super::ControllerInner;

/// A future representing full completion of a triggered shutdown.
///
/// This future completes once a shutdown reason has been provided and all
/// delay tokens have been dropped.  Until then it remains pending,
/// registering the context's waker for notification when the last token
/// goes away.
pub struct Completed<T: Clone> {
	pub(super) inner: Arc<Mutex<ControllerInner<T>>>,
}

impl<T: Clone> Future for Completed<T> {
	type Output = T;

	fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		let mut inner = self.inner.lock().unwrap();
		// done only when all tokens are gone and a reason has been set
		if let (0, Some(reason)) = (inner.delay_tokens, inner.reason.as_ref()) {
			return Poll::Ready(reason.clone());
		}

		// always push a fresh waker, so we don't end up with stale ones
		inner.on_shutdown_complete.push(cx.waker().clone());
		Poll::Pending
	}
}
