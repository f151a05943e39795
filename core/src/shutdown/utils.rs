/// Returns a [`Future`](std::future::Future) that completes upon receiving
/// any of the default termination signals.
///
/// On Unix these are Ctrl-C (SIGINT) and SIGTERM; on other platforms only
/// Ctrl-C is handled.
pub async fn user_signal() {
	let ctrl_c = tokio::signal::ctrl_c();
	#[cfg(unix)]
	{
		let term = async {
			let mut os_sig =
				tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
			os_sig.recv().await;
			std::io::Result::Ok(())
		};

		tokio::select! {
			_ = ctrl_c => {},
			_ = term => {},
		}
	}

	#[cfg(not(unix))]
	{
		let _ = ctrl_c.await;
	}
}
