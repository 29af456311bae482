use std::error::Error;

/// Resolves when the OS asks the process to stop (SIGINT, and SIGTERM on
/// unix). Feed this to [`axum::serve`]'s graceful shutdown.
pub async fn shutdown_signal()
{
	let ctrl_c = async {
		if let Err(err) = tokio::signal::ctrl_c().await {
			tracing::error!(error = &err as &dyn Error, "failed listening for SIGINT");
			std::future::pending::<()>().await;
		}
	};

	tokio::select! {
		() = ctrl_c => tracing::debug!("received SIGINT"),
		() = sigterm() => tracing::debug!("received SIGTERM"),
	}
}

#[cfg(unix)]
async fn sigterm()
{
	use tokio::signal::unix::{SignalKind, signal};

	match signal(SignalKind::terminate()) {
		Ok(mut stream) => {
			stream.recv().await;
		}
		Err(err) => {
			tracing::error!(error = &err as &dyn Error, "failed listening for SIGTERM");
			std::future::pending::<()>().await;
		}
	}
}

#[cfg(not(unix))]
async fn sigterm()
{
	std::future::pending().await
}
