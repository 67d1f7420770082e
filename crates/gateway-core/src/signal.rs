//! Termination signals. The gateway has exactly one consumer: the drain
//! sequence, which wants a single future that resolves when the process has
//! been asked to stop.

/// Resolves on SIGINT or SIGTERM (ctrl-c on non-unix platforms). The caller
/// stops admitting work and starts draining when this returns.
pub async fn shutdown() {
	imp::wait().await
}

#[cfg(unix)]
mod imp {
	use tokio::signal::unix::{SignalKind, signal};
	use tracing::info;

	pub(super) async fn wait() {
		let mut interrupt =
			signal(SignalKind::interrupt()).expect("failed to register SIGINT handler");
		let mut terminate =
			signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
		tokio::select! {
			_ = interrupt.recv() => info!("received SIGINT, starting shutdown"),
			_ = terminate.recv() => info!("received SIGTERM, starting shutdown"),
		}
	}
}

#[cfg(not(unix))]
mod imp {
	use tracing::info;

	pub(super) async fn wait() {
		tokio::signal::ctrl_c()
			.await
			.expect("failed to register ctrl-c handler");
		info!("received ctrl-c, starting shutdown");
	}
}
