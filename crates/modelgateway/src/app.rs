//! Process wiring: registry, dispatcher, background tasks, the HTTP server
//! and the drain/shutdown sequence.

use gateway_core::signal;
use tokio_util::sync::CancellationToken;

use crate::dispatch::Dispatcher;
use crate::idempotency::MemoryIdempotencyStore;
use crate::ratelimit::RateLimiter;
use crate::server::AppState;
use crate::store::Registry;
use crate::telemetry::metrics::Metrics;
use crate::*;

pub async fn run(cfg: Config) -> anyhow::Result<()> {
	let registry = Arc::new(Registry::new(&cfg)?);

	let mut prometheus = prometheus_client::registry::Registry::default();
	let metrics = Arc::new(Metrics::new(gateway_core::metrics::sub_registry(
		&mut prometheus,
	)));

	let limiter = Arc::new(RateLimiter::new(cfg.limits.clone()));
	let dispatcher = Arc::new(Dispatcher::new(
		registry.clone(),
		limiter.clone(),
		metrics.clone(),
		cfg.coupler,
	));
	let idempotency = Arc::new(MemoryIdempotencyStore::new(cfg.idempotency_window));
	let root_cancel = CancellationToken::new();

	let state = AppState {
		dispatcher: dispatcher.clone(),
		registry: registry.clone(),
		idempotency: idempotency.clone(),
		prometheus: Arc::new(parking_lot::Mutex::new(prometheus)),
		root_cancel: root_cancel.clone(),
	};

	spawn_prober(registry.clone(), cfg.probe_interval, root_cancel.clone());
	spawn_gc(limiter, idempotency, root_cancel.clone());

	let listener = tokio::net::TcpListener::bind(cfg.listen)
		.await
		.with_context(|| format!("bind {}", cfg.listen))?;
	info!(address = %cfg.listen, "modelgateway listening");

	let graceful = {
		let dispatcher = dispatcher.clone();
		let root_cancel = root_cancel.clone();
		let deadline = cfg.drain_deadline;
		async move {
			signal::shutdown().await;
			info!("shutdown requested, draining");
			dispatcher.start_draining();
			if tokio::time::timeout(deadline, dispatcher.active.wait_idle())
				.await
				.is_err()
			{
				warn!(
					active = dispatcher.active.count(),
					"drain deadline exceeded, force-cancelling remaining requests"
				);
			}
			root_cancel.cancel();
		}
	};

	axum::serve(listener, server::router(state))
		.with_graceful_shutdown(graceful)
		.await
		.context("serve")?;
	info!("server stopped");
	Ok(())
}

/// Periodically probe every enabled provider and feed the health tracker, so
/// unused providers still converge toward an accurate status.
fn spawn_prober(registry: Arc<Registry>, interval: Duration, cancel: CancellationToken) {
	tokio::spawn(async move {
		let mut tick = tokio::time::interval(interval);
		tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
		// The immediate first tick would probe before startup settles.
		tick.tick().await;
		loop {
			tokio::select! {
				_ = cancel.cancelled() => break,
				_ = tick.tick() => {
					let snapshot = registry.snapshot();
					for handle in snapshot.providers.iter().filter(|p| p.descriptor.enabled) {
						let (ok, latency) = handle.client.probe().await;
						trace!(provider = %handle.name(), ok, ?latency, "probe");
						handle.health.record(ok, latency);
					}
				},
			}
		}
	});
}

fn spawn_gc(
	limiter: Arc<RateLimiter>,
	idempotency: Arc<MemoryIdempotencyStore>,
	cancel: CancellationToken,
) {
	tokio::spawn(async move {
		let mut tick = tokio::time::interval(Duration::from_secs(60));
		tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
		loop {
			tokio::select! {
				_ = cancel.cancelled() => break,
				_ = tick.tick() => {
					let now = Instant::now();
					limiter.gc(now);
					idempotency.gc(now);
				},
			}
		}
	});
}
