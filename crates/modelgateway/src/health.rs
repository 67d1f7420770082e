//! Rolling per-provider health: a window of recent outcomes plus latency
//! percentiles. Writers take a short per-provider lock; readers get a
//! wait-free snapshot through an atomically swapped Arc.

use std::collections::VecDeque;

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use crate::*;

pub const DEFAULT_WINDOW: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
	Healthy,
	Degraded,
	Unhealthy,
	Unknown,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct HealthSnapshot {
	pub success_rate: f64,
	#[serde(serialize_with = "ser_millis")]
	pub p50: Duration,
	#[serde(serialize_with = "ser_millis")]
	pub p95: Duration,
	#[serde(serialize_with = "ser_millis")]
	pub p99: Duration,
	pub samples: usize,
	pub status: HealthStatus,
}

fn ser_millis<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
	s.serialize_u64(d.as_millis() as u64)
}

impl HealthSnapshot {
	fn unknown() -> HealthSnapshot {
		HealthSnapshot {
			success_rate: 1.0,
			p50: Duration::ZERO,
			p95: Duration::ZERO,
			p99: Duration::ZERO,
			samples: 0,
			status: HealthStatus::Unknown,
		}
	}
}

struct Ring {
	events: VecDeque<(bool, Duration)>,
	/// Scratch buffer reused across percentile recomputes.
	sorted: Vec<Duration>,
}

pub struct HealthTracker {
	window: usize,
	latency_target: Duration,
	inner: Mutex<Ring>,
	snapshot: ArcSwap<HealthSnapshot>,
}

/// Fewer samples than this and we refuse to judge the provider.
const MIN_SAMPLES: usize = 8;

impl HealthTracker {
	pub fn new(latency_target: Duration) -> HealthTracker {
		HealthTracker::with_window(DEFAULT_WINDOW, latency_target)
	}

	pub fn with_window(window: usize, latency_target: Duration) -> HealthTracker {
		HealthTracker {
			window,
			latency_target,
			inner: Mutex::new(Ring {
				events: VecDeque::with_capacity(window),
				sorted: Vec::with_capacity(window),
			}),
			snapshot: ArcSwap::from_pointee(HealthSnapshot::unknown()),
		}
	}

	pub fn record(&self, success: bool, latency: Duration) {
		let snap = {
			let mut ring = self.inner.lock();
			if ring.events.len() == self.window {
				ring.events.pop_front();
			}
			ring.events.push_back((success, latency));
			self.recompute(&mut ring)
		};
		self.snapshot.store(Arc::new(snap));
	}

	/// Wait-free: loads the last published snapshot.
	pub fn snapshot(&self) -> Arc<HealthSnapshot> {
		self.snapshot.load_full()
	}

	pub fn status(&self) -> HealthStatus {
		self.snapshot.load().status
	}

	fn recompute(&self, ring: &mut Ring) -> HealthSnapshot {
		let samples = ring.events.len();
		if samples < MIN_SAMPLES {
			return HealthSnapshot {
				samples,
				..HealthSnapshot::unknown()
			};
		}
		let successes = ring.events.iter().filter(|(ok, _)| *ok).count();
		let success_rate = successes as f64 / samples as f64;

		ring.sorted.clear();
		ring.sorted.extend(ring.events.iter().map(|(_, l)| *l));
		ring.sorted.sort_unstable();
		let pct = |q: f64| -> Duration {
			let idx = ((ring.sorted.len() as f64 - 1.0) * q) as usize;
			ring.sorted[idx]
		};
		let (p50, p95, p99) = (pct(0.50), pct(0.95), pct(0.99));

		let target = self.latency_target;
		let status = if success_rate >= 0.98 && p95 < 2 * target {
			HealthStatus::Healthy
		} else if success_rate >= 0.90 && p95 < 5 * target {
			HealthStatus::Degraded
		} else {
			HealthStatus::Unhealthy
		};

		HealthSnapshot {
			success_rate,
			p50,
			p95,
			p99,
			samples,
			status,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn tracker() -> HealthTracker {
		HealthTracker::new(Duration::from_secs(2))
	}

	fn record_n(t: &HealthTracker, n: usize, success: bool, latency: Duration) {
		for _ in 0..n {
			t.record(success, latency);
		}
	}

	#[test]
	fn unknown_until_enough_samples() {
		let t = tracker();
		record_n(&t, 7, true, Duration::from_millis(100));
		assert_eq!(t.status(), HealthStatus::Unknown);
		t.record(true, Duration::from_millis(100));
		assert_eq!(t.status(), HealthStatus::Healthy);
	}

	#[test]
	fn degraded_on_success_rate() {
		let t = tracker();
		record_n(&t, 95, true, Duration::from_millis(100));
		record_n(&t, 5, false, Duration::from_millis(100));
		let snap = t.snapshot();
		assert_eq!(snap.status, HealthStatus::Degraded);
		assert!((snap.success_rate - 0.95).abs() < 1e-9);
	}

	#[test]
	fn unhealthy_on_success_rate() {
		let t = tracker();
		record_n(&t, 80, true, Duration::from_millis(100));
		record_n(&t, 20, false, Duration::from_millis(100));
		assert_eq!(t.status(), HealthStatus::Unhealthy);
	}

	#[test]
	fn latency_thresholds_scale_with_target() {
		// Healthy requires p95 < 2x target.
		let t = tracker();
		record_n(&t, 100, true, Duration::from_secs(5));
		assert_eq!(t.status(), HealthStatus::Degraded);

		let t = tracker();
		record_n(&t, 100, true, Duration::from_secs(11));
		assert_eq!(t.status(), HealthStatus::Unhealthy);
	}

	#[test]
	fn percentiles_from_window() {
		let t = HealthTracker::with_window(100, Duration::from_secs(2));
		for i in 1..=100u64 {
			t.record(true, Duration::from_millis(i));
		}
		let snap = t.snapshot();
		assert_eq!(snap.p50, Duration::from_millis(50));
		assert_eq!(snap.p95, Duration::from_millis(95));
		assert_eq!(snap.p99, Duration::from_millis(99));
	}

	#[test]
	fn window_evicts_old_events() {
		let t = HealthTracker::with_window(10, Duration::from_secs(2));
		record_n(&t, 10, false, Duration::from_millis(10));
		assert_eq!(t.status(), HealthStatus::Unhealthy);
		// Ten fresh successes push every failure out of the window.
		record_n(&t, 10, true, Duration::from_millis(10));
		assert_eq!(t.status(), HealthStatus::Healthy);
	}
}
