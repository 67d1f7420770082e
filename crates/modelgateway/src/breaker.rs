//! Per-provider circuit breaker. State is a tagged atomic updated by
//! compare-and-swap; counters are independent atomics. No lock is ever held,
//! and no operation suspends.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

use crate::types::provider::BreakerConfig;
use crate::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BreakerState {
	Closed = 0,
	Open = 1,
	HalfOpen = 2,
}

impl BreakerState {
	fn from_u8(v: u8) -> BreakerState {
		match v {
			0 => BreakerState::Closed,
			1 => BreakerState::Open,
			_ => BreakerState::HalfOpen,
		}
	}

	pub fn as_str(&self) -> &'static str {
		match self {
			BreakerState::Closed => "closed",
			BreakerState::Open => "open",
			BreakerState::HalfOpen => "half_open",
		}
	}
}

/// The result of asking the breaker for permission to call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
	Permit,
	Denied { retry_after: Duration },
}

impl Decision {
	pub fn is_permit(&self) -> bool {
		matches!(self, Decision::Permit)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
	Success,
	Failure,
}

/// A state transition observed by `record`/`allow`, for logging and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
	pub from: BreakerState,
	pub to: BreakerState,
}

#[derive(Debug)]
pub struct CircuitBreaker {
	cfg: BreakerConfig,
	state: AtomicU8,
	consecutive_failures: AtomicU32,
	consecutive_successes: AtomicU32,
	half_open_inflight: AtomicU32,
	/// Millis since `birth` at which the breaker last opened.
	opened_at_ms: AtomicU64,
	/// How many times the breaker has opened without a full recovery;
	/// drives the exponential cooldown.
	open_count: AtomicU32,
	birth: Instant,
}

impl CircuitBreaker {
	pub fn new(cfg: BreakerConfig) -> CircuitBreaker {
		CircuitBreaker {
			cfg,
			state: AtomicU8::new(BreakerState::Closed as u8),
			consecutive_failures: AtomicU32::new(0),
			consecutive_successes: AtomicU32::new(0),
			half_open_inflight: AtomicU32::new(0),
			opened_at_ms: AtomicU64::new(0),
			open_count: AtomicU32::new(0),
			birth: Instant::now(),
		}
	}

	pub fn state(&self) -> BreakerState {
		BreakerState::from_u8(self.state.load(Ordering::Acquire))
	}

	pub fn consecutive_failures(&self) -> u32 {
		self.consecutive_failures.load(Ordering::Relaxed)
	}

	pub fn consecutive_successes(&self) -> u32 {
		self.consecutive_successes.load(Ordering::Relaxed)
	}

	/// The cooldown currently in force: doubles on every re-open, capped.
	fn cooldown(&self) -> Duration {
		let opens = self.open_count.load(Ordering::Relaxed).max(1);
		let factor = 1u64 << (opens - 1).min(20);
		(self.cfg.cooldown * factor as u32).min(self.cfg.max_cooldown)
	}

	fn ms_since_birth(&self, now: Instant) -> u64 {
		now.saturating_duration_since(self.birth).as_millis() as u64
	}

	/// Read-only check used by routing: has an open breaker's cooldown
	/// passed? Never transitions state.
	pub fn cooldown_elapsed(&self, now: Instant) -> bool {
		let opened_at = self.opened_at_ms.load(Ordering::Acquire);
		let elapsed = self.ms_since_birth(now).saturating_sub(opened_at);
		elapsed >= self.cooldown().as_millis() as u64
	}

	/// Ask for permission to dispatch one call. Atomic and non-blocking.
	pub fn allow(&self, now: Instant) -> Decision {
		loop {
			match self.state() {
				BreakerState::Closed => return Decision::Permit,
				BreakerState::Open => {
					let opened_at = self.opened_at_ms.load(Ordering::Acquire);
					let elapsed = self.ms_since_birth(now).saturating_sub(opened_at);
					let cooldown = self.cooldown();
					if elapsed < cooldown.as_millis() as u64 {
						return Decision::Denied {
							retry_after: cooldown - Duration::from_millis(elapsed),
						};
					}
					// Cooldown elapsed: move to half-open and admit this call
					// as the first probe. The probe counter was zeroed when
					// the breaker opened, so it is consistent for any thread
					// that observes the new state.
					if self
						.state
						.compare_exchange(
							BreakerState::Open as u8,
							BreakerState::HalfOpen as u8,
							Ordering::AcqRel,
							Ordering::Acquire,
						)
						.is_ok()
					{
						self.half_open_inflight.fetch_add(1, Ordering::AcqRel);
						return Decision::Permit;
					}
					// Lost the race; re-evaluate under the new state.
				},
				BreakerState::HalfOpen => {
					let admitted = self
						.half_open_inflight
						.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
							(n < self.cfg.half_open_max).then_some(n + 1)
						})
						.is_ok();
					return if admitted {
						Decision::Permit
					} else {
						Decision::Denied {
							retry_after: self.cfg.cooldown,
						}
					};
				},
			}
		}
	}

	/// Record the outcome of a permitted call. Runs the transition test on
	/// the same call, per the state machine:
	///
	/// ```text
	/// Closed   --consec_failures >= F-->  Open
	/// Open     --elapsed >= cooldown-->   HalfOpen   (in allow)
	/// HalfOpen --consec_successes >= S--> Closed
	/// HalfOpen --any failure-->           Open (cooldown reset)
	/// ```
	pub fn record(&self, outcome: Outcome, now: Instant) -> Option<Transition> {
		let state = self.state();
		if state == BreakerState::HalfOpen {
			// A probe completed.
			let _ = self
				.half_open_inflight
				.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
		}
		match outcome {
			Outcome::Success => {
				self.consecutive_failures.store(0, Ordering::Relaxed);
				let successes = self.consecutive_successes.fetch_add(1, Ordering::AcqRel) + 1;
				if state == BreakerState::HalfOpen
					&& successes >= self.cfg.success_threshold
					&& self
						.state
						.compare_exchange(
							BreakerState::HalfOpen as u8,
							BreakerState::Closed as u8,
							Ordering::AcqRel,
							Ordering::Acquire,
						)
						.is_ok()
				{
					self.open_count.store(0, Ordering::Relaxed);
					self.consecutive_successes.store(0, Ordering::Relaxed);
					return Some(Transition {
						from: BreakerState::HalfOpen,
						to: BreakerState::Closed,
					});
				}
				None
			},
			Outcome::Failure => {
				self.consecutive_successes.store(0, Ordering::Relaxed);
				let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
				let should_open = match state {
					BreakerState::Closed => failures >= self.cfg.failure_threshold,
					// Any half-open failure re-opens immediately.
					BreakerState::HalfOpen => true,
					BreakerState::Open => false,
				};
				if should_open
					&& self
						.state
						.compare_exchange(
							state as u8,
							BreakerState::Open as u8,
							Ordering::AcqRel,
							Ordering::Acquire,
						)
						.is_ok()
				{
					self
						.opened_at_ms
						.store(self.ms_since_birth(now), Ordering::Release);
					self.open_count.fetch_add(1, Ordering::AcqRel);
					self.consecutive_successes.store(0, Ordering::Relaxed);
					self.half_open_inflight.store(0, Ordering::Release);
					return Some(Transition {
						from: state,
						to: BreakerState::Open,
					});
				}
				None
			},
		}
	}
}
