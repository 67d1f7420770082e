//! Token-bucket rate limiting keyed by (scope, key). Tokens are fractional
//! and refill continuously; each bucket's arithmetic runs under its own
//! short-lived mutex, never across an await.

use parking_lot::Mutex;

use crate::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Scope {
	ApiKey,
	Tenant,
	Route,
}

impl Scope {
	pub fn as_str(&self) -> &'static str {
		match self {
			Scope::ApiKey => "api-key",
			Scope::Tenant => "tenant",
			Scope::Route => "route",
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RateLimitPolicy {
	pub scope: Scope,
	pub capacity: f64,
	/// Tokens per second.
	pub refill_rate: f64,
}

/// The keys a request is limited under, one per applicable scope.
#[derive(Debug, Clone)]
pub struct AdmissionKeys {
	pub api_key: Strng,
	pub tenant: Strng,
	pub route: Strng,
}

impl AdmissionKeys {
	fn for_scope(&self, scope: Scope) -> &Strng {
		match scope {
			Scope::ApiKey => &self.api_key,
			Scope::Tenant => &self.tenant,
			Scope::Route => &self.route,
		}
	}
}

/// A denial, carrying what the client needs to back off correctly.
#[derive(Debug, Clone, Copy)]
pub struct RateLimited {
	pub scope: Scope,
	pub retry_after: Duration,
	pub limit: u64,
	pub remaining: u64,
	pub reset: Duration,
}

/// Bucket occupancy reported back for the `X-RateLimit-*` response headers,
/// taken from the most-constrained admitted bucket.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdmissionSnapshot {
	pub limit: u64,
	pub remaining: u64,
	pub reset: Duration,
}

/// Ceil to whole seconds, first snapping to microsecond precision so that
/// binary float artifacts (1 / (10/60) being a hair over 6) do not inflate
/// the wait by a second.
fn ceil_secs(secs: f64) -> f64 {
	((secs * 1e6).round() / 1e6).ceil()
}

#[derive(Debug)]
struct BucketState {
	tokens: f64,
	last_refill: Instant,
}

#[derive(Debug)]
struct Bucket {
	capacity: f64,
	refill_rate: f64,
	state: Mutex<BucketState>,
}

impl Bucket {
	fn new(capacity: f64, refill_rate: f64, now: Instant) -> Bucket {
		Bucket {
			capacity,
			refill_rate,
			state: Mutex::new(BucketState {
				tokens: capacity,
				last_refill: now,
			}),
		}
	}

	fn refill(&self, state: &mut BucketState, now: Instant) {
		let elapsed = now.saturating_duration_since(state.last_refill);
		state.tokens =
			(state.tokens + elapsed.as_secs_f64() * self.refill_rate).min(self.capacity);
		state.last_refill = now;
	}

	/// Take one token; on denial, report how long until one accrues.
	fn try_acquire(&self, now: Instant) -> Result<AdmissionSnapshot, RateLimited> {
		let mut state = self.state.lock();
		self.refill(&mut state, now);
		if state.tokens >= 1.0 {
			state.tokens -= 1.0;
			Ok(self.snapshot_locked(&state))
		} else {
			let missing = 1.0 - state.tokens;
			let retry_after = Duration::from_secs_f64(ceil_secs(missing / self.refill_rate));
			let snap = self.snapshot_locked(&state);
			Err(RateLimited {
				// Scope is filled in by the limiter.
				scope: Scope::ApiKey,
				retry_after,
				limit: snap.limit,
				remaining: snap.remaining,
				reset: snap.reset,
			})
		}
	}

	/// Return a token taken by an admission that was later denied by a
	/// sibling bucket. Never exceeds capacity.
	fn refund(&self, now: Instant) {
		let mut state = self.state.lock();
		self.refill(&mut state, now);
		state.tokens = (state.tokens + 1.0).min(self.capacity);
	}

	fn snapshot_locked(&self, state: &BucketState) -> AdmissionSnapshot {
		let reset = if state.tokens >= self.capacity {
			Duration::ZERO
		} else {
			Duration::from_secs_f64(ceil_secs(
				(self.capacity - state.tokens) / self.refill_rate,
			))
		};
		AdmissionSnapshot {
			limit: self.capacity as u64,
			remaining: state.tokens as u64,
			reset,
		}
	}

	fn idle_for(&self, now: Instant) -> Duration {
		let state = self.state.lock();
		now.saturating_duration_since(state.last_refill)
	}

	/// A bucket that has sat idle long enough to refill completely carries no
	/// state worth keeping.
	fn full_window(&self) -> Duration {
		Duration::from_secs_f64((self.capacity / self.refill_rate).max(1.0))
	}
}

#[derive(Debug)]
pub struct RateLimiter {
	policies: Vec<RateLimitPolicy>,
	buckets: Mutex<HashMap<(Scope, Strng), Arc<Bucket>>>,
}

impl RateLimiter {
	pub fn new(policies: Vec<RateLimitPolicy>) -> RateLimiter {
		RateLimiter {
			policies,
			buckets: Mutex::new(HashMap::new()),
		}
	}

	fn bucket(&self, policy: &RateLimitPolicy, key: &Strng, now: Instant) -> Arc<Bucket> {
		let mut buckets = self.buckets.lock();
		buckets
			.entry((policy.scope, key.clone()))
			.or_insert_with(|| Arc::new(Bucket::new(policy.capacity, policy.refill_rate, now)))
			.clone()
	}

	/// Admit a request: one token from every applicable bucket, evaluated in
	/// policy order. On denial, tokens already taken are returned so a
	/// rejected request counts against no scope.
	pub fn check(
		&self,
		keys: &AdmissionKeys,
		now: Instant,
	) -> Result<AdmissionSnapshot, RateLimited> {
		let mut taken: Vec<Arc<Bucket>> = Vec::new();
		let mut tightest: Option<AdmissionSnapshot> = None;
		for policy in &self.policies {
			let bucket = self.bucket(policy, keys.for_scope(policy.scope), now);
			match bucket.try_acquire(now) {
				Ok(snap) => {
					taken.push(bucket);
					if tightest.is_none_or(|t| snap.remaining < t.remaining) {
						tightest = Some(snap);
					}
				},
				Err(mut denied) => {
					denied.scope = policy.scope;
					for b in taken {
						b.refund(now);
					}
					return Err(denied);
				},
			}
		}
		Ok(tightest.unwrap_or_default())
	}

	pub fn has_policies(&self) -> bool {
		!self.policies.is_empty()
	}

	/// Drop buckets idle for at least their own full-refill window.
	pub fn gc(&self, now: Instant) {
		let mut buckets = self.buckets.lock();
		buckets.retain(|_, b| b.idle_for(now) < b.full_window());
	}

	#[cfg(test)]
	fn bucket_count(&self) -> usize {
		self.buckets.lock().len()
	}
}
