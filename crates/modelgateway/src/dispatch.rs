//! The dispatch pipeline: admission → routing → breaker gate → provider
//! call → retry/failover → response normalization. A request is bound to at
//! most one provider at a time; failover is strictly sequential.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use futures::StreamExt;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::breaker::{self, BreakerState, Decision, Transition};
use crate::client::{CallError, FailureClass, Invocation};
use crate::llm::ChunkStream;
use crate::ratelimit::{AdmissionKeys, AdmissionSnapshot, RateLimited, RateLimiter};
use crate::route::{self, RouteError, RouteOutcome};
use crate::store::{ProviderHandle, Registry};
use crate::stream::{CompletionHook, CoupledStream, CouplerConfig, StreamOutcome, couple};
use crate::telemetry::metrics::{Metrics, ProviderLabels, ScopeLabels, TransitionLabels};
use crate::types::provider::RetryConfig;
use crate::types::uniform::{UniformRequest, UniformResponse};
use crate::*;

pub const ROUTE_KEY: &str = "chat.completions";

/// Everything the inbound layer hands the core for one request.
pub struct RequestContext {
	pub request: UniformRequest,
	/// The caller's raw credential: the api-key rate limit key and the
	/// passthrough-auth material. Never logged.
	pub api_key: Strng,
	pub cancel: CancellationToken,
	pub received_at: Instant,
}

pub enum DispatchedBody {
	Complete(Box<UniformResponse>),
	Stream(CoupledStream),
}

/// The outcome handed back to the inbound layer: the rate-limit occupancy
/// (when admission ran) plus either a body or an error.
pub struct DispatchResult {
	pub admission: Option<AdmissionSnapshot>,
	pub outcome: Result<DispatchedBody, DispatchError>,
}

/// One failed provider attempt, kept for the terminal error report.
#[derive(Debug, Clone)]
pub struct Attempt {
	pub provider: Strng,
	pub error: String,
	pub status: Option<u16>,
}

#[derive(thiserror::Error, Debug)]
pub enum DispatchError {
	#[error("rate limit exceeded")]
	RateLimited(RateLimited),
	#[error("gateway is draining")]
	Draining,
	#[error("{0}")]
	Route(#[from] RouteError),
	#[error("request deadline exceeded")]
	DeadlineExceeded,
	#[error("client disconnected")]
	Cancelled,
	#[error("upstream error from {provider}: {error}")]
	Upstream { provider: Strng, error: CallError },
	#[error("all providers failed ({} attempts)", attempts.len())]
	AllProvidersFailed { attempts: Vec<Attempt> },
}

/// Tracks in-flight requests for draining.
#[derive(Debug, Default)]
pub struct ActiveRequests {
	count: AtomicU64,
	notify: tokio::sync::Notify,
}

impl ActiveRequests {
	pub fn count(&self) -> u64 {
		self.count.load(Ordering::Acquire)
	}

	fn begin(self: &Arc<Self>) -> ActiveGuard {
		self.count.fetch_add(1, Ordering::AcqRel);
		ActiveGuard {
			inner: self.clone(),
		}
	}

	/// Resolves once no requests are active.
	pub async fn wait_idle(&self) {
		loop {
			let notified = self.notify.notified();
			if self.count() == 0 {
				return;
			}
			notified.await;
		}
	}
}

struct ActiveGuard {
	inner: Arc<ActiveRequests>,
}

impl Drop for ActiveGuard {
	fn drop(&mut self) {
		if self.inner.count.fetch_sub(1, Ordering::AcqRel) == 1 {
			self.inner.notify.notify_waiters();
		}
	}
}

pub struct Dispatcher {
	pub registry: Arc<Registry>,
	pub limiter: Arc<RateLimiter>,
	pub metrics: Arc<Metrics>,
	pub coupler: CouplerConfig,
	pub active: Arc<ActiveRequests>,
	draining: AtomicBool,
}

impl Dispatcher {
	pub fn new(
		registry: Arc<Registry>,
		limiter: Arc<RateLimiter>,
		metrics: Arc<Metrics>,
		coupler: CouplerConfig,
	) -> Dispatcher {
		Dispatcher {
			registry,
			limiter,
			metrics,
			coupler,
			active: Arc::new(ActiveRequests::default()),
			draining: AtomicBool::new(false),
		}
	}

	/// Flip the draining flag: new requests are rejected, in-flight ones
	/// continue.
	pub fn start_draining(&self) {
		self.draining.store(true, Ordering::Release);
	}

	pub fn is_draining(&self) -> bool {
		self.draining.load(Ordering::Acquire)
	}

	pub async fn dispatch(&self, ctx: RequestContext) -> DispatchResult {
		if self.is_draining() {
			return DispatchResult {
				admission: None,
				outcome: Err(DispatchError::Draining),
			};
		}
		let active = self.active.begin();

		// 1. Rate limiter admission.
		let admission = if self.limiter.has_policies() {
			let keys = AdmissionKeys {
				api_key: ctx.api_key.clone(),
				tenant: ctx.request.tenant.clone(),
				route: strng::new(ROUTE_KEY),
			};
			match self.limiter.check(&keys, Instant::now()) {
				Ok(snap) => Some(snap),
				Err(denied) => {
					self
						.metrics
						.ratelimit_denied
						.get_or_create(&ScopeLabels {
							scope: Some(denied.scope.as_str()).into(),
						})
						.inc();
					return DispatchResult {
						admission: None,
						outcome: Err(DispatchError::RateLimited(denied)),
					};
				},
			}
		} else {
			None
		};

		let outcome = self.dispatch_inner(ctx, active).await;
		DispatchResult { admission, outcome }
	}

	async fn dispatch_inner(
		&self,
		ctx: RequestContext,
		active: ActiveGuard,
	) -> Result<DispatchedBody, DispatchError> {
		let req = &ctx.request;

		// 2. Candidate selection.
		let snapshot = self.registry.snapshot();
		let routed: RouteOutcome = route::route(req, &snapshot, Instant::now())?;
		if routed.last_resort {
			self.metrics.last_resort_routes.inc();
			debug!(request = %req.id, "all candidates unhealthy, using last-resort set");
		}
		debug!(
			request = %req.id,
			model = %routed.canonical_model,
			rule = routed.rule.as_deref().unwrap_or("-"),
			candidates = routed.candidates.len(),
			"routed"
		);

		// 3. Attempt loop: candidates in order, bounded retries per
		// candidate, sequential failover.
		let mut attempts: Vec<Attempt> = Vec::new();
		let mut canonical_req = req.clone();
		canonical_req.model = routed.canonical_model.clone();

		for (rank, candidate) in routed.candidates.iter().enumerate() {
			if rank > 0 {
				self
					.metrics
					.failovers
					.get_or_create(&self.provider_labels(candidate))
					.inc();
			}
			match self
				.try_candidate(&ctx, &canonical_req, candidate, &mut attempts)
				.await?
			{
				CandidateOutcome::Served(body) => {
					return Ok(self.finish_stream_accounting(body, active));
				},
				CandidateOutcome::Exhausted => continue,
			}
		}

		Err(DispatchError::AllProvidersFailed { attempts })
	}

	/// Run up to `max_retries + 1` attempts against one candidate.
	/// `Ok(Exhausted)` means move to the next candidate; fatal conditions
	/// return `Err` directly.
	async fn try_candidate(
		&self,
		ctx: &RequestContext,
		req: &UniformRequest,
		candidate: &Arc<ProviderHandle>,
		attempts: &mut Vec<Attempt>,
	) -> Result<CandidateOutcome, DispatchError> {
		let retry = candidate.descriptor.retry;
		let mut attempt: u32 = 0;
		loop {
			let now = Instant::now();
			let Some(budget) = remaining_budget(req, candidate, now) else {
				return Err(DispatchError::DeadlineExceeded);
			};

			// Breaker gate: a denial moves to the next candidate, never a
			// retry of this one.
			match candidate.breaker.allow(now) {
				Decision::Denied { retry_after } => {
					attempts.push(Attempt {
						provider: candidate.name().clone(),
						error: format!("circuit breaker open, retry in {retry_after:?}"),
						status: None,
					});
					return Ok(CandidateOutcome::Exhausted);
				},
				Decision::Permit => {},
			}
			let probing = candidate.breaker.state() == BreakerState::HalfOpen;

			candidate.begin_call();
			self
				.metrics
				.inflight
				.get_or_create(&self.provider_labels(candidate))
				.inc();
			// Releases the inflight slot even if this future is dropped at a
			// suspension point (client gone without a cancel signal).
			let mut call_guard = CallGuard {
				dispatcher: self,
				candidate,
				armed: true,
			};
			let t0 = Instant::now();

			let result = tokio::select! {
				biased;
				_ = ctx.cancel.cancelled() => {
					// Client-side event: release the slot, record nothing on
					// the breaker.
					return Err(DispatchError::Cancelled);
				},
				r = candidate.client.invoke(req, budget, Some(ctx.api_key.as_str())) => r,
			};

			match result {
				Ok(Invocation::Complete(response)) => {
					let latency = t0.elapsed();
					drop(call_guard);
					self.record_success(candidate, latency);
					return Ok(CandidateOutcome::Served(ServedBody::Complete(response)));
				},
				Ok(Invocation::Stream(stream)) => {
					match self
						.commit_stream(ctx, candidate, stream, budget, t0, &mut call_guard)
						.await?
					{
						Some(coupled) => {
							return Ok(CandidateOutcome::Served(ServedBody::Stream(coupled)));
						},
						None => {
							// Failed before anything was flushed downstream;
							// treated exactly like a retryable call failure.
							let latency = t0.elapsed();
							drop(call_guard);
							self.record_failure(candidate, latency);
							attempts.push(Attempt {
								provider: candidate.name().clone(),
								error: "stream failed before first chunk".to_string(),
								status: None,
							});
							if probing {
								return Ok(CandidateOutcome::Exhausted);
							}
							if attempt >= retry.max_retries {
								return Ok(CandidateOutcome::Exhausted);
							}
							attempt += 1;
							self.backoff(ctx, candidate, &retry, attempt, None).await?;
						},
					}
				},
				Err(error) => {
					let latency = t0.elapsed();
					drop(call_guard);
					match error.class() {
						FailureClass::Fatal => {
							// Client-caused failures do not advance the
							// breaker and are surfaced without failover.
							if !is_client_fault(&error) {
								self.record_failure(candidate, latency);
							}
							return Err(DispatchError::Upstream {
								provider: candidate.name().clone(),
								error,
							});
						},
						FailureClass::Throttled => {
							// Back-pressure, not sickness: the breaker is not
							// advanced, but health notes the failed attempt.
							candidate.health.record(false, latency);
							attempts.push(attempt_of(candidate, &error));
							return Ok(CandidateOutcome::Exhausted);
						},
						FailureClass::Retryable => {
							self.record_failure(candidate, latency);
							attempts.push(attempt_of(candidate, &error));
							if probing {
								// A failed half-open probe re-opened the
								// breaker; do not retry this candidate.
								return Ok(CandidateOutcome::Exhausted);
							}
							if attempt >= retry.max_retries {
								return Ok(CandidateOutcome::Exhausted);
							}
							attempt += 1;
							self
								.metrics
								.retries
								.get_or_create(&self.provider_labels(candidate))
								.inc();
							self
								.backoff(ctx, candidate, &retry, attempt, error.retry_after())
								.await?;
						},
					}
				},
			}
		}
	}

	/// Pull the first event off the provider stream. An error before the
	/// first chunk leaves failover possible (`Ok(None)`); a chunk commits
	/// the stream and hands it to the coupler.
	async fn commit_stream(
		&self,
		ctx: &RequestContext,
		candidate: &Arc<ProviderHandle>,
		mut stream: ChunkStream,
		budget: Duration,
		t0: Instant,
		call_guard: &mut CallGuard<'_>,
	) -> Result<Option<CoupledStream>, DispatchError> {
		let first = tokio::select! {
			biased;
			_ = ctx.cancel.cancelled() => {
				return Err(DispatchError::Cancelled);
			},
			first = tokio::time::timeout(budget, stream.next()) => first,
		};
		let first = match first {
			Err(_) => {
				// Time-to-first-chunk expired.
				return Ok(None);
			},
			Ok(None) | Ok(Some(Err(_))) => return Ok(None),
			Ok(Some(Ok(event))) => event,
		};

		// Committed: from here the coupler owns inflight release and
		// outcome recording.
		call_guard.disarm();
		let full: ChunkStream =
			Box::pin(futures::stream::iter([Ok(first)]).chain(stream));
		self.metrics.active_streams.inc();
		let hook = self.stream_hook(candidate.clone(), t0);
		Ok(Some(couple(
			ctx.request.id.clone(),
			full,
			self.coupler,
			hook,
		)))
	}

	/// The coupler's completion hook settles everything the dispatch loop
	/// would have settled for a non-streaming response.
	fn stream_hook(&self, candidate: Arc<ProviderHandle>, t0: Instant) -> CompletionHook {
		let metrics = self.metrics.clone();
		let labels = self.provider_labels(&candidate);
		let transitions = self.metrics.breaker_transitions.clone();
		Box::new(move |outcome| {
			let latency = t0.elapsed();
			candidate.end_call();
			metrics.inflight.get_or_create(&labels).dec();
			metrics.active_streams.dec();
			metrics
				.upstream_latency
				.get_or_create(&labels)
				.observe(latency.as_secs_f64());
			match &outcome {
				StreamOutcome::Completed { usage, chunks } => {
					candidate
						.breaker
						.record(breaker::Outcome::Success, Instant::now());
					candidate.health.record(true, latency);
					debug!(
						provider = %candidate.name(),
						chunks,
						completion_tokens = usage.completion_tokens,
						"stream completed"
					);
				},
				StreamOutcome::Failed { message, .. } => {
					let t = candidate
						.breaker
						.record(breaker::Outcome::Failure, Instant::now());
					note_transition(&transitions, candidate.name(), t);
					candidate.health.record(false, latency);
					warn!(provider = %candidate.name(), error = %message, "stream failed mid-flight");
				},
				StreamOutcome::Cancelled { usage, chunks } => {
					// Client went away: no breaker outcome, but the usage
					// telemetry keeps what was emitted.
					debug!(
						provider = %candidate.name(),
						chunks,
						completion_tokens = usage.completion_tokens,
						"stream cancelled by client"
					);
				},
			}
		})
	}

	/// For streams, the active-request guard must live until the stream
	/// finishes; tie it to the coupled stream's completion hook chain.
	fn finish_stream_accounting(&self, body: ServedBody, active: ActiveGuard) -> DispatchedBody {
		match body {
			ServedBody::Complete(resp) => {
				drop(active);
				DispatchedBody::Complete(resp)
			},
			ServedBody::Stream(stream) => DispatchedBody::Stream(stream.hold_guard(active)),
		}
	}

	async fn backoff(
		&self,
		ctx: &RequestContext,
		candidate: &Arc<ProviderHandle>,
		retry: &RetryConfig,
		attempt: u32,
		retry_after: Option<Duration>,
	) -> Result<(), DispatchError> {
		let delay = backoff_delay(retry, attempt, retry_after);
		debug!(provider = %candidate.name(), attempt, ?delay, "backing off before retry");
		tokio::select! {
			biased;
			_ = ctx.cancel.cancelled() => Err(DispatchError::Cancelled),
			_ = tokio::time::sleep(delay) => Ok(()),
		}
	}

	fn release_call(&self, candidate: &Arc<ProviderHandle>) {
		candidate.end_call();
		self
			.metrics
			.inflight
			.get_or_create(&self.provider_labels(candidate))
			.dec();
	}

	fn record_success(&self, candidate: &Arc<ProviderHandle>, latency: Duration) {
		let t = candidate
			.breaker
			.record(breaker::Outcome::Success, Instant::now());
		note_transition(&self.metrics.breaker_transitions, candidate.name(), t);
		candidate.health.record(true, latency);
		self
			.metrics
			.upstream_latency
			.get_or_create(&self.provider_labels(candidate))
			.observe(latency.as_secs_f64());
	}

	fn record_failure(&self, candidate: &Arc<ProviderHandle>, latency: Duration) {
		let t = candidate
			.breaker
			.record(breaker::Outcome::Failure, Instant::now());
		note_transition(&self.metrics.breaker_transitions, candidate.name(), t);
		candidate.health.record(false, latency);
		self
			.metrics
			.upstream_latency
			.get_or_create(&self.provider_labels(candidate))
			.observe(latency.as_secs_f64());
	}

	fn provider_labels(&self, candidate: &Arc<ProviderHandle>) -> ProviderLabels {
		ProviderLabels {
			provider: Some(candidate.name().as_str()).into(),
		}
	}
}

enum ServedBody {
	Complete(Box<UniformResponse>),
	Stream(CoupledStream),
}

struct CallGuard<'a> {
	dispatcher: &'a Dispatcher,
	candidate: &'a Arc<ProviderHandle>,
	armed: bool,
}

impl CallGuard<'_> {
	fn disarm(&mut self) {
		self.armed = false;
	}
}

impl Drop for CallGuard<'_> {
	fn drop(&mut self) {
		if self.armed {
			self.dispatcher.release_call(self.candidate);
		}
	}
}

enum CandidateOutcome {
	Served(ServedBody),
	Exhausted,
}

fn attempt_of(candidate: &Arc<ProviderHandle>, error: &CallError) -> Attempt {
	Attempt {
		provider: candidate.name().clone(),
		error: error.to_string(),
		status: match error {
			CallError::Status { status, .. } => Some(status.as_u16()),
			_ => None,
		},
	}
}

/// Failures the breaker and health tracker must not see: the request itself
/// was bad (400/404/422) or could not be encoded. Upstream 401/403 are NOT
/// client faults — they mean the gateway's own credentials are bad (the
/// error mapping surfaces them as a provider fault), and a provider that
/// rejects every call must still trip its breaker and go unhealthy.
fn is_client_fault(error: &CallError) -> bool {
	match error {
		CallError::Status { status, .. } => matches!(status.as_u16(), 400 | 404 | 422),
		CallError::Codec(e) => e.is_client_error(),
		_ => false,
	}
}

fn note_transition(
	family: &prometheus_client::metrics::family::Family<
		TransitionLabels,
		prometheus_client::metrics::counter::Counter,
	>,
	provider: &Strng,
	transition: Option<Transition>,
) {
	if let Some(t) = transition {
		warn!(provider = %provider, from = t.from.as_str(), to = t.to.as_str(), "circuit breaker transition");
		family
			.get_or_create(&TransitionLabels {
				provider: Some(provider.as_str()).into(),
				to: Some(t.to.as_str()).into(),
			})
			.inc();
	}
}

/// The per-attempt time budget: the descriptor's request timeout, clamped by
/// whatever remains of the request deadline. `None` when the deadline has
/// already passed.
fn remaining_budget(
	req: &UniformRequest,
	candidate: &ProviderHandle,
	now: Instant,
) -> Option<Duration> {
	let per_attempt = candidate.descriptor.timeouts.request;
	match req.deadline {
		Some(deadline) => {
			let left = deadline.checked_duration_since(now)?;
			if left.is_zero() {
				return None;
			}
			Some(left.min(per_attempt))
		},
		None => Some(per_attempt),
	}
}

/// Full-jitter exponential backoff. A provider-supplied Retry-After replaces
/// the computed delay, capped at five times the configured maximum.
pub fn backoff_delay(
	retry: &RetryConfig,
	attempt: u32,
	retry_after: Option<Duration>,
) -> Duration {
	if let Some(ra) = retry_after {
		return ra.min(retry.max_delay * 5);
	}
	let exp = retry.base_delay.as_secs_f64() * retry.multiplier.powi(attempt.saturating_sub(1) as i32);
	let capped = exp.min(retry.max_delay.as_secs_f64());
	let jitter = if retry.jitter > 0.0 {
		1.0 + rand::rng().random_range(-retry.jitter..=retry.jitter)
	} else {
		1.0
	};
	Duration::from_secs_f64((capped * jitter).max(0.0))
}
