use gateway_core::metrics::{DefaultedUnknown, EncodeDisplay};
use gateway_core::strng::RichStrng;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

#[derive(Clone, Hash, Default, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
	pub provider: DefaultedUnknown<RichStrng>,
	pub model: DefaultedUnknown<RichStrng>,
	pub status: DefaultedUnknown<EncodeDisplay<u16>>,
}

#[derive(Clone, Hash, Default, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct ProviderLabels {
	pub provider: DefaultedUnknown<RichStrng>,
}

#[derive(Clone, Hash, Default, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct TransitionLabels {
	pub provider: DefaultedUnknown<RichStrng>,
	pub to: DefaultedUnknown<RichStrng>,
}

#[derive(Clone, Hash, Default, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct ScopeLabels {
	pub scope: DefaultedUnknown<RichStrng>,
}

#[derive(Debug)]
pub struct Metrics {
	pub requests: Family<RequestLabels, Counter>,
	pub upstream_latency: Family<ProviderLabels, Histogram>,
	pub retries: Family<ProviderLabels, Counter>,
	pub failovers: Family<ProviderLabels, Counter>,
	pub breaker_transitions: Family<TransitionLabels, Counter>,
	pub ratelimit_denied: Family<ScopeLabels, Counter>,
	pub last_resort_routes: Counter,
	pub active_streams: Gauge,
	pub inflight: Family<ProviderLabels, Gauge>,
}

impl Metrics {
	pub fn new(registry: &mut Registry) -> Self {
		let requests = Family::default();
		registry.register(
			"requests",
			"The total number of dispatched requests",
			requests.clone(),
		);
		let upstream_latency =
			Family::<ProviderLabels, Histogram>::new_with_constructor(|| {
				Histogram::new(
					[0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0].into_iter(),
				)
			});
		registry.register(
			"upstream_latency_seconds",
			"Latency of upstream provider calls",
			upstream_latency.clone(),
		);
		let retries = Family::default();
		registry.register(
			"retries",
			"Retries against the same provider",
			retries.clone(),
		);
		let failovers = Family::default();
		registry.register(
			"failovers",
			"Requests moved to a subsequent candidate provider",
			failovers.clone(),
		);
		let breaker_transitions = Family::default();
		registry.register(
			"breaker_transitions",
			"Circuit breaker state transitions",
			breaker_transitions.clone(),
		);
		let ratelimit_denied = Family::default();
		registry.register(
			"ratelimit_denied",
			"Requests denied by the local rate limiter",
			ratelimit_denied.clone(),
		);
		let last_resort_routes = Counter::default();
		registry.register(
			"last_resort_routes",
			"Routing decisions that fell back to unhealthy candidates",
			last_resort_routes.clone(),
		);
		let active_streams = Gauge::default();
		registry.register(
			"active_streams",
			"Streaming responses currently open",
			active_streams.clone(),
		);
		let inflight = Family::default();
		registry.register(
			"inflight",
			"In-flight upstream requests per provider",
			inflight.clone(),
		);
		Metrics {
			requests,
			upstream_latency,
			retries,
			failovers,
			breaker_transitions,
			ratelimit_denied,
			last_resort_routes,
			active_streams,
			inflight,
		}
	}
}
