//! The routing engine: resolves the requested model, filters providers by
//! capability and health, walks the configured rules, and emits an ordered
//! candidate list (primary first, failover sequence after). Given a fixed
//! snapshot and clock, routing mutates nothing except strategy cursors; all
//! mutable reads are atomic snapshots taken once per call.

use std::sync::atomic::Ordering;

use rand::Rng;
use rand::seq::IndexedRandom;

use crate::breaker::BreakerState;
use crate::health::HealthStatus;
use crate::store::{ProviderHandle, RegistrySnapshot};
use crate::types::provider::Capability;
use crate::types::uniform::UniformRequest;
use crate::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
	#[default]
	RoundRobin,
	LeastLatency,
	LeastConnections,
	LowestCost,
	WeightedRandom,
	PowerOfTwo,
}

/// The closed condition algebra for routing rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RuleCondition {
	Always,
	ModelGlob {
		pattern: String,
	},
	TenantIn {
		tenants: Vec<Strng>,
	},
	PrincipalIn {
		principals: Vec<Strng>,
	},
	/// Matches when the cheapest available estimate for this request is at
	/// most the threshold (dollars). Providers without pricing count as free.
	CostAtMost {
		threshold: f64,
	},
	CostAtLeast {
		threshold: f64,
	},
	CapabilityRequired {
		capability: Capability,
	},
	TagMatch {
		key: String,
		value: String,
	},
	All {
		conditions: Vec<RuleCondition>,
	},
	Any {
		conditions: Vec<RuleCondition>,
	},
	Not {
		condition: Box<RuleCondition>,
	},
}

impl Default for RuleCondition {
	fn default() -> Self {
		RuleCondition::Always
	}
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ProviderFilter {
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub include: Vec<Strng>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub exclude: Vec<Strng>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub region: Option<Strng>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tag: Option<TagSelector>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TagSelector {
	pub key: String,
	pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RouteRule {
	pub name: Strng,
	#[serde(default)]
	pub when: RuleCondition,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub strategy: Option<Strategy>,
	#[serde(default)]
	pub filter: ProviderFilter,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
	#[error("model not found: {0}")]
	ModelNotFound(Strng),
	#[error("no provider supports required capability: {0}")]
	UnsupportedCapability(Capability),
	#[error("no candidates available")]
	NoCandidates,
}

#[derive(Debug)]
pub struct RouteOutcome {
	/// Ordered: the first entry is the primary, the rest is the failover
	/// sequence.
	pub candidates: Vec<Arc<ProviderHandle>>,
	pub canonical_model: Strng,
	pub rule: Option<Strng>,
	pub strategy: Strategy,
	/// Every candidate was unhealthy or breaker-gated, and we fell back to
	/// the full post-rule set rather than failing outright.
	pub last_resort: bool,
}

/// The capabilities a request needs, implicit plus hinted.
fn required_capabilities(req: &UniformRequest) -> Vec<Capability> {
	let mut caps = Vec::new();
	if req.stream {
		caps.push(Capability::Streaming);
	}
	if req.has_tools() {
		caps.push(Capability::Tools);
	}
	if req.needs_vision() {
		caps.push(Capability::Vision);
	}
	for cap in &req.hints.required_capabilities {
		if !caps.contains(cap) {
			caps.push(*cap);
		}
	}
	caps
}

pub fn route(
	req: &UniformRequest,
	snap: &RegistrySnapshot,
	now: Instant,
) -> Result<RouteOutcome, RouteError> {
	// 1. Model resolution.
	let canonical = snap.resolve_model(&req.model);
	let serving: Vec<Arc<ProviderHandle>> = snap
		.providers
		.iter()
		.filter(|p| p.descriptor.enabled && p.descriptor.serves_model(&canonical))
		.cloned()
		.collect();
	if serving.is_empty() {
		return Err(RouteError::ModelNotFound(canonical));
	}

	// 2. Capability filter.
	let required = required_capabilities(req);
	let capable: Vec<Arc<ProviderHandle>> = serving
		.iter()
		.filter(|p| required.iter().all(|c| p.descriptor.supports(*c)))
		.cloned()
		.collect();
	if capable.is_empty() {
		let missing = required
			.iter()
			.find(|c| !serving.iter().any(|p| p.descriptor.supports(**c)))
			.copied()
			.unwrap_or(Capability::Streaming);
		return Err(RouteError::UnsupportedCapability(missing));
	}

	// 3. Rule application: first match wins.
	let matched = snap
		.rules
		.iter()
		.find(|r| r.rule.when.matches(req, &canonical, &capable));
	let (strategy, cursor, rule_name, filtered) = match matched {
		Some(rule_state) => {
			let filtered = apply_filter(&rule_state.rule.filter, &capable);
			(
				rule_state.rule.strategy.unwrap_or(snap.default_strategy),
				&rule_state.rr_cursor,
				Some(rule_state.rule.name.clone()),
				filtered,
			)
		},
		None => (
			snap.default_strategy,
			snap.default_rr_cursor.as_ref(),
			None,
			capable.clone(),
		),
	};
	if filtered.is_empty() {
		return Err(RouteError::NoCandidates);
	}

	// 4. Health filter, with graceful degradation to the full post-rule set.
	let healthy: Vec<Arc<ProviderHandle>> = filtered
		.iter()
		.filter(|p| !breaker_gated(p, now) && p.health.status() != HealthStatus::Unhealthy)
		.cloned()
		.collect();
	let (pool, last_resort) = if healthy.is_empty() {
		(filtered, true)
	} else {
		(healthy, false)
	};

	// 5/6. Primary selection and failover ordering.
	let candidates = order_candidates(strategy, cursor, pool, req);
	Ok(RouteOutcome {
		candidates,
		canonical_model: canonical,
		rule: rule_name,
		strategy,
		last_resort,
	})
}

/// An open breaker whose cooldown has not elapsed excludes the provider from
/// routing. Once the cooldown passes, the provider re-enters routing so a
/// half-open probe can be attempted.
fn breaker_gated(p: &ProviderHandle, now: Instant) -> bool {
	p.breaker.state() == BreakerState::Open && !p.breaker.cooldown_elapsed(now)
}

fn apply_filter(
	filter: &ProviderFilter,
	candidates: &[Arc<ProviderHandle>],
) -> Vec<Arc<ProviderHandle>> {
	candidates
		.iter()
		.filter(|p| {
			let d = &p.descriptor;
			if !filter.include.is_empty() && !filter.include.contains(&d.name) {
				return false;
			}
			if filter.exclude.contains(&d.name) {
				return false;
			}
			if let Some(region) = &filter.region
				&& d.region.as_ref() != Some(region)
			{
				return false;
			}
			if let Some(tag) = &filter.tag
				&& d.tags.get(&tag.key) != Some(&tag.value)
			{
				return false;
			}
			true
		})
		.cloned()
		.collect()
}

fn estimated_cost(p: &ProviderHandle, req: &UniformRequest) -> f64 {
	p.descriptor
		.estimate_cost(req.estimated_input_tokens(), req.estimated_output_tokens())
		.unwrap_or(0.0)
}

fn order_candidates(
	strategy: Strategy,
	cursor: &std::sync::atomic::AtomicUsize,
	mut pool: Vec<Arc<ProviderHandle>>,
	req: &UniformRequest,
) -> Vec<Arc<ProviderHandle>> {
	// Deterministic base order for reproducible tie-breaks.
	pool.sort_by(|a, b| a.name().cmp(b.name()));

	// A blended cost/latency score from client hints overrides the strategy.
	if req.hints.cost_weight.is_some() || req.hints.latency_weight.is_some() {
		let cw = req.hints.cost_weight.unwrap_or(0.0);
		let lw = req.hints.latency_weight.unwrap_or(0.0);
		let max_cost = pool
			.iter()
			.map(|p| estimated_cost(p, req))
			.fold(f64::EPSILON, f64::max);
		let max_lat = pool
			.iter()
			.map(|p| p.health.snapshot().p95.as_secs_f64())
			.fold(f64::EPSILON, f64::max);
		pool.sort_by(|a, b| {
			let score = |p: &ProviderHandle| {
				cw * estimated_cost(p, req) / max_cost
					+ lw * p.health.snapshot().p95.as_secs_f64() / max_lat
			};
			score(a).total_cmp(&score(b)).then(a.name().cmp(b.name()))
		});
	} else {
		match strategy {
			Strategy::RoundRobin => {
				let n = pool.len();
				let start = cursor.fetch_add(1, Ordering::Relaxed) % n;
				pool.rotate_left(start);
			},
			Strategy::LeastLatency => {
				pool.sort_by(|a, b| {
					a.health
						.snapshot()
						.p95
						.cmp(&b.health.snapshot().p95)
						.then(a.name().cmp(b.name()))
				});
			},
			Strategy::LeastConnections => {
				pool.sort_by(|a, b| {
					a.inflight_count()
						.cmp(&b.inflight_count())
						.then(a.name().cmp(b.name()))
				});
			},
			Strategy::LowestCost => {
				pool.sort_by(|a, b| {
					estimated_cost(a, req)
						.total_cmp(&estimated_cost(b, req))
						.then(a.name().cmp(b.name()))
				});
			},
			Strategy::WeightedRandom => {
				let weighted: Vec<Arc<ProviderHandle>> = pool
					.iter()
					.filter(|p| p.descriptor.weight > 0)
					.cloned()
					.collect();
				if let Ok(primary) =
					weighted.choose_weighted(&mut rand::rng(), |p| p.descriptor.weight as u64)
				{
					let primary = primary.clone();
					pool.retain(|p| p.name() != primary.name());
					pool.sort_by(|a, b| {
						b.descriptor
							.weight
							.cmp(&a.descriptor.weight)
							.then(a.name().cmp(b.name()))
					});
					pool.insert(0, primary);
				}
			},
			Strategy::PowerOfTwo => {
				if pool.len() > 2 {
					let mut rng = rand::rng();
					let i = rng.random_range(0..pool.len());
					let j = {
						let j = rng.random_range(0..pool.len() - 1);
						if j >= i { j + 1 } else { j }
					};
					let primary = if pool[i].inflight_count() <= pool[j].inflight_count() {
						pool[i].clone()
					} else {
						pool[j].clone()
					};
					pool.retain(|p| p.name() != primary.name());
					pool.sort_by(|a, b| {
						a.inflight_count()
							.cmp(&b.inflight_count())
							.then(a.name().cmp(b.name()))
					});
					pool.insert(0, primary);
				} else {
					pool.sort_by(|a, b| {
						a.inflight_count()
							.cmp(&b.inflight_count())
							.then(a.name().cmp(b.name()))
					});
				}
			},
		}
	}

	// Client-preferred provider wins the primary slot when it survived the
	// filters.
	if let Some(preferred) = &req.hints.preferred_provider
		&& let Some(pos) = pool.iter().position(|p| p.name() == preferred)
	{
		let preferred = pool.remove(pos);
		pool.insert(0, preferred);
	}

	// Failover prefers candidates sharing the primary's region.
	if let Some(primary_region) = pool.first().and_then(|p| p.descriptor.region.clone()) {
		let rest = pool.split_off(1);
		let (same, other): (Vec<_>, Vec<_>) = rest
			.into_iter()
			.partition(|p| p.descriptor.region.as_ref() == Some(&primary_region));
		pool.extend(same);
		pool.extend(other);
	}

	pool
}

impl RuleCondition {
	pub fn matches(
		&self,
		req: &UniformRequest,
		canonical_model: &str,
		providers: &[Arc<ProviderHandle>],
	) -> bool {
		match self {
			RuleCondition::Always => true,
			RuleCondition::ModelGlob { pattern } => match_glob(pattern, canonical_model),
			RuleCondition::TenantIn { tenants } => tenants.contains(&req.tenant),
			RuleCondition::PrincipalIn { principals } => principals.contains(&req.principal),
			RuleCondition::CostAtMost { threshold } => cheapest(req, providers) <= *threshold,
			RuleCondition::CostAtLeast { threshold } => cheapest(req, providers) >= *threshold,
			RuleCondition::CapabilityRequired { capability } => {
				required_capabilities(req).contains(capability)
					|| req.hints.required_capabilities.contains(capability)
			},
			RuleCondition::TagMatch { key, value } => providers
				.iter()
				.any(|p| p.descriptor.tags.get(key) == Some(value)),
			RuleCondition::All { conditions } => conditions
				.iter()
				.all(|c| c.matches(req, canonical_model, providers)),
			RuleCondition::Any { conditions } => conditions
				.iter()
				.any(|c| c.matches(req, canonical_model, providers)),
			RuleCondition::Not { condition } => !condition.matches(req, canonical_model, providers),
		}
	}
}

fn cheapest(req: &UniformRequest, providers: &[Arc<ProviderHandle>]) -> f64 {
	providers
		.iter()
		.map(|p| estimated_cost(p, req))
		.fold(f64::INFINITY, f64::min)
}

/// `*`-wildcard glob match; no character classes.
pub fn match_glob(pattern: &str, value: &str) -> bool {
	let pat: Vec<char> = pattern.chars().collect();
	let val: Vec<char> = value.chars().collect();
	let (mut p, mut v) = (0usize, 0usize);
	let (mut star, mut mark) = (None::<usize>, 0usize);
	while v < val.len() {
		if p < pat.len() && (pat[p] == val[v]) {
			p += 1;
			v += 1;
		} else if p < pat.len() && pat[p] == '*' {
			star = Some(p);
			mark = v;
			p += 1;
		} else if let Some(s) = star {
			p = s + 1;
			mark += 1;
			v = mark;
		} else {
			return false;
		}
	}
	while p < pat.len() && pat[p] == '*' {
		p += 1;
	}
	p == pat.len()
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::test_support::config_from_yaml;
	use crate::store::Registry;
	use crate::types::uniform::{Content, Message, Role};

	fn request(model: &str) -> UniformRequest {
		UniformRequest {
			id: strng::new("r"),
			principal: strng::new("alice"),
			tenant: strng::new("acme"),
			model: strng::new(model),
			messages: vec![Message {
				role: Role::User,
				content: Content::Text("hi there, question".to_string()),
				name: None,
				tool_calls: None,
				tool_call_id: None,
			}],
			temperature: None,
			top_p: None,
			max_tokens: Some(100),
			stop: vec![],
			tools: None,
			stream: false,
			deadline: None,
			idempotency_key: None,
			hints: Default::default(),
		}
	}

	fn registry(yaml: &str) -> Registry {
		Registry::new(&config_from_yaml(yaml)).unwrap()
	}

	fn names(outcome: &RouteOutcome) -> Vec<&str> {
		outcome
			.candidates
			.iter()
			.map(|p| p.name().as_str())
			.collect()
	}

	const TWO_PROVIDERS: &str = r#"
providers:
  - name: p1
    kind: openai-compatible
    models: [gpt-4o]
  - name: p2
    kind: openai-compatible
    models: [gpt-4o]
aliases:
  gpt4: gpt-4o
"#;

	#[test]
	fn unknown_model_is_rejected() {
		let reg = registry(TWO_PROVIDERS);
		let err = route(&request("nope"), &reg.snapshot(), Instant::now()).unwrap_err();
		assert_eq!(err, RouteError::ModelNotFound(strng::new("nope")));
	}

	#[test]
	fn alias_resolves_before_matching() {
		let reg = registry(TWO_PROVIDERS);
		let out = route(&request("gpt4"), &reg.snapshot(), Instant::now()).unwrap();
		assert_eq!(out.canonical_model.as_str(), "gpt-4o");
		assert_eq!(out.candidates.len(), 2);
	}

	#[test]
	fn round_robin_rotates() {
		let reg = registry(TWO_PROVIDERS);
		let snap = reg.snapshot();
		let now = Instant::now();
		let first = route(&request("gpt-4o"), &snap, now).unwrap();
		let second = route(&request("gpt-4o"), &snap, now).unwrap();
		assert_eq!(names(&first), vec!["p1", "p2"]);
		assert_eq!(names(&second), vec!["p2", "p1"]);
	}

	#[test]
	fn streaming_requires_capability() {
		let reg = registry(
			r#"
providers:
  - name: p1
    kind: openai-compatible
    models: [gpt-4o]
    capabilities: [tools, system-msg]
"#,
		);
		let mut req = request("gpt-4o");
		req.stream = true;
		let err = route(&req, &reg.snapshot(), Instant::now()).unwrap_err();
		assert_eq!(
			err,
			RouteError::UnsupportedCapability(Capability::Streaming)
		);
	}

	#[test]
	fn least_connections_prefers_idle() {
		let reg = registry(TWO_PROVIDERS);
		let mut cfg = config_from_yaml(TWO_PROVIDERS);
		cfg.default_strategy = Strategy::LeastConnections;
		reg.reload(&cfg).unwrap();
		let snap = reg.snapshot();
		snap.by_name.get("p1").unwrap().begin_call();
		let out = route(&request("gpt-4o"), &snap, Instant::now()).unwrap();
		assert_eq!(names(&out), vec!["p2", "p1"]);
	}

	#[test]
	fn least_latency_uses_p95() {
		let reg = registry(TWO_PROVIDERS);
		let mut cfg = config_from_yaml(TWO_PROVIDERS);
		cfg.default_strategy = Strategy::LeastLatency;
		reg.reload(&cfg).unwrap();
		let snap = reg.snapshot();
		for _ in 0..16 {
			snap
				.by_name
				.get("p1")
				.unwrap()
				.health
				.record(true, Duration::from_millis(900));
			snap
				.by_name
				.get("p2")
				.unwrap()
				.health
				.record(true, Duration::from_millis(100));
		}
		let out = route(&request("gpt-4o"), &snap, Instant::now()).unwrap();
		assert_eq!(names(&out), vec!["p2", "p1"]);
	}

	#[test]
	fn lowest_cost_prefers_cheaper() {
		let reg = registry(
			r#"
defaultStrategy: lowest-cost
providers:
  - name: cheap
    kind: openai-compatible
    models: [gpt-4o]
    pricing:
      inputPerMillion: 1.0
      outputPerMillion: 2.0
  - name: pricey
    kind: openai-compatible
    models: [gpt-4o]
    pricing:
      inputPerMillion: 10.0
      outputPerMillion: 30.0
"#,
		);
		let out = route(&request("gpt-4o"), &reg.snapshot(), Instant::now()).unwrap();
		assert_eq!(names(&out), vec!["cheap", "pricey"]);
	}

	#[test]
	fn unhealthy_providers_are_filtered() {
		let reg = registry(TWO_PROVIDERS);
		let snap = reg.snapshot();
		let p1 = snap.by_name.get("p1").unwrap();
		for _ in 0..20 {
			p1.health.record(false, Duration::from_millis(10));
		}
		let out = route(&request("gpt-4o"), &snap, Instant::now()).unwrap();
		assert_eq!(names(&out), vec!["p2"]);
		assert!(!out.last_resort);
	}

	#[test]
	fn all_unhealthy_falls_back_last_resort() {
		let reg = registry(TWO_PROVIDERS);
		let snap = reg.snapshot();
		for p in &snap.providers {
			for _ in 0..20 {
				p.health.record(false, Duration::from_millis(10));
			}
		}
		let out = route(&request("gpt-4o"), &snap, Instant::now()).unwrap();
		assert_eq!(out.candidates.len(), 2);
		assert!(out.last_resort);
	}

	#[test]
	fn open_breaker_excluded_until_cooldown() {
		let reg = registry(TWO_PROVIDERS);
		let snap = reg.snapshot();
		let p1 = snap.by_name.get("p1").unwrap();
		let now = Instant::now();
		for _ in 0..5 {
			p1.breaker.record(crate::breaker::Outcome::Failure, now);
		}
		let out = route(&request("gpt-4o"), &snap, now).unwrap();
		assert_eq!(names(&out), vec!["p2"]);
		// After the cooldown the provider re-enters routing for probing.
		let later = now + Duration::from_secs(61);
		let out = route(&request("gpt-4o"), &snap, later).unwrap();
		assert_eq!(out.candidates.len(), 2);
	}

	#[test]
	fn rules_first_match_wins() {
		let reg = registry(
			r#"
providers:
  - name: p1
    kind: openai-compatible
    models: [gpt-4o]
  - name: p2
    kind: openai-compatible
    models: [gpt-4o]
rules:
  - name: acme-pinned
    when:
      tenantIn:
        tenants: [acme]
    filter:
      include: [p2]
  - name: catch-all
    when: always
"#,
		);
		let out = route(&request("gpt-4o"), &reg.snapshot(), Instant::now()).unwrap();
		assert_eq!(out.rule.as_deref(), Some("acme-pinned"));
		assert_eq!(names(&out), vec!["p2"]);

		let mut req = request("gpt-4o");
		req.tenant = strng::new("other");
		let out = route(&req, &reg.snapshot(), Instant::now()).unwrap();
		assert_eq!(out.rule.as_deref(), Some("catch-all"));
		assert_eq!(out.candidates.len(), 2);
	}

	#[test]
	fn model_glob_condition() {
		let reg = registry(
			r#"
providers:
  - name: p1
    kind: openai-compatible
    models: [gpt-4o, claude-3-haiku]
  - name: p2
    kind: openai-compatible
    models: [gpt-4o, claude-3-haiku]
rules:
  - name: claude-only
    when:
      modelGlob:
        pattern: "claude-*"
    filter:
      include: [p1]
"#,
		);
		let out = route(&request("claude-3-haiku"), &reg.snapshot(), Instant::now()).unwrap();
		assert_eq!(out.rule.as_deref(), Some("claude-only"));
		let out = route(&request("gpt-4o"), &reg.snapshot(), Instant::now()).unwrap();
		assert!(out.rule.is_none());
	}

	#[test]
	fn condition_algebra_composes() {
		let cond = RuleCondition::All {
			conditions: vec![
				RuleCondition::ModelGlob {
					pattern: "gpt-*".to_string(),
				},
				RuleCondition::Not {
					condition: Box::new(RuleCondition::TenantIn {
						tenants: vec![strng::new("blocked")],
					}),
				},
			],
		};
		let req = request("gpt-4o");
		assert!(cond.matches(&req, "gpt-4o", &[]));
		let mut blocked = request("gpt-4o");
		blocked.tenant = strng::new("blocked");
		assert!(!cond.matches(&blocked, "gpt-4o", &[]));
	}

	#[test]
	fn preferred_provider_hint_wins() {
		let reg = registry(TWO_PROVIDERS);
		let mut req = request("gpt-4o");
		req.hints.preferred_provider = Some(strng::new("p2"));
		let out = route(&req, &reg.snapshot(), Instant::now()).unwrap();
		assert_eq!(names(&out)[0], "p2");
	}

	#[test]
	fn weighted_random_excludes_zero_weight() {
		let reg = registry(
			r#"
defaultStrategy: weighted-random
providers:
  - name: p1
    kind: openai-compatible
    models: [gpt-4o]
    weight: 0
  - name: p2
    kind: openai-compatible
    models: [gpt-4o]
    weight: 5
"#,
		);
		for _ in 0..10 {
			let out = route(&request("gpt-4o"), &reg.snapshot(), Instant::now()).unwrap();
			assert_eq!(names(&out)[0], "p2");
		}
	}

	#[test]
	fn glob_matching() {
		assert!(match_glob("*", "anything"));
		assert!(match_glob("gpt-*", "gpt-4o"));
		assert!(match_glob("*-mini", "gpt-4o-mini"));
		assert!(match_glob("gpt-*-mini", "gpt-4o-mini"));
		assert!(!match_glob("gpt-*", "claude-3"));
		assert!(match_glob("gpt-4o", "gpt-4o"));
		assert!(!match_glob("gpt-4o", "gpt-4"));
	}
}
