//! The provider registry. Each configuration generation builds an immutable
//! snapshot which readers obtain with a single atomic pointer load; a reload
//! swaps the snapshot while carrying per-provider runtime state (breaker,
//! health, inflight) over by name so accumulated history survives.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};

use arc_swap::ArcSwap;

use crate::breaker::{BreakerState, CircuitBreaker};
use crate::client::ProviderClient;
use crate::health::{HealthStatus, HealthTracker};
use crate::route::{RouteRule, Strategy};
use crate::types::provider::ProviderDescriptor;
use crate::*;

/// A provider's live state: the immutable descriptor plus the mutable
/// runtime accounting that belongs to it. The runtime pieces are shared
/// references so a reload can rebuild the handle around a changed
/// descriptor while the accumulated history lives on.
pub struct ProviderHandle {
	pub descriptor: Arc<ProviderDescriptor>,
	pub client: ProviderClient,
	pub breaker: Arc<CircuitBreaker>,
	pub health: Arc<HealthTracker>,
	pub inflight: Arc<AtomicU64>,
}

impl Debug for ProviderHandle {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ProviderHandle")
			.field("name", &self.descriptor.name)
			.finish()
	}
}

impl ProviderHandle {
	fn new(descriptor: Arc<ProviderDescriptor>) -> anyhow::Result<ProviderHandle> {
		let client = ProviderClient::new(descriptor.clone())?;
		Ok(ProviderHandle {
			breaker: Arc::new(CircuitBreaker::new(descriptor.breaker)),
			health: Arc::new(HealthTracker::new(descriptor.latency_target)),
			inflight: Arc::new(AtomicU64::new(0)),
			client,
			descriptor,
		})
	}

	/// A handle for an updated descriptor that adopts `existing`'s breaker,
	/// health window and inflight counter. Only valid when the descriptors
	/// address the same backend (`ProviderDescriptor::same_backend`).
	fn with_runtime_of(
		descriptor: Arc<ProviderDescriptor>,
		existing: &ProviderHandle,
	) -> anyhow::Result<ProviderHandle> {
		let client = ProviderClient::new(descriptor.clone())?;
		Ok(ProviderHandle {
			breaker: existing.breaker.clone(),
			health: existing.health.clone(),
			inflight: existing.inflight.clone(),
			client,
			descriptor,
		})
	}

	pub fn name(&self) -> &Strng {
		&self.descriptor.name
	}

	pub fn inflight_count(&self) -> u64 {
		self.inflight.load(Ordering::Relaxed)
	}

	pub fn begin_call(&self) {
		self.inflight.fetch_add(1, Ordering::AcqRel);
	}

	pub fn end_call(&self) {
		let prev = self.inflight.fetch_sub(1, Ordering::AcqRel);
		debug_assert!(prev > 0, "inflight underflow");
	}

	/// The provider's effective health, folding in the breaker: an open
	/// breaker is unhealthy no matter what the rolling window says.
	pub fn effective_status(&self) -> HealthStatus {
		if self.breaker.state() == BreakerState::Open {
			return HealthStatus::Unhealthy;
		}
		self.health.status()
	}
}

/// A routing rule plus its runtime round-robin cursor.
pub struct RuleState {
	pub rule: RouteRule,
	pub rr_cursor: AtomicUsize,
}

impl RuleState {
	fn new(rule: RouteRule) -> RuleState {
		RuleState {
			rule,
			rr_cursor: AtomicUsize::new(0),
		}
	}
}

/// One immutable configuration generation.
pub struct RegistrySnapshot {
	pub providers: Vec<Arc<ProviderHandle>>,
	pub by_name: HashMap<Strng, Arc<ProviderHandle>>,
	pub aliases: BTreeMap<Strng, Strng>,
	pub rules: Vec<Arc<RuleState>>,
	pub default_strategy: Strategy,
	/// Cursor for the default (no-rule) strategy.
	pub default_rr_cursor: Arc<AtomicUsize>,
	pub generation: u64,
	pub created_unix: i64,
}

impl RegistrySnapshot {
	/// Resolve a requested model through the alias table to its canonical
	/// name.
	pub fn resolve_model(&self, model: &str) -> Strng {
		self
			.aliases
			.get(model)
			.cloned()
			.unwrap_or_else(|| strng::new(model))
	}

	/// The union of canonical models served by enabled providers.
	pub fn known_models(&self) -> Vec<Strng> {
		let mut models: Vec<Strng> = self
			.providers
			.iter()
			.filter(|p| p.descriptor.enabled)
			.flat_map(|p| p.descriptor.models.iter().cloned())
			.collect();
		models.sort();
		models.dedup();
		models
	}
}

pub struct Registry {
	snapshot: ArcSwap<RegistrySnapshot>,
	generation: AtomicU64,
	created_unix: AtomicI64,
}

impl Registry {
	pub fn new(cfg: &Config) -> anyhow::Result<Registry> {
		let registry = Registry {
			snapshot: ArcSwap::from_pointee(RegistrySnapshot {
				providers: Vec::new(),
				by_name: HashMap::new(),
				aliases: BTreeMap::new(),
				rules: Vec::new(),
				default_strategy: Strategy::default(),
				default_rr_cursor: Arc::new(AtomicUsize::new(0)),
				generation: 0,
				created_unix: 0,
			}),
			generation: AtomicU64::new(0),
			created_unix: AtomicI64::new(0),
		};
		registry.reload(cfg)?;
		Ok(registry)
	}

	/// Readers hold the returned Arc for the duration of one request; the
	/// load itself is a single atomic pointer clone.
	pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
		self.snapshot.load_full()
	}

	/// Build a fresh snapshot from configuration and swap it in. Unchanged
	/// descriptors keep their whole handle. Descriptors where only routing
	/// data moved (models, weight, pricing, tags, ...) get a rebuilt handle
	/// that adopts the old breaker, health window and inflight counter.
	/// Only a change to the backend itself — kind, endpoint, auth, timeout
	/// or breaker/health parameters — resets runtime history.
	pub fn reload(&self, cfg: &Config) -> anyhow::Result<()> {
		let old = self.snapshot.load();
		let mut providers = Vec::with_capacity(cfg.providers.len());
		let mut by_name = HashMap::with_capacity(cfg.providers.len());
		for descriptor in &cfg.providers {
			let descriptor = Arc::new(descriptor.clone());
			let handle = match old.by_name.get(&descriptor.name) {
				Some(existing) if *existing.descriptor == *descriptor => existing.clone(),
				Some(existing) if existing.descriptor.same_backend(&descriptor) => {
					Arc::new(ProviderHandle::with_runtime_of(descriptor, existing)?)
				},
				_ => Arc::new(ProviderHandle::new(descriptor)?),
			};
			if by_name
				.insert(handle.name().clone(), handle.clone())
				.is_some()
			{
				anyhow::bail!("duplicate provider name {}", handle.name());
			}
			providers.push(handle);
		}
		// Deterministic iteration order for strategy tie-breaks.
		providers.sort_by(|a, b| a.name().cmp(b.name()));

		let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
		let snapshot = RegistrySnapshot {
			providers,
			by_name,
			aliases: cfg
				.aliases
				.iter()
				.map(|(k, v)| (k.clone(), v.clone()))
				.collect(),
			rules: cfg
				.rules
				.iter()
				.map(|r| Arc::new(RuleState::new(r.clone())))
				.collect(),
			default_strategy: cfg.default_strategy,
			default_rr_cursor: old.default_rr_cursor.clone(),
			generation,
			created_unix: chrono::Utc::now().timestamp(),
		};
		self
			.created_unix
			.store(snapshot.created_unix, Ordering::Relaxed);
		self.snapshot.store(Arc::new(snapshot));
		info!(generation, "provider registry loaded");
		Ok(())
	}

	/// Readiness: at least one enabled provider is not unhealthy.
	pub fn any_available(&self) -> bool {
		self
			.snapshot
			.load()
			.providers
			.iter()
			.any(|p| p.descriptor.enabled && p.effective_status() != HealthStatus::Unhealthy)
	}
}

impl Debug for Registry {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Registry")
			.field("generation", &self.generation.load(Ordering::Relaxed))
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::breaker::Outcome;
	use crate::config::test_support::config_from_yaml;

	fn two_provider_config() -> Config {
		config_from_yaml(
			r#"
providers:
  - name: p1
    kind: openai-compatible
    models: [gpt-4o]
  - name: p2
    kind: openai-compatible
    models: [gpt-4o]
aliases:
  gpt4: gpt-4o
"#,
		)
	}

	#[test]
	fn reload_preserves_runtime_state_for_unchanged_providers() {
		let cfg = two_provider_config();
		let registry = Registry::new(&cfg).unwrap();
		let snap = registry.snapshot();
		let p1 = snap.by_name.get("p1").unwrap();
		p1.breaker.record(Outcome::Failure, Instant::now());
		p1.begin_call();

		registry.reload(&cfg).unwrap();
		let snap2 = registry.snapshot();
		let p1b = snap2.by_name.get("p1").unwrap();
		assert_eq!(p1b.breaker.consecutive_failures(), 1);
		assert_eq!(p1b.inflight_count(), 1);
		assert_eq!(snap2.generation, 2);
	}

	#[test]
	fn reload_keeps_runtime_across_routing_only_changes() {
		let cfg = two_provider_config();
		let registry = Registry::new(&cfg).unwrap();
		registry
			.snapshot()
			.by_name
			.get("p1")
			.unwrap()
			.breaker
			.record(Outcome::Failure, Instant::now());

		// Weight is routing data; the new descriptor is visible but the
		// breaker history survives.
		let mut cfg2 = two_provider_config();
		cfg2.providers[0].weight = 7;
		registry.reload(&cfg2).unwrap();
		let p1 = registry.snapshot().by_name.get("p1").cloned().unwrap();
		assert_eq!(p1.descriptor.weight, 7);
		assert_eq!(p1.breaker.consecutive_failures(), 1);
	}

	#[test]
	fn reload_resets_runtime_when_backend_changes() {
		let cfg = two_provider_config();
		let registry = Registry::new(&cfg).unwrap();
		registry
			.snapshot()
			.by_name
			.get("p1")
			.unwrap()
			.breaker
			.record(Outcome::Failure, Instant::now());

		let mut cfg2 = two_provider_config();
		cfg2.providers[0].endpoint = Some("https://alt.example.com".to_string());
		registry.reload(&cfg2).unwrap();
		let p1 = registry.snapshot().by_name.get("p1").cloned().unwrap();
		assert_eq!(p1.breaker.consecutive_failures(), 0);
	}

	#[test]
	fn alias_resolution() {
		let registry = Registry::new(&two_provider_config()).unwrap();
		let snap = registry.snapshot();
		assert_eq!(snap.resolve_model("gpt4").as_str(), "gpt-4o");
		assert_eq!(snap.resolve_model("gpt-4o").as_str(), "gpt-4o");
		assert_eq!(snap.known_models(), vec![strng::new("gpt-4o")]);
	}

	#[test]
	fn duplicate_provider_names_rejected() {
		let cfg = config_from_yaml(
			r#"
providers:
  - name: p1
    kind: openai-compatible
    models: [m]
  - name: p1
    kind: ollama
    models: [m]
"#,
		);
		assert!(Registry::new(&cfg).is_err());
	}
}
