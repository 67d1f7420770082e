use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::str::FromStr;

use crate::ratelimit::RateLimitPolicy;
use crate::route::{RouteRule, Strategy};
use crate::stream::CouplerConfig;
use crate::types::provider::ProviderDescriptor;
use crate::*;

#[derive(Debug, Clone)]
pub struct Config {
	pub listen: SocketAddr,
	pub providers: Vec<ProviderDescriptor>,
	pub aliases: BTreeMap<Strng, Strng>,
	pub rules: Vec<RouteRule>,
	pub default_strategy: Strategy,
	pub limits: Vec<RateLimitPolicy>,
	pub coupler: CouplerConfig,
	pub probe_interval: Duration,
	pub drain_deadline: Duration,
	pub idempotency_window: Duration,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawConfig {
	#[serde(default)]
	listen: Option<String>,
	#[serde(default)]
	providers: Vec<ProviderDescriptor>,
	#[serde(default)]
	aliases: BTreeMap<Strng, Strng>,
	#[serde(default)]
	rules: Vec<RouteRule>,
	#[serde(default)]
	default_strategy: Strategy,
	#[serde(default)]
	limits: Vec<RateLimitPolicy>,
	#[serde(default)]
	coupler: Option<CouplerConfig>,
	#[serde(default, with = "serde_dur_option")]
	probe_interval: Option<Duration>,
	#[serde(default, with = "serde_dur_option")]
	drain_deadline: Option<Duration>,
	#[serde(default, with = "serde_dur_option")]
	idempotency_window: Option<Duration>,
}

fn parse<T: FromStr>(env: &str) -> anyhow::Result<Option<T>>
where
	<T as FromStr>::Err: std::error::Error + Send + Sync + 'static,
{
	match std::env::var(env) {
		Ok(val) if !val.is_empty() => Ok(Some(
			val.parse().with_context(|| format!("invalid {env}"))?,
		)),
		_ => Ok(None),
	}
}

/// Parse a YAML configuration, applying environment overrides and defaults.
pub fn parse_config(contents: &str) -> anyhow::Result<Config> {
	let raw: RawConfig = serde_yaml::from_str(contents).context("parse config")?;

	let listen = parse::<SocketAddr>("LISTEN_ADDR")?
		.or(raw
			.listen
			.map(|l| l.parse())
			.transpose()
			.context("invalid listen address")?)
		.unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 3000)));

	let probe_interval = parse::<u64>("PROBE_INTERVAL_SECS")?
		.map(Duration::from_secs)
		.or(raw.probe_interval)
		.unwrap_or(Duration::from_secs(30));

	let drain_deadline = parse::<u64>("DRAIN_DEADLINE_SECS")?
		.map(Duration::from_secs)
		.or(raw.drain_deadline)
		.unwrap_or(Duration::from_secs(30));

	let cfg = Config {
		listen,
		providers: raw.providers,
		aliases: raw.aliases,
		rules: raw.rules,
		default_strategy: raw.default_strategy,
		limits: raw.limits,
		coupler: raw.coupler.unwrap_or_default(),
		probe_interval,
		drain_deadline,
		idempotency_window: raw
			.idempotency_window
			.unwrap_or(crate::idempotency::DEFAULT_WINDOW),
	};
	validate(&cfg)?;
	Ok(cfg)
}

fn validate(cfg: &Config) -> anyhow::Result<()> {
	for p in &cfg.providers {
		if p.models.is_empty() && p.model_override.is_none() {
			anyhow::bail!("provider {}: no models configured", p.name);
		}
		url::Url::parse(p.base_url())
			.with_context(|| format!("provider {}: invalid endpoint", p.name))?;
		if p.retry.multiplier < 1.0 {
			anyhow::bail!("provider {}: retry multiplier must be >= 1", p.name);
		}
		if !(0.0..=1.0).contains(&p.retry.jitter) {
			anyhow::bail!("provider {}: retry jitter must be within [0, 1]", p.name);
		}
	}
	for l in &cfg.limits {
		if l.capacity <= 0.0 || l.refill_rate <= 0.0 {
			anyhow::bail!("rate limit for {:?}: capacity and refillRate must be positive", l.scope);
		}
	}
	for alias in cfg.aliases.keys() {
		if cfg.aliases.contains_key(cfg.aliases.get(alias).unwrap()) {
			anyhow::bail!("alias {} resolves to another alias", alias);
		}
	}
	Ok(())
}

#[cfg(test)]
pub mod test_support {
	use super::*;

	pub fn config_from_yaml(yaml: &str) -> Config {
		parse_config(yaml).expect("test config must parse")
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ratelimit::Scope;

	#[test]
	fn full_config_parses() {
		let cfg = parse_config(
			r#"
listen: 127.0.0.1:8080
defaultStrategy: least-latency
providers:
  - name: openai-main
    kind: openai-compatible
    auth:
      bearer:
        token: sk-test
    models: [gpt-4o]
aliases:
  gpt4: gpt-4o
rules:
  - name: default
    when: always
limits:
  - scope: api-key
    capacity: 100
    refillRate: 10
coupler:
  capacity: 512
  keepAlive: 10s
probeInterval: 1m
drainDeadline: 45s
"#,
		)
		.unwrap();
		assert_eq!(cfg.listen.port(), 8080);
		assert_eq!(cfg.default_strategy, Strategy::LeastLatency);
		assert_eq!(cfg.limits[0].scope, Scope::ApiKey);
		assert_eq!(cfg.coupler.capacity, 512);
		assert_eq!(cfg.probe_interval, Duration::from_secs(60));
		assert_eq!(cfg.drain_deadline, Duration::from_secs(45));
	}

	#[test]
	fn provider_without_models_is_rejected() {
		let err = parse_config(
			r#"
providers:
  - name: p
    kind: openai-compatible
"#,
		)
		.unwrap_err();
		assert!(err.to_string().contains("no models"));
	}

	#[test]
	fn chained_aliases_are_rejected() {
		let err = parse_config(
			r#"
providers:
  - name: p
    kind: openai-compatible
    models: [a]
aliases:
  x: y
  y: a
"#,
		)
		.unwrap_err();
		assert!(err.to_string().contains("another alias"));
	}

	#[test]
	fn defaults_apply() {
		let cfg = parse_config("providers: []").unwrap();
		assert_eq!(cfg.listen.port(), 3000);
		assert_eq!(cfg.coupler.capacity, 1024);
		assert_eq!(cfg.coupler.keep_alive, Duration::from_secs(15));
		assert_eq!(cfg.idempotency_window, Duration::from_secs(86400));
	}
}
