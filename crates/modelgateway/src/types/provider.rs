//! Provider descriptors: immutable per configuration generation, shared by
//! reference from the registry snapshot.

use std::collections::{BTreeMap, BTreeSet};

use secrecy::{ExposeSecret, SecretString};

use crate::*;

/// The closed set of wire-protocol shapes we can speak. New kinds require a
/// code change; there is no runtime plugin mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderKind {
	#[serde(rename = "openai-compatible")]
	OpenAICompatible,
	#[serde(rename = "anthropic")]
	Anthropic,
	#[serde(rename = "google")]
	Google,
	#[serde(rename = "bedrock")]
	Bedrock,
	#[serde(rename = "ollama")]
	Ollama,
	#[serde(rename = "vllm")]
	Vllm,
	#[serde(rename = "generic")]
	Generic,
}

impl ProviderKind {
	/// Kinds that share the OpenAI request/response schema.
	pub fn is_openai_wire(&self) -> bool {
		matches!(
			self,
			ProviderKind::OpenAICompatible | ProviderKind::Vllm | ProviderKind::Generic
		)
	}

	pub fn default_endpoint(&self) -> &'static str {
		match self {
			ProviderKind::OpenAICompatible | ProviderKind::Generic => "https://api.openai.com",
			ProviderKind::Anthropic => "https://api.anthropic.com",
			ProviderKind::Google => "https://generativelanguage.googleapis.com",
			// Bedrock hosts embed the region; see `ProviderDescriptor::base_url`.
			ProviderKind::Bedrock => "https://bedrock-runtime.us-east-1.amazonaws.com",
			ProviderKind::Ollama => "http://localhost:11434",
			ProviderKind::Vllm => "http://localhost:8000",
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
	Streaming,
	Tools,
	Vision,
	JsonMode,
	SystemMsg,
}

impl Capability {
	pub fn as_str(&self) -> &'static str {
		match self {
			Capability::Streaming => "streaming",
			Capability::Tools => "tools",
			Capability::Vision => "vision",
			Capability::JsonMode => "json-mode",
			Capability::SystemMsg => "system-msg",
		}
	}

	pub(crate) fn default_set() -> BTreeSet<Capability> {
		BTreeSet::from([
			Capability::Streaming,
			Capability::Tools,
			Capability::SystemMsg,
		])
	}
}

impl Display for Capability {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

/// How to authenticate against the upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AuthConfig {
	/// No credentials attached (local vLLM/Ollama).
	None {},
	/// `Authorization: Bearer <token>`.
	#[serde(rename_all = "camelCase")]
	Bearer {
		#[serde(
			serialize_with = "ser_redact",
			deserialize_with = "deser_key_from_file"
		)]
		token: SecretString,
	},
	/// A custom header, optionally with a value prefix
	/// (e.g. `x-api-key: <token>` or `api-key: Key <token>`).
	#[serde(rename_all = "camelCase")]
	Header {
		name: String,
		#[serde(
			serialize_with = "ser_redact",
			deserialize_with = "deser_key_from_file"
		)]
		value: SecretString,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		prefix: Option<String>,
	},
	/// AWS SigV4 request signing (bedrock). Credentials may be explicit or
	/// resolved from the ambient environment/IAM.
	#[serde(rename_all = "camelCase")]
	Aws {
		region: String,
		#[serde(
			default,
			serialize_with = "ser_redact",
			deserialize_with = "deser_key_from_file_option",
			skip_serializing_if = "Option::is_none"
		)]
		access_key_id: Option<SecretString>,
		#[serde(
			default,
			serialize_with = "ser_redact",
			deserialize_with = "deser_key_from_file_option",
			skip_serializing_if = "Option::is_none"
		)]
		secret_access_key: Option<SecretString>,
		#[serde(
			default,
			serialize_with = "ser_redact",
			deserialize_with = "deser_key_from_file_option",
			skip_serializing_if = "Option::is_none"
		)]
		session_token: Option<SecretString>,
	},
	/// Forward the caller's own Authorization header.
	Passthrough {},
}

impl Default for AuthConfig {
	fn default() -> Self {
		AuthConfig::None {}
	}
}

// Reload uses descriptor equality to decide whether a provider's runtime
// state can be carried over; secrets must participate.
impl PartialEq for AuthConfig {
	fn eq(&self, other: &Self) -> bool {
		fn secret_eq(a: &SecretString, b: &SecretString) -> bool {
			a.expose_secret() == b.expose_secret()
		}
		fn secret_opt_eq(a: &Option<SecretString>, b: &Option<SecretString>) -> bool {
			match (a, b) {
				(Some(a), Some(b)) => secret_eq(a, b),
				(None, None) => true,
				_ => false,
			}
		}
		match (self, other) {
			(AuthConfig::None {}, AuthConfig::None {}) => true,
			(AuthConfig::Passthrough {}, AuthConfig::Passthrough {}) => true,
			(AuthConfig::Bearer { token: a }, AuthConfig::Bearer { token: b }) => secret_eq(a, b),
			(
				AuthConfig::Header {
					name: an,
					value: av,
					prefix: ap,
				},
				AuthConfig::Header {
					name: bn,
					value: bv,
					prefix: bp,
				},
			) => an == bn && ap == bp && secret_eq(av, bv),
			(
				AuthConfig::Aws {
					region: ar,
					access_key_id: ak,
					secret_access_key: a_secret,
					session_token: at,
				},
				AuthConfig::Aws {
					region: br,
					access_key_id: bk,
					secret_access_key: b_secret,
					session_token: bt,
				},
			) => {
				ar == br && secret_opt_eq(ak, bk) && secret_opt_eq(a_secret, b_secret) && secret_opt_eq(at, bt)
			},
			_ => false,
		}
	}
}

/// Per-million-token pricing, used by cost-based routing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pricing {
	pub input_per_million: f64,
	pub output_per_million: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TimeoutConfig {
	#[serde(default = "default_connect_timeout", with = "serde_dur")]
	pub connect: Duration,
	#[serde(default = "default_request_timeout", with = "serde_dur")]
	pub request: Duration,
}

fn default_connect_timeout() -> Duration {
	Duration::from_secs(10)
}
fn default_request_timeout() -> Duration {
	Duration::from_secs(60)
}

impl Default for TimeoutConfig {
	fn default() -> Self {
		TimeoutConfig {
			connect: default_connect_timeout(),
			request: default_request_timeout(),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RetryConfig {
	/// Additional attempts on the same provider after the first failure.
	#[serde(default = "default_max_retries")]
	pub max_retries: u32,
	#[serde(default = "default_base_delay", with = "serde_dur")]
	pub base_delay: Duration,
	#[serde(default = "default_max_delay", with = "serde_dur")]
	pub max_delay: Duration,
	#[serde(default = "default_multiplier")]
	pub multiplier: f64,
	/// Jitter fraction: the computed delay is scaled by a uniform factor in
	/// `[1 - jitter, 1 + jitter]`.
	#[serde(default = "default_jitter")]
	pub jitter: f64,
}

fn default_max_retries() -> u32 {
	2
}
fn default_base_delay() -> Duration {
	Duration::from_millis(100)
}
fn default_max_delay() -> Duration {
	Duration::from_secs(10)
}
fn default_multiplier() -> f64 {
	2.0
}
fn default_jitter() -> f64 {
	0.25
}

impl Default for RetryConfig {
	fn default() -> Self {
		RetryConfig {
			max_retries: default_max_retries(),
			base_delay: default_base_delay(),
			max_delay: default_max_delay(),
			multiplier: default_multiplier(),
			jitter: default_jitter(),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BreakerConfig {
	/// Consecutive failures before the breaker opens.
	#[serde(default = "default_failure_threshold")]
	pub failure_threshold: u32,
	/// Consecutive half-open successes before the breaker closes.
	#[serde(default = "default_success_threshold")]
	pub success_threshold: u32,
	/// Concurrent probes admitted while half-open.
	#[serde(default = "default_half_open_max")]
	pub half_open_max: u32,
	#[serde(default = "default_cooldown", with = "serde_dur")]
	pub cooldown: Duration,
	/// Cap for the exponentially growing cooldown on repeated re-opens.
	#[serde(default = "default_max_cooldown", with = "serde_dur")]
	pub max_cooldown: Duration,
}

fn default_failure_threshold() -> u32 {
	5
}
fn default_success_threshold() -> u32 {
	3
}
fn default_half_open_max() -> u32 {
	3
}
fn default_cooldown() -> Duration {
	Duration::from_secs(60)
}
fn default_max_cooldown() -> Duration {
	Duration::from_secs(600)
}

impl Default for BreakerConfig {
	fn default() -> Self {
		BreakerConfig {
			failure_threshold: default_failure_threshold(),
			success_threshold: default_success_threshold(),
			half_open_max: default_half_open_max(),
			cooldown: default_cooldown(),
			max_cooldown: default_max_cooldown(),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ProviderDescriptor {
	pub name: Strng,
	pub kind: ProviderKind,
	/// Base URL of the upstream. Defaults per kind.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub endpoint: Option<String>,
	#[serde(default)]
	pub auth: AuthConfig,
	/// Canonical model names this provider serves.
	#[serde(default)]
	pub models: Vec<Strng>,
	/// Pin the upstream model regardless of the requested model.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub model_override: Option<Strng>,
	#[serde(default = "Capability::default_set")]
	pub capabilities: BTreeSet<Capability>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub pricing: Option<Pricing>,
	#[serde(default = "default_weight")]
	pub weight: u32,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub region: Option<Strng>,
	#[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
	pub tags: BTreeMap<String, String>,
	#[serde(default = "default_enabled")]
	pub enabled: bool,
	#[serde(default)]
	pub timeouts: TimeoutConfig,
	#[serde(default)]
	pub retry: RetryConfig,
	#[serde(default)]
	pub breaker: BreakerConfig,
	/// Target p95 latency, used to derive the health status.
	#[serde(default = "default_latency_target", with = "serde_dur")]
	pub latency_target: Duration,
}

fn default_weight() -> u32 {
	1
}
fn default_enabled() -> bool {
	true
}
fn default_latency_target() -> Duration {
	Duration::from_secs(2)
}

impl ProviderDescriptor {
	pub fn base_url(&self) -> &str {
		self
			.endpoint
			.as_deref()
			.unwrap_or_else(|| self.kind.default_endpoint())
	}

	pub fn supports(&self, cap: Capability) -> bool {
		self.capabilities.contains(&cap)
	}

	pub fn serves_model(&self, canonical: &str) -> bool {
		self.models.iter().any(|m| m.as_str() == canonical)
	}

	/// True when `other` addresses the same upstream with the same
	/// resilience parameters, so accumulated breaker and health history
	/// remains meaningful. Routing-only fields (models, capabilities,
	/// pricing, weight, region, tags, retry) are deliberately excluded.
	pub fn same_backend(&self, other: &ProviderDescriptor) -> bool {
		self.kind == other.kind
			&& self.endpoint == other.endpoint
			&& self.auth == other.auth
			&& self.timeouts == other.timeouts
			&& self.breaker == other.breaker
			&& self.latency_target == other.latency_target
	}

	/// Dollar cost estimate for a request of the given token counts; `None`
	/// when the descriptor carries no pricing.
	pub fn estimate_cost(&self, input_tokens: u64, output_tokens: u64) -> Option<f64> {
		let p = self.pricing?;
		Some(
			p.input_per_million * (input_tokens as f64) / 1_000_000.0
				+ p.output_per_million * (output_tokens as f64) / 1_000_000.0,
		)
	}
}
