//! Per-provider HTTP invoker: owns the pooled connection client, injects
//! credentials, applies timeouts, and runs the codec at the wire boundary.
//! Status codes are surfaced as-is; their semantic classification belongs to
//! the dispatch pipeline.

use futures::TryStreamExt;
use secrecy::ExposeSecret;

use crate::llm::{self, AIError, ChunkStream};
use crate::types::provider::{AuthConfig, ProviderDescriptor, ProviderKind};
use crate::types::uniform::*;
use crate::*;

/// The outcome of a successful upstream exchange.
pub enum Invocation {
	Complete(Box<UniformResponse>),
	Stream(ChunkStream),
}

#[derive(thiserror::Error, Debug)]
pub enum CallError {
	#[error("connect failed: {0}")]
	Connect(String),
	#[error("request timed out")]
	Timeout,
	#[error("transport error: {0}")]
	Transport(String),
	#[error("upstream returned {status}: {message}")]
	Status {
		status: http::StatusCode,
		message: String,
		retry_after: Option<Duration>,
	},
	#[error("{0}")]
	Codec(#[from] AIError),
	#[error("authentication setup failed: {0}")]
	Auth(String),
}

/// How the dispatch pipeline should react to a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
	/// Network faults, timeouts, 408/5xx: retry, then fail over.
	Retryable,
	/// Upstream 429: back-pressure; move to the next candidate without
	/// advancing the breaker.
	Throttled,
	/// Client-caused (4xx, unsupported capability): surface immediately.
	Fatal,
}

impl CallError {
	pub fn class(&self) -> FailureClass {
		match self {
			CallError::Connect(_) | CallError::Timeout | CallError::Transport(_) => {
				FailureClass::Retryable
			},
			CallError::Status { status, .. } => match status.as_u16() {
				429 => FailureClass::Throttled,
				408 | 500 | 502 | 503 | 504 => FailureClass::Retryable,
				s if s >= 500 => FailureClass::Retryable,
				_ => FailureClass::Fatal,
			},
			CallError::Codec(e) if e.is_client_error() => FailureClass::Fatal,
			// Decode failures mean the provider sent garbage.
			CallError::Codec(_) => FailureClass::Fatal,
			CallError::Auth(_) => FailureClass::Fatal,
		}
	}

	pub fn retry_after(&self) -> Option<Duration> {
		match self {
			CallError::Status { retry_after, .. } => *retry_after,
			_ => None,
		}
	}
}

const MAX_BODY: usize = 2_097_152;

pub struct ProviderClient {
	desc: Arc<ProviderDescriptor>,
	http: reqwest::Client,
	base: url::Url,
}

impl Debug for ProviderClient {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ProviderClient")
			.field("provider", &self.desc.name)
			.finish()
	}
}

impl ProviderClient {
	pub fn new(desc: Arc<ProviderDescriptor>) -> anyhow::Result<ProviderClient> {
		let base = url::Url::parse(desc.base_url())
			.with_context(|| format!("provider {}: invalid endpoint", desc.name))?;
		let http = reqwest::Client::builder()
			.connect_timeout(desc.timeouts.connect)
			.tcp_keepalive(Duration::from_secs(60))
			.build()
			.context("build http client")?;
		Ok(ProviderClient { desc, http, base })
	}

	fn url_for(&self, path: &str) -> Result<url::Url, CallError> {
		let joined = format!(
			"{}{}",
			self.base.as_str().trim_end_matches('/'),
			path
		);
		url::Url::parse(&joined).map_err(|e| CallError::Transport(e.to_string()))
	}

	/// Invoke the provider for one request attempt. `budget` caps the whole
	/// exchange and is already clamped to the request deadline by the caller.
	/// `passthrough` carries the caller's own credential for descriptors with
	/// passthrough auth.
	pub async fn invoke(
		&self,
		req: &UniformRequest,
		budget: Duration,
		passthrough: Option<&str>,
	) -> Result<Invocation, CallError> {
		let encoded = llm::encode(&self.desc, req)?;
		let url = self.url_for(&encoded.path)?;
		let model = llm::upstream_model(&self.desc, req);

		let mut out = ::http::Request::builder()
			.method(encoded.method.clone())
			.uri(url.as_str())
			.body(encoded.body.clone())
			.map_err(|e| CallError::Transport(e.to_string()))?;
		*out.headers_mut() = encoded.headers;
		if let Some(key) = &req.idempotency_key
			&& let Ok(v) = http::HeaderValue::from_str(key)
		{
			out.headers_mut().insert("idempotency-key", v);
		}
		self.apply_auth(&mut out, passthrough).await?;

		let mut request =
			reqwest::Request::try_from(out).map_err(|e| CallError::Transport(e.to_string()))?;
		// The request timeout covers body consumption too, which would cap
		// legitimate long-lived streams; streaming time-to-first-chunk is
		// bounded by the dispatch pipeline instead.
		if !req.stream {
			*request.timeout_mut() = Some(budget.min(self.desc.timeouts.request));
		}

		let resp = self.http.execute(request).await.map_err(classify_send)?;
		let status = resp.status();
		if !status.is_success() {
			let retry_after = parse_retry_after(resp.headers());
			let body = resp.bytes().await.unwrap_or_default();
			let message = llm::decode_error_message(&self.desc, &body);
			return Err(CallError::Status {
				status,
				message,
				retry_after,
			});
		}

		if req.stream {
			let bytes: llm::ByteStream = Box::pin(
				resp
					.bytes_stream()
					.map_err(std::io::Error::other),
			);
			Ok(Invocation::Stream(llm::decode_stream(
				&self.desc, model, bytes,
			)))
		} else {
			let body = resp
				.bytes()
				.await
				.map_err(|e| CallError::Transport(e.to_string()))?;
			if body.len() > MAX_BODY {
				return Err(CallError::Transport("response body too large".to_string()));
			}
			let decoded = llm::decode_response(&self.desc, model.as_str(), &body)?;
			Ok(Invocation::Complete(Box::new(decoded)))
		}
	}

	/// A cheap reachability check feeding the health tracker.
	pub async fn probe(&self) -> (bool, Duration) {
		let t0 = Instant::now();
		let path = match self.desc.kind {
			ProviderKind::Anthropic => "/v1/models",
			ProviderKind::Google => "/v1beta/models",
			ProviderKind::Ollama => "/api/tags",
			ProviderKind::Bedrock => "/",
			_ => "/v1/models",
		};
		let Ok(url) = self.url_for(path) else {
			return (false, t0.elapsed());
		};
		let res = self
			.http
			.get(url)
			.timeout(self.desc.timeouts.connect)
			.send()
			.await;
		// Any response below 500 proves the endpoint is reachable; auth
		// failures on the probe path are expected.
		let ok = match res {
			Ok(r) => r.status().as_u16() < 500,
			Err(_) => false,
		};
		(ok, t0.elapsed())
	}

	async fn apply_auth(
		&self,
		req: &mut ::http::Request<Bytes>,
		passthrough: Option<&str>,
	) -> Result<(), CallError> {
		match &self.desc.auth {
			AuthConfig::None {} => {},
			AuthConfig::Bearer { token } => {
				self.insert_credential(req, token.expose_secret())?;
			},
			AuthConfig::Header {
				name,
				value,
				prefix,
			} => {
				let rendered = match prefix {
					Some(p) => format!("{p}{}", value.expose_secret()),
					None => value.expose_secret().to_string(),
				};
				let name = http::HeaderName::try_from(name.as_str())
					.map_err(|e| CallError::Auth(e.to_string()))?;
				let mut hv = http::HeaderValue::from_str(&rendered)
					.map_err(|e| CallError::Auth(e.to_string()))?;
				hv.set_sensitive(true);
				req.headers_mut().insert(name, hv);
			},
			AuthConfig::Passthrough {} => {
				let Some(token) = passthrough else {
					return Err(CallError::Auth("no caller credential to pass through".into()));
				};
				self.insert_credential(req, token)?;
			},
			AuthConfig::Aws { .. } => {
				aws::sign_request(req, &self.desc.auth)
					.await
					.map_err(|e| CallError::Auth(e.to_string()))?;
			},
		}
		Ok(())
	}

	/// Bearer-style credential, placed where this provider kind expects it.
	fn insert_credential(
		&self,
		req: &mut ::http::Request<Bytes>,
		token: &str,
	) -> Result<(), CallError> {
		match self.desc.kind {
			ProviderKind::Anthropic => {
				let mut hv = http::HeaderValue::from_str(token)
					.map_err(|e| CallError::Auth(e.to_string()))?;
				hv.set_sensitive(true);
				req.headers_mut().insert("x-api-key", hv);
			},
			ProviderKind::Google => {
				let mut hv = http::HeaderValue::from_str(token)
					.map_err(|e| CallError::Auth(e.to_string()))?;
				hv.set_sensitive(true);
				req.headers_mut().insert("x-goog-api-key", hv);
			},
			_ => {
				let mut hv = http::HeaderValue::from_str(&format!("Bearer {token}"))
					.map_err(|e| CallError::Auth(e.to_string()))?;
				hv.set_sensitive(true);
				req.headers_mut().insert(http::header::AUTHORIZATION, hv);
			},
		}
		Ok(())
	}
}

fn classify_send(e: reqwest::Error) -> CallError {
	if e.is_timeout() {
		CallError::Timeout
	} else if e.is_connect() {
		CallError::Connect(e.to_string())
	} else {
		CallError::Transport(e.to_string())
	}
}

fn parse_retry_after(headers: &http::HeaderMap) -> Option<Duration> {
	let value = headers.get(http::header::RETRY_AFTER)?.to_str().ok()?;
	value.parse::<u64>().ok().map(Duration::from_secs)
}

mod aws {
	use std::time::SystemTime;

	use aws_config::BehaviorVersion;
	use aws_credential_types::Credentials;
	use aws_credential_types::provider::ProvideCredentials;
	use aws_sigv4::http_request::{SignableBody, SignableRequest, SigningSettings, sign};
	use aws_sigv4::sign::v4::SigningParams;
	use secrecy::ExposeSecret;
	use tokio::sync::OnceCell;

	use crate::types::provider::AuthConfig;
	use crate::*;

	pub async fn sign_request(
		req: &mut ::http::Request<Bytes>,
		auth: &AuthConfig,
	) -> anyhow::Result<()> {
		let AuthConfig::Aws {
			region,
			access_key_id,
			secret_access_key,
			session_token,
		} = auth
		else {
			anyhow::bail!("not aws auth");
		};
		let creds = match (access_key_id, secret_access_key) {
			(Some(id), Some(secret)) => {
				let mut builder = Credentials::builder()
					.access_key_id(id.expose_secret())
					.secret_access_key(secret.expose_secret())
					.provider_name("static");
				if let Some(token) = session_token {
					builder = builder.session_token(token.expose_secret());
				}
				builder.build()
			},
			_ => ambient_credentials().await?,
		};
		let identity = creds.into();

		let signing_params: aws_sigv4::http_request::SigningParams = SigningParams::builder()
			.identity(&identity)
			.region(region)
			.name("bedrock")
			.time(SystemTime::now())
			.settings(SigningSettings::default())
			.build()?
			.into();

		let signable = SignableRequest::new(
			req.method().as_str(),
			req.uri().to_string(),
			req
				.headers()
				.iter()
				.filter(|(k, _)| *k != http::header::CONTENT_LENGTH)
				.filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str(), v))),
			SignableBody::Bytes(req.body().as_ref()),
		)?;

		let (instructions, _signature) = sign(signable, &signing_params)?.into_parts();
		instructions.apply_to_request_http1x(req);
		Ok(())
	}

	static SDK_CONFIG: OnceCell<aws_config::SdkConfig> = OnceCell::const_new();

	async fn ambient_credentials() -> anyhow::Result<Credentials> {
		let config = SDK_CONFIG
			.get_or_init(|| async { aws_config::load_defaults(BehaviorVersion::latest()).await })
			.await;
		Ok(
			config
				.credentials_provider()
				.context("no ambient AWS credentials")?
				.provide_credentials()
				.await?,
		)
	}
}
