//! The client-facing error envelope. Shape and status mapping are part of
//! the API contract and must not drift:
//!
//! ```json
//! {"error": {"type": "...", "message": "...", "code": "...", "param": null, "request_id": "..."}}
//! ```

use axum::Json;
use axum::response::{IntoResponse, Response};
use http::StatusCode;

use crate::client::CallError;
use crate::dispatch::DispatchError;
use crate::route::RouteError;
use crate::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorTaxon {
	InvalidRequest,
	Authentication,
	Permission,
	NotFound,
	RateLimit,
	Provider,
	Internal,
	Timeout,
	Conflict,
}

impl ErrorTaxon {
	pub fn as_str(&self) -> &'static str {
		match self {
			ErrorTaxon::InvalidRequest => "invalid_request_error",
			ErrorTaxon::Authentication => "authentication_error",
			ErrorTaxon::Permission => "permission_error",
			ErrorTaxon::NotFound => "not_found_error",
			ErrorTaxon::RateLimit => "rate_limit_error",
			ErrorTaxon::Provider => "provider_error",
			ErrorTaxon::Internal => "internal_error",
			ErrorTaxon::Timeout => "timeout_error",
			ErrorTaxon::Conflict => "conflict_error",
		}
	}
}

#[derive(Debug)]
pub struct ApiError {
	pub status: StatusCode,
	pub taxon: ErrorTaxon,
	pub message: String,
	pub code: Option<String>,
	pub param: Option<String>,
	pub request_id: Strng,
	pub retry_after: Option<u64>,
	/// `(limit, remaining, reset-seconds)` for the `X-RateLimit-*` headers.
	pub ratelimit: Option<(u64, u64, u64)>,
}

impl ApiError {
	pub fn new(
		status: StatusCode,
		taxon: ErrorTaxon,
		message: impl Into<String>,
		request_id: Strng,
	) -> ApiError {
		ApiError {
			status,
			taxon,
			message: message.into(),
			code: None,
			param: None,
			request_id,
			retry_after: None,
			ratelimit: None,
		}
	}

	pub fn with_code(mut self, code: &str) -> ApiError {
		self.code = Some(code.to_string());
		self
	}

	pub fn with_param(mut self, param: &str) -> ApiError {
		self.param = Some(param.to_string());
		self
	}

	pub fn with_retry_after(mut self, secs: u64) -> ApiError {
		self.retry_after = Some(secs);
		self
	}

	pub fn invalid_request(message: impl Into<String>, request_id: Strng) -> ApiError {
		ApiError::new(
			StatusCode::BAD_REQUEST,
			ErrorTaxon::InvalidRequest,
			message,
			request_id,
		)
	}

	pub fn validation(message: impl Into<String>, param: &str, request_id: Strng) -> ApiError {
		ApiError::new(
			StatusCode::UNPROCESSABLE_ENTITY,
			ErrorTaxon::InvalidRequest,
			message,
			request_id,
		)
		.with_param(param)
	}

	pub fn unauthenticated(message: impl Into<String>, request_id: Strng) -> ApiError {
		ApiError::new(
			StatusCode::UNAUTHORIZED,
			ErrorTaxon::Authentication,
			message,
			request_id,
		)
	}

	pub fn internal(request_id: Strng) -> ApiError {
		// Never leak internals to the caller.
		ApiError::new(
			StatusCode::INTERNAL_SERVER_ERROR,
			ErrorTaxon::Internal,
			"internal error",
			request_id,
		)
	}

	pub fn from_dispatch(err: DispatchError, request_id: Strng) -> ApiError {
		match err {
			DispatchError::RateLimited(denied) => {
				let mut err = ApiError::new(
					StatusCode::TOO_MANY_REQUESTS,
					ErrorTaxon::RateLimit,
					format!("rate limit exceeded for scope {}", denied.scope.as_str()),
					request_id,
				)
				.with_code("rate_limited")
				.with_retry_after(denied.retry_after.as_secs().max(1));
				err.ratelimit = Some((denied.limit, denied.remaining, denied.reset.as_secs()));
				err
			},
			DispatchError::Draining => ApiError::new(
				StatusCode::SERVICE_UNAVAILABLE,
				ErrorTaxon::Provider,
				"gateway is draining",
				request_id,
			)
			.with_code("draining")
			.with_retry_after(30),
			DispatchError::Route(route) => ApiError::from_route(route, request_id),
			DispatchError::DeadlineExceeded => ApiError::new(
				StatusCode::GATEWAY_TIMEOUT,
				ErrorTaxon::Timeout,
				"request deadline exceeded",
				request_id,
			)
			.with_code("deadline_exceeded"),
			DispatchError::Cancelled => ApiError::new(
				StatusCode::REQUEST_TIMEOUT,
				ErrorTaxon::Timeout,
				"client disconnected",
				request_id,
			)
			.with_code("client_disconnected"),
			DispatchError::Upstream { provider, error } => {
				ApiError::from_call_error(&provider, error, request_id)
			},
			DispatchError::AllProvidersFailed { attempts } => {
				let all_breaker_gated = !attempts.is_empty()
					&& attempts
						.iter()
						.all(|a| a.error.starts_with("circuit breaker"));
				let detail = attempts
					.iter()
					.map(|a| format!("{}: {}", a.provider, a.error))
					.collect::<Vec<_>>()
					.join("; ");
				if all_breaker_gated {
					ApiError::new(
						StatusCode::SERVICE_UNAVAILABLE,
						ErrorTaxon::Provider,
						format!("all providers unavailable: {detail}"),
						request_id,
					)
					.with_code("circuit_breaker_open")
					.with_retry_after(30)
				} else {
					ApiError::new(
						StatusCode::BAD_GATEWAY,
						ErrorTaxon::Provider,
						format!("all providers failed: {detail}"),
						request_id,
					)
					.with_code("all_providers_failed")
				}
			},
		}
	}

	fn from_route(err: RouteError, request_id: Strng) -> ApiError {
		match err {
			RouteError::ModelNotFound(model) => ApiError::new(
				StatusCode::NOT_FOUND,
				ErrorTaxon::NotFound,
				format!("model {model} is not served by any provider"),
				request_id,
			)
			.with_code("model_not_found")
			.with_param("model"),
			RouteError::UnsupportedCapability(cap) => ApiError::new(
				StatusCode::BAD_REQUEST,
				ErrorTaxon::InvalidRequest,
				format!("no provider for this model supports {cap}"),
				request_id,
			)
			.with_code("unsupported_capability"),
			RouteError::NoCandidates => ApiError::new(
				StatusCode::SERVICE_UNAVAILABLE,
				ErrorTaxon::Provider,
				"no candidate providers available",
				request_id,
			)
			.with_code("no_candidates")
			.with_retry_after(30),
		}
	}

	fn from_call_error(provider: &Strng, error: CallError, request_id: Strng) -> ApiError {
		match error {
			CallError::Timeout => ApiError::new(
				StatusCode::GATEWAY_TIMEOUT,
				ErrorTaxon::Timeout,
				format!("provider {provider} timed out"),
				request_id,
			)
			.with_code("upstream_timeout"),
			CallError::Status {
				status, message, ..
			} => match status.as_u16() {
				// Parameter/model problems from the upstream are the
				// caller's to fix; propagate the status.
				400 | 404 | 422 => ApiError::new(
					status,
					if status == StatusCode::NOT_FOUND {
						ErrorTaxon::NotFound
					} else {
						ErrorTaxon::InvalidRequest
					},
					message,
					request_id,
				)
				.with_code("upstream_rejected"),
				// Bad gateway credentials are an operator problem, not the
				// caller's; do not relay the 401/403.
				401 | 403 => ApiError::new(
					StatusCode::BAD_GATEWAY,
					ErrorTaxon::Provider,
					format!("provider {provider} rejected gateway credentials"),
					request_id,
				)
				.with_code("upstream_auth"),
				409 => ApiError::new(
					StatusCode::CONFLICT,
					ErrorTaxon::Conflict,
					message,
					request_id,
				)
				.with_code("upstream_conflict"),
				_ => ApiError::new(
					StatusCode::BAD_GATEWAY,
					ErrorTaxon::Provider,
					format!("provider {provider}: {message}"),
					request_id,
				)
				.with_code("upstream_error"),
			},
			CallError::Codec(e) if e.is_client_error() => ApiError::new(
				StatusCode::BAD_REQUEST,
				ErrorTaxon::InvalidRequest,
				e.to_string(),
				request_id,
			)
			.with_code("unsupported_request"),
			CallError::Codec(e) => ApiError::new(
				StatusCode::BAD_GATEWAY,
				ErrorTaxon::Provider,
				format!("provider {provider} returned an unreadable response: {e}"),
				request_id,
			)
			.with_code("upstream_malformed"),
			other => ApiError::new(
				StatusCode::BAD_GATEWAY,
				ErrorTaxon::Provider,
				format!("provider {provider}: {other}"),
				request_id,
			)
			.with_code("upstream_unreachable"),
		}
	}
}

#[derive(Debug, Serialize)]
struct Envelope<'a> {
	error: EnvelopeBody<'a>,
}

#[derive(Debug, Serialize)]
struct EnvelopeBody<'a> {
	r#type: &'a str,
	message: &'a str,
	code: Option<&'a str>,
	param: Option<&'a str>,
	request_id: &'a str,
}

impl IntoResponse for ApiError {
	fn into_response(self) -> Response {
		let body = Envelope {
			error: EnvelopeBody {
				r#type: self.taxon.as_str(),
				message: &self.message,
				code: self.code.as_deref(),
				param: self.param.as_deref(),
				request_id: &self.request_id,
			},
		};
		let mut resp = (self.status, Json(&body)).into_response();
		let headers = resp.headers_mut();
		if let Ok(v) = http::HeaderValue::from_str(&self.request_id) {
			headers.insert("x-request-id", v);
		}
		if let Some(secs) = self.retry_after
			&& let Ok(v) = http::HeaderValue::from_str(&secs.to_string())
		{
			headers.insert(http::header::RETRY_AFTER, v);
		}
		if let Some((limit, remaining, reset)) = self.ratelimit {
			let mut put = |name: &'static str, value: String| {
				if let Ok(v) = http::HeaderValue::from_str(&value) {
					headers.insert(name, v);
				}
			};
			put("x-ratelimit-limit", limit.to_string());
			put("x-ratelimit-remaining", remaining.to_string());
			put("x-ratelimit-reset", reset.to_string());
		}
		resp
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ratelimit::{RateLimited, Scope};

	#[test]
	fn envelope_shape_is_exact() {
		let err = ApiError::invalid_request("bad body", strng::new("req-1")).with_param("messages");
		let body = serde_json::json!({
			"error": {
				"type": "invalid_request_error",
				"message": "bad body",
				"code": null,
				"param": "messages",
				"request_id": "req-1",
			}
		});
		let rendered = serde_json::to_value(Envelope {
			error: EnvelopeBody {
				r#type: err.taxon.as_str(),
				message: &err.message,
				code: err.code.as_deref(),
				param: err.param.as_deref(),
				request_id: &err.request_id,
			},
		})
		.unwrap();
		assert_eq!(rendered, body);
	}

	#[test]
	fn rate_limit_maps_to_429_with_retry_after() {
		let err = ApiError::from_dispatch(
			DispatchError::RateLimited(RateLimited {
				scope: Scope::ApiKey,
				retry_after: Duration::from_secs(6),
				limit: 10,
				remaining: 0,
				reset: Duration::from_secs(60),
			}),
			strng::new("r"),
		);
		assert_eq!(err.status, StatusCode::TOO_MANY_REQUESTS);
		assert_eq!(err.taxon, ErrorTaxon::RateLimit);
		assert_eq!(err.retry_after, Some(6));
	}

	#[test]
	fn breaker_gated_maps_to_503() {
		let err = ApiError::from_dispatch(
			DispatchError::AllProvidersFailed {
				attempts: vec![crate::dispatch::Attempt {
					provider: strng::new("p1"),
					error: "circuit breaker open, retry in 60s".to_string(),
					status: None,
				}],
			},
			strng::new("r"),
		);
		assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
		assert_eq!(err.code.as_deref(), Some("circuit_breaker_open"));
		assert!(err.retry_after.is_some());
	}

	#[test]
	fn upstream_timeout_maps_to_504() {
		let err = ApiError::from_dispatch(
			DispatchError::Upstream {
				provider: strng::new("p1"),
				error: CallError::Timeout,
			},
			strng::new("r"),
		);
		assert_eq!(err.status, StatusCode::GATEWAY_TIMEOUT);
		assert_eq!(err.taxon, ErrorTaxon::Timeout);
	}

	#[test]
	fn model_not_found_maps_to_404() {
		let err = ApiError::from_dispatch(
			DispatchError::Route(RouteError::ModelNotFound(strng::new("nope"))),
			strng::new("r"),
		);
		assert_eq!(err.status, StatusCode::NOT_FOUND);
		assert_eq!(err.taxon, ErrorTaxon::NotFound);
	}
}
