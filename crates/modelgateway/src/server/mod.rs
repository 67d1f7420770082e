//! The inbound HTTP surface: the OpenAI-compatible completions endpoint,
//! model listing, health probes and the metrics dump.

pub mod auth;
pub mod error;

use axum::Json;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use futures::StreamExt;
use http::{HeaderMap, StatusCode};
use tokio_util::sync::CancellationToken;

use crate::dispatch::{DispatchResult, DispatchedBody, Dispatcher, RequestContext};
use crate::idempotency::{IdempotencyKey, IdempotencyStore, MAX_KEY_LEN, StoredResponse};
use crate::ratelimit::AdmissionSnapshot;
use crate::server::error::ApiError;
use crate::store::Registry;
use crate::stream::StreamFrame;
use crate::types::uniform::*;
use crate::*;

pub const ENDPOINT_CHAT: &str = "/v1/chat/completions";

#[derive(Clone)]
pub struct AppState {
	pub dispatcher: Arc<Dispatcher>,
	pub registry: Arc<Registry>,
	pub idempotency: Arc<dyn IdempotencyStore>,
	pub prometheus: Arc<parking_lot::Mutex<prometheus_client::registry::Registry>>,
	/// Cancelled at forced shutdown; every request's cancel token is a child.
	pub root_cancel: CancellationToken,
}

pub fn router(state: AppState) -> axum::Router {
	axum::Router::new()
		.route(ENDPOINT_CHAT, post(chat_completions))
		.route("/v1/models", get(list_models))
		.route("/health/live", get(health_live))
		.route("/health/ready", get(health_ready))
		.route("/metrics", get(metrics))
		.with_state(state)
}

/// The OpenAI-shaped request body. Unknown fields are rejected rather than
/// silently dropped; known-but-unforwarded knobs are accepted for client
/// compatibility.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
#[allow(dead_code)]
struct CompletionBody {
	model: String,
	messages: Vec<Message>,
	#[serde(default)]
	temperature: Option<f64>,
	#[serde(default)]
	top_p: Option<f64>,
	#[serde(default)]
	max_tokens: Option<u64>,
	#[serde(default)]
	max_completion_tokens: Option<u64>,
	#[serde(default)]
	stop: Option<StopSpec>,
	#[serde(default)]
	stream: Option<bool>,
	#[serde(default)]
	stream_options: Option<serde_json::Value>,
	#[serde(default)]
	tools: Option<Vec<ToolDef>>,
	#[serde(default)]
	tool_choice: Option<serde_json::Value>,
	#[serde(default)]
	n: Option<u32>,
	#[serde(default)]
	user: Option<String>,
	#[serde(default)]
	seed: Option<i64>,
	#[serde(default)]
	frequency_penalty: Option<f64>,
	#[serde(default)]
	presence_penalty: Option<f64>,
	#[serde(default)]
	response_format: Option<serde_json::Value>,
	/// Gateway extension: per-request routing hints.
	#[serde(default)]
	routing: Option<RoutingHints>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StopSpec {
	One(String),
	Many(Vec<String>),
}

impl StopSpec {
	fn into_vec(self) -> Vec<String> {
		match self {
			StopSpec::One(s) => vec![s],
			StopSpec::Many(v) => v,
		}
	}
}

fn request_id_from(headers: &HeaderMap) -> Strng {
	headers
		.get("x-request-id")
		.and_then(|v| v.to_str().ok())
		.filter(|v| !v.is_empty() && v.len() <= 128)
		.map(strng::new)
		.unwrap_or_else(|| strng::new(uuid::Uuid::new_v4().to_string()))
}

fn validate(body: &CompletionBody, request_id: &Strng) -> Result<(), ApiError> {
	if body.messages.is_empty() {
		return Err(ApiError::validation(
			"messages must not be empty",
			"messages",
			request_id.clone(),
		));
	}
	if let Some(t) = body.temperature
		&& !(0.0..=2.0).contains(&t)
	{
		return Err(ApiError::validation(
			"temperature must be within [0, 2]",
			"temperature",
			request_id.clone(),
		));
	}
	if let Some(p) = body.top_p
		&& !(0.0..=1.0).contains(&p)
	{
		return Err(ApiError::validation(
			"top_p must be within [0, 1]",
			"top_p",
			request_id.clone(),
		));
	}
	if let Some(m) = body.max_tokens.or(body.max_completion_tokens)
		&& m == 0
	{
		return Err(ApiError::validation(
			"max_tokens must be at least 1",
			"max_tokens",
			request_id.clone(),
		));
	}
	if let Some(n) = body.n
		&& n != 1
	{
		return Err(ApiError::validation(
			"only n=1 is supported",
			"n",
			request_id.clone(),
		));
	}
	Ok(())
}

fn idempotency_key_from(
	headers: &HeaderMap,
	request_id: &Strng,
) -> Result<Option<String>, ApiError> {
	let Some(value) = headers.get("idempotency-key") else {
		return Ok(None);
	};
	let value = value.to_str().map_err(|_| {
		ApiError::invalid_request("idempotency key must be valid UTF-8", request_id.clone())
	})?;
	if value.is_empty() || value.len() > MAX_KEY_LEN {
		return Err(ApiError::invalid_request(
			format!("idempotency key must be 1..{MAX_KEY_LEN} bytes"),
			request_id.clone(),
		));
	}
	Ok(Some(value.to_string()))
}

fn deadline_from(headers: &HeaderMap, received_at: Instant) -> Option<Instant> {
	let secs = headers
		.get("x-request-timeout")
		.and_then(|v| v.to_str().ok())
		.and_then(|v| v.parse::<u64>().ok())?;
	Some(received_at + Duration::from_secs(secs.clamp(1, 3600)))
}

fn ratelimit_headers(headers: &mut HeaderMap, admission: &AdmissionSnapshot) {
	let mut put = |name: &'static str, value: String| {
		if let Ok(v) = http::HeaderValue::from_str(&value) {
			headers.insert(name, v);
		}
	};
	put("x-ratelimit-limit", admission.limit.to_string());
	put("x-ratelimit-remaining", admission.remaining.to_string());
	put("x-ratelimit-reset", admission.reset.as_secs().to_string());
}

fn request_id_header(headers: &mut HeaderMap, request_id: &Strng) {
	if let Ok(v) = http::HeaderValue::from_str(request_id) {
		headers.insert("x-request-id", v);
	}
}

async fn chat_completions(
	State(state): State<AppState>,
	headers: HeaderMap,
	body: Bytes,
) -> Response {
	let request_id = request_id_from(&headers);
	let received_at = Instant::now();

	let result = handle_chat(&state, &headers, body, &request_id, received_at).await;
	match result {
		Ok(resp) => resp,
		Err(err) => {
			if err.status.is_server_error() {
				error!(request_id = %request_id, status = %err.status, error = %err.message, "request failed");
			} else {
				debug!(request_id = %request_id, status = %err.status, error = %err.message, "request rejected");
			}
			err.into_response()
		},
	}
}

async fn handle_chat(
	state: &AppState,
	headers: &HeaderMap,
	body: Bytes,
	request_id: &Strng,
	received_at: Instant,
) -> Result<Response, ApiError> {
	let identity = auth::extract(headers, request_id)?;

	let parsed: CompletionBody = serde_json::from_slice(&body)
		.map_err(|e| ApiError::invalid_request(format!("invalid request body: {e}"), request_id.clone()))?;
	validate(&parsed, request_id)?;
	let idempotency_key = idempotency_key_from(headers, request_id)?;
	let stream = parsed.stream.unwrap_or(false);

	// Replay a previously stored answer for this (principal, endpoint, key).
	// Streaming responses are never stored, so streams always execute.
	let idem_key = idempotency_key.as_ref().filter(|_| !stream).map(|key| {
		IdempotencyKey {
			principal: identity.principal.clone(),
			endpoint: strng::new(ENDPOINT_CHAT),
			key: key.clone(),
		}
	});
	if let Some(key) = &idem_key
		&& let Some(stored) = state.idempotency.get(key).await
	{
		let mut resp = Response::new(axum::body::Body::from(stored.body));
		*resp.status_mut() =
			StatusCode::from_u16(stored.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
		let h = resp.headers_mut();
		h.insert(
			http::header::CONTENT_TYPE,
			http::HeaderValue::from_static("application/json"),
		);
		h.insert(
			"idempotent-replayed",
			http::HeaderValue::from_static("true"),
		);
		request_id_header(h, request_id);
		return Ok(resp);
	}

	let request = UniformRequest {
		id: request_id.clone(),
		principal: identity.principal.clone(),
		tenant: identity.tenant.clone(),
		model: strng::new(&parsed.model),
		messages: parsed.messages,
		temperature: parsed.temperature,
		top_p: parsed.top_p,
		max_tokens: parsed.max_tokens.or(parsed.max_completion_tokens),
		stop: parsed.stop.map(StopSpec::into_vec).unwrap_or_default(),
		tools: parsed.tools,
		stream,
		deadline: deadline_from(headers, received_at),
		idempotency_key,
		hints: parsed.routing.unwrap_or_default(),
	};

	let ctx = RequestContext {
		request,
		api_key: identity.principal.clone(),
		cancel: state.root_cancel.child_token(),
		received_at,
	};

	let model = strng::new(&parsed.model);
	let DispatchResult { admission, outcome } = state.dispatcher.dispatch(ctx).await;

	let resp = match outcome {
		Ok(DispatchedBody::Complete(response)) => {
			let payload = serde_json::to_vec(&response)
				.map_err(|_| ApiError::internal(request_id.clone()))?;
			if let Some(key) = idem_key {
				state
					.idempotency
					.put(
						key,
						StoredResponse {
							status: 200,
							body: Bytes::from(payload.clone()),
						},
					)
					.await;
			}
			let mut resp = Response::new(axum::body::Body::from(payload));
			let h = resp.headers_mut();
			h.insert(
				http::header::CONTENT_TYPE,
				http::HeaderValue::from_static("application/json"),
			);
			request_id_header(h, request_id);
			if let Some(a) = &admission {
				ratelimit_headers(h, a);
			}
			resp
		},
		Ok(DispatchedBody::Stream(frames)) => {
			let body = axum::body::Body::from_stream(
				frames.map(|f| Ok::<Bytes, std::convert::Infallible>(encode_frame(f))),
			);
			let mut resp = Response::new(body);
			let h = resp.headers_mut();
			h.insert(
				http::header::CONTENT_TYPE,
				http::HeaderValue::from_static("text/event-stream"),
			);
			h.insert(
				http::header::CACHE_CONTROL,
				http::HeaderValue::from_static("no-cache"),
			);
			h.insert(
				http::header::CONNECTION,
				http::HeaderValue::from_static("keep-alive"),
			);
			// Disable proxy buffering for SSE.
			h.insert("x-accel-buffering", http::HeaderValue::from_static("no"));
			request_id_header(h, request_id);
			if let Some(a) = &admission {
				ratelimit_headers(h, a);
			}
			resp
		},
		Err(err) => {
			let api = ApiError::from_dispatch(err, request_id.clone());
			// The admission snapshot still applies to failed requests.
			let mut resp = api.into_response();
			if let Some(a) = &admission {
				ratelimit_headers(resp.headers_mut(), a);
			}
			resp
		},
	};

	state
		.dispatcher
		.metrics
		.requests
		.get_or_create(&crate::telemetry::metrics::RequestLabels {
			provider: None::<&str>.into(),
			model: Some(model.as_str()).into(),
			status: Some(gateway_core::metrics::EncodeDisplay::from(resp.status().as_u16())).into(),
		})
		.inc();
	Ok(resp)
}

/// SSE framing: `data: <json>\n\n` per event, `[DONE]` as the terminator,
/// comment lines as keep-alives.
fn encode_frame(frame: StreamFrame) -> Bytes {
	match frame {
		StreamFrame::Chunk(chunk) => {
			let json = serde_json::to_string(&chunk).unwrap_or_default();
			Bytes::from(format!("data: {json}\n\n"))
		},
		StreamFrame::Error(err) => {
			let json = serde_json::to_string(&err).unwrap_or_default();
			Bytes::from(format!("data: {json}\n\n"))
		},
		StreamFrame::KeepAlive => Bytes::from_static(b": keep-alive\n\n"),
		StreamFrame::Done => Bytes::from_static(b"data: [DONE]\n\n"),
	}
}

#[derive(Debug, Serialize)]
struct ModelEntry {
	id: Strng,
	object: &'static str,
	created: i64,
	owned_by: &'static str,
}

#[derive(Debug, Serialize)]
struct ModelList {
	object: &'static str,
	data: Vec<ModelEntry>,
}

async fn list_models(State(state): State<AppState>) -> Response {
	let snap = state.registry.snapshot();
	let data = snap
		.known_models()
		.into_iter()
		.map(|id| ModelEntry {
			id,
			object: "model",
			created: snap.created_unix,
			owned_by: "modelgateway",
		})
		.collect();
	Json(ModelList {
		object: "list",
		data,
	})
	.into_response()
}

async fn health_live() -> &'static str {
	"ok"
}

async fn health_ready(State(state): State<AppState>) -> Response {
	if state.dispatcher.is_draining() {
		return (StatusCode::SERVICE_UNAVAILABLE, "draining").into_response();
	}
	if state.registry.any_available() {
		(StatusCode::OK, "ready").into_response()
	} else {
		(StatusCode::SERVICE_UNAVAILABLE, "no available providers").into_response()
	}
}

async fn metrics(State(state): State<AppState>) -> Response {
	let mut out = String::new();
	let registry = state.prometheus.lock();
	match prometheus_client::encoding::text::encode(&mut out, &registry) {
		Ok(()) => (
			[(
				http::header::CONTENT_TYPE,
				"application/openmetrics-text; version=1.0.0; charset=utf-8",
			)],
			out,
		)
			.into_response(),
		Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn stop_spec_accepts_both_forms() {
		let one: CompletionBody = serde_json::from_value(serde_json::json!({
			"model": "m", "messages": [{"role": "user", "content": "x"}], "stop": "END"
		}))
		.unwrap();
		assert_eq!(one.stop.map(StopSpec::into_vec).unwrap(), vec!["END"]);

		let many: CompletionBody = serde_json::from_value(serde_json::json!({
			"model": "m", "messages": [{"role": "user", "content": "x"}], "stop": ["a", "b"]
		}))
		.unwrap();
		assert_eq!(many.stop.map(StopSpec::into_vec).unwrap(), vec!["a", "b"]);
	}

	#[test]
	fn unknown_fields_are_rejected() {
		let err = serde_json::from_value::<CompletionBody>(serde_json::json!({
			"model": "m", "messages": [], "bogus": true
		}))
		.unwrap_err();
		assert!(err.to_string().contains("bogus"));
	}

	#[test]
	fn validation_bounds() {
		let body = |v: serde_json::Value| -> CompletionBody { serde_json::from_value(v).unwrap() };
		let rid = strng::new("r");
		assert!(
			validate(
				&body(serde_json::json!({"model": "m", "messages": []})),
				&rid
			)
			.is_err()
		);
		assert!(
			validate(
				&body(serde_json::json!({
					"model": "m",
					"messages": [{"role": "user", "content": "x"}],
					"temperature": 2.5
				})),
				&rid
			)
			.is_err()
		);
		assert!(
			validate(
				&body(serde_json::json!({
					"model": "m",
					"messages": [{"role": "user", "content": "x"}],
					"temperature": 1.0,
					"top_p": 0.5
				})),
				&rid
			)
			.is_ok()
		);
	}

	#[test]
	fn frame_encoding() {
		assert_eq!(
			encode_frame(StreamFrame::Done),
			Bytes::from_static(b"data: [DONE]\n\n")
		);
		assert_eq!(
			encode_frame(StreamFrame::KeepAlive),
			Bytes::from_static(b": keep-alive\n\n")
		);
	}
}
