use std::sync::Arc;

use axum::Router;
use http_body_util::BodyExt;
use modelgateway::config::parse_config;
use modelgateway::dispatch::Dispatcher;
use modelgateway::idempotency::MemoryIdempotencyStore;
use modelgateway::ratelimit::RateLimiter;
use modelgateway::server::{self, AppState};
use modelgateway::store::Registry;
use modelgateway::telemetry::metrics::Metrics;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

pub struct TestGateway {
	pub router: Router,
	pub registry: Arc<Registry>,
	pub dispatcher: Arc<Dispatcher>,
}

/// Assemble the gateway exactly as the binary does, minus the listener and
/// background tasks.
pub fn gateway(cfg_yaml: &str) -> TestGateway {
	let cfg = parse_config(cfg_yaml).expect("test config");
	let registry = Arc::new(Registry::new(&cfg).expect("registry"));
	let mut prometheus = prometheus_client::registry::Registry::default();
	let metrics = Arc::new(Metrics::new(&mut prometheus));
	let limiter = Arc::new(RateLimiter::new(cfg.limits.clone()));
	let dispatcher = Arc::new(Dispatcher::new(
		registry.clone(),
		limiter,
		metrics,
		cfg.coupler,
	));
	let idempotency = Arc::new(MemoryIdempotencyStore::new(cfg.idempotency_window));
	let state = AppState {
		dispatcher: dispatcher.clone(),
		registry: registry.clone(),
		idempotency,
		prometheus: Arc::new(parking_lot::Mutex::new(prometheus)),
		root_cancel: CancellationToken::new(),
	};
	TestGateway {
		router: server::router(state),
		registry,
		dispatcher,
	}
}

pub fn chat_body(model: &str, stream: bool) -> Value {
	json!({
		"model": model,
		"messages": [{"role": "user", "content": "Say hi"}],
		"stream": stream,
	})
}

pub fn chat_request(body: &Value) -> http::Request<axum::body::Body> {
	http::Request::builder()
		.method("POST")
		.uri("/v1/chat/completions")
		.header("authorization", "Bearer sk-test-key")
		.header("content-type", "application/json")
		.body(axum::body::Body::from(body.to_string()))
		.unwrap()
}

pub async fn read_body(resp: axum::response::Response) -> bytes::Bytes {
	resp.into_body().collect().await.unwrap().to_bytes()
}

pub async fn read_json(resp: axum::response::Response) -> Value {
	let bytes = read_body(resp).await;
	serde_json::from_slice(&bytes).unwrap()
}

/// The canned upstream answer used by the happy-path scenarios.
pub fn openai_completion() -> Value {
	json!({
		"id": "chatcmpl-123",
		"object": "chat.completion",
		"created": 1700000000,
		"model": "gpt-4o",
		"choices": [{
			"index": 0,
			"message": {"role": "assistant", "content": "Hi"},
			"finish_reason": "stop"
		}],
		"usage": {"prompt_tokens": 5, "completion_tokens": 1, "total_tokens": 6}
	})
}
