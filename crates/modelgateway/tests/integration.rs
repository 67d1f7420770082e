mod common;

use common::*;
use serde_json::json;
use tower::util::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn single_provider_config(endpoint: &str, extra: &str) -> String {
	format!(
		r#"
providers:
  - name: p1
    kind: openai-compatible
    endpoint: {endpoint}
    models: [gpt-4o]
    retry:
      maxRetries: 0
      baseDelay: 5ms
      maxDelay: 50ms
      multiplier: 2.0
      jitter: 0.0
{extra}
"#
	)
}

async fn mock_completions(server: &MockServer, template: ResponseTemplate, expect: u64) {
	Mock::given(method("POST"))
		.and(path("/v1/chat/completions"))
		.respond_with(template)
		.expect(expect)
		.mount(server)
		.await;
}

#[tokio::test]
async fn primary_succeeds() {
	let upstream = MockServer::start().await;
	mock_completions(
		&upstream,
		ResponseTemplate::new(200).set_body_json(openai_completion()),
		1,
	)
	.await;

	let gw = gateway(&single_provider_config(&upstream.uri(), ""));
	let resp = gw
		.router
		.clone()
		.oneshot(chat_request(&chat_body("gpt-4o", false)))
		.await
		.unwrap();

	assert_eq!(resp.status(), 200);
	assert!(resp.headers().contains_key("x-request-id"));
	let body = read_json(resp).await;
	assert_eq!(body["choices"][0]["message"]["content"], "Hi");
	assert_eq!(body["usage"]["total_tokens"], 6);

	let snap = gw.registry.snapshot();
	let p1 = snap.by_name.get("p1").unwrap();
	assert_eq!(p1.inflight_count(), 0);
	assert_eq!(p1.breaker.consecutive_successes(), 1);
	assert_eq!(
		p1.breaker.state(),
		modelgateway::breaker::BreakerState::Closed
	);
}

#[tokio::test]
async fn failing_primary_fails_over_to_secondary() {
	let p1 = MockServer::start().await;
	let p2 = MockServer::start().await;
	// P1 returns 502 on every attempt: initial try plus two retries.
	mock_completions(&p1, ResponseTemplate::new(502).set_body_string("bad gateway"), 3).await;
	mock_completions(
		&p2,
		ResponseTemplate::new(200).set_body_json(openai_completion()),
		1,
	)
	.await;

	let cfg = format!(
		r#"
providers:
  - name: p1
    kind: openai-compatible
    endpoint: {}
    models: [gpt-4o]
    retry:
      maxRetries: 2
      baseDelay: 5ms
      maxDelay: 50ms
      multiplier: 2.0
      jitter: 0.0
  - name: p2
    kind: openai-compatible
    endpoint: {}
    models: [gpt-4o]
    retry:
      maxRetries: 0
      baseDelay: 5ms
      maxDelay: 50ms
      multiplier: 2.0
      jitter: 0.0
"#,
		p1.uri(),
		p2.uri()
	);
	let gw = gateway(&cfg);
	let resp = gw
		.router
		.clone()
		.oneshot(chat_request(&chat_body("gpt-4o", false)))
		.await
		.unwrap();

	assert_eq!(resp.status(), 200);
	let body = read_json(resp).await;
	assert_eq!(body["choices"][0]["message"]["content"], "Hi");

	// Three failures recorded, below the default threshold of five.
	let snap = gw.registry.snapshot();
	let h1 = snap.by_name.get("p1").unwrap();
	assert_eq!(h1.breaker.consecutive_failures(), 3);
	assert_eq!(
		h1.breaker.state(),
		modelgateway::breaker::BreakerState::Closed
	);
	p1.verify().await;
	p2.verify().await;
}

#[tokio::test]
async fn breaker_opens_after_consecutive_failures() {
	let upstream = MockServer::start().await;
	// Exactly five upstream calls: the breaker opens at the threshold and
	// the sixth request is denied without contacting the provider.
	mock_completions(&upstream, ResponseTemplate::new(500).set_body_string("boom"), 5).await;

	let gw = gateway(&single_provider_config(&upstream.uri(), ""));
	for _ in 0..5 {
		let resp = gw
			.router
			.clone()
			.oneshot(chat_request(&chat_body("gpt-4o", false)))
			.await
			.unwrap();
		assert_eq!(resp.status(), 502);
	}

	let snap = gw.registry.snapshot();
	let p1 = snap.by_name.get("p1").unwrap();
	assert_eq!(p1.breaker.state(), modelgateway::breaker::BreakerState::Open);

	let resp = gw
		.router
		.clone()
		.oneshot(chat_request(&chat_body("gpt-4o", false)))
		.await
		.unwrap();
	assert_eq!(resp.status(), 503);
	assert!(resp.headers().contains_key("retry-after"));
	let body = read_json(resp).await;
	assert_eq!(body["error"]["code"], "circuit_breaker_open");
	upstream.verify().await;
}

#[tokio::test]
async fn rate_limited_request_never_reaches_provider() {
	let upstream = MockServer::start().await;
	mock_completions(
		&upstream,
		ResponseTemplate::new(200).set_body_json(openai_completion()),
		10,
	)
	.await;

	// Bucket of 10, refilling 10 per minute.
	let extra = r#"
limits:
  - scope: api-key
    capacity: 10
    refillRate: 0.16666666666666666
"#;
	let gw = gateway(&single_provider_config(&upstream.uri(), extra));
	for _ in 0..10 {
		let resp = gw
			.router
			.clone()
			.oneshot(chat_request(&chat_body("gpt-4o", false)))
			.await
			.unwrap();
		assert_eq!(resp.status(), 200);
	}
	let resp = gw
		.router
		.clone()
		.oneshot(chat_request(&chat_body("gpt-4o", false)))
		.await
		.unwrap();
	assert_eq!(resp.status(), 429);
	assert_eq!(resp.headers().get("retry-after").unwrap(), "6");
	let body = read_json(resp).await;
	assert_eq!(body["error"]["type"], "rate_limit_error");
	upstream.verify().await;
}

#[tokio::test]
async fn streaming_end_to_end() {
	let upstream = MockServer::start().await;
	let chunk = |content: &str| {
		json!({
			"id": "chatcmpl-1",
			"object": "chat.completion.chunk",
			"created": 1700000000,
			"model": "gpt-4o",
			"choices": [{"index": 0, "delta": {"content": content}, "finish_reason": null}]
		})
	};
	let terminal = json!({
		"id": "chatcmpl-1",
		"object": "chat.completion.chunk",
		"created": 1700000000,
		"model": "gpt-4o",
		"choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}],
		"usage": {"prompt_tokens": 5, "completion_tokens": 2, "total_tokens": 7}
	});
	let sse = format!(
		"data: {}\n\ndata: {}\n\ndata: {}\n\ndata: [DONE]\n\n",
		chunk("He"),
		chunk("y"),
		terminal
	);
	mock_completions(
		&upstream,
		ResponseTemplate::new(200).set_body_raw(sse.into_bytes(), "text/event-stream"),
		1,
	)
	.await;

	let gw = gateway(&single_provider_config(&upstream.uri(), ""));
	let resp = gw
		.router
		.clone()
		.oneshot(chat_request(&chat_body("gpt-4o", true)))
		.await
		.unwrap();

	assert_eq!(resp.status(), 200);
	assert_eq!(
		resp.headers().get("content-type").unwrap(),
		"text/event-stream"
	);
	assert_eq!(resp.headers().get("cache-control").unwrap(), "no-cache");
	let body = String::from_utf8(read_body(resp).await.to_vec()).unwrap();
	let events: Vec<&str> = body
		.split("\n\n")
		.filter(|s| s.starts_with("data: "))
		.collect();
	assert_eq!(events.len(), 4);
	assert!(events[0].contains("\"He\""));
	assert!(events[1].contains("\"y\""));
	assert!(events[2].contains("\"finish_reason\":\"stop\""));
	assert_eq!(events[3], "data: [DONE]");

	// The stream settled the provider accounting on completion.
	let snap = gw.registry.snapshot();
	let p1 = snap.by_name.get("p1").unwrap();
	assert_eq!(p1.inflight_count(), 0);
	assert_eq!(p1.breaker.consecutive_successes(), 1);
}

#[tokio::test]
async fn idempotent_replay_returns_first_response() {
	let upstream = MockServer::start().await;
	// The provider must only be called once for the two identical posts.
	mock_completions(
		&upstream,
		ResponseTemplate::new(200).set_body_json(openai_completion()),
		1,
	)
	.await;

	let gw = gateway(&single_provider_config(&upstream.uri(), ""));
	let body = chat_body("gpt-4o", false);
	let with_key = |body: &serde_json::Value| {
		let mut req = chat_request(body);
		req.headers_mut().insert(
			"idempotency-key",
			http::HeaderValue::from_static("order-42"),
		);
		req
	};

	let first = gw.router.clone().oneshot(with_key(&body)).await.unwrap();
	assert_eq!(first.status(), 200);
	assert!(first.headers().get("idempotent-replayed").is_none());
	let first_body = read_body(first).await;

	let second = gw.router.clone().oneshot(with_key(&body)).await.unwrap();
	assert_eq!(second.status(), 200);
	assert_eq!(second.headers().get("idempotent-replayed").unwrap(), "true");
	let second_body = read_body(second).await;
	assert_eq!(first_body, second_body);
	upstream.verify().await;
}

#[tokio::test]
async fn upstream_429_tries_next_candidate_without_breaker_advance() {
	let p1 = MockServer::start().await;
	let p2 = MockServer::start().await;
	mock_completions(
		&p1,
		ResponseTemplate::new(429)
			.insert_header("retry-after", "7")
			.set_body_string("slow down"),
		1,
	)
	.await;
	mock_completions(
		&p2,
		ResponseTemplate::new(200).set_body_json(openai_completion()),
		1,
	)
	.await;

	let cfg = format!(
		r#"
providers:
  - name: p1
    kind: openai-compatible
    endpoint: {}
    models: [gpt-4o]
  - name: p2
    kind: openai-compatible
    endpoint: {}
    models: [gpt-4o]
"#,
		p1.uri(),
		p2.uri()
	);
	let gw = gateway(&cfg);
	let resp = gw
		.router
		.clone()
		.oneshot(chat_request(&chat_body("gpt-4o", false)))
		.await
		.unwrap();
	assert_eq!(resp.status(), 200);

	// Back-pressure does not advance the breaker.
	let snap = gw.registry.snapshot();
	let h1 = snap.by_name.get("p1").unwrap();
	assert_eq!(h1.breaker.consecutive_failures(), 0);
	p1.verify().await;
	p2.verify().await;
}

#[tokio::test]
async fn upstream_auth_failure_counts_against_the_provider() {
	let upstream = MockServer::start().await;
	mock_completions(
		&upstream,
		ResponseTemplate::new(401).set_body_string("invalid api key"),
		1,
	)
	.await;

	let gw = gateway(&single_provider_config(&upstream.uri(), ""));
	let resp = gw
		.router
		.clone()
		.oneshot(chat_request(&chat_body("gpt-4o", false)))
		.await
		.unwrap();
	// Bad gateway credentials are surfaced as a provider fault, not relayed
	// as a caller auth error, and the breaker must see the failure.
	assert_eq!(resp.status(), 502);
	let body = read_json(resp).await;
	assert_eq!(body["error"]["code"], "upstream_auth");

	let snap = gw.registry.snapshot();
	let p1 = snap.by_name.get("p1").unwrap();
	assert_eq!(p1.breaker.consecutive_failures(), 1);
}

#[tokio::test]
async fn unknown_model_is_404() {
	let gw = gateway(
		r#"
providers:
  - name: p1
    kind: openai-compatible
    models: [gpt-4o]
"#,
	);
	let resp = gw
		.router
		.clone()
		.oneshot(chat_request(&chat_body("unknown-model", false)))
		.await
		.unwrap();
	assert_eq!(resp.status(), 404);
	let body = read_json(resp).await;
	assert_eq!(body["error"]["type"], "not_found_error");
	assert_eq!(body["error"]["code"], "model_not_found");
	assert!(body["error"]["request_id"].is_string());
}

#[tokio::test]
async fn missing_auth_is_401() {
	let gw = gateway(
		r#"
providers:
  - name: p1
    kind: openai-compatible
    models: [gpt-4o]
"#,
	);
	let req = http::Request::builder()
		.method("POST")
		.uri("/v1/chat/completions")
		.header("content-type", "application/json")
		.body(axum::body::Body::from(chat_body("gpt-4o", false).to_string()))
		.unwrap();
	let resp = gw.router.clone().oneshot(req).await.unwrap();
	assert_eq!(resp.status(), 401);
	let body = read_json(resp).await;
	assert_eq!(body["error"]["type"], "authentication_error");
}

#[tokio::test]
async fn models_endpoint_lists_configured_models() {
	let gw = gateway(
		r#"
providers:
  - name: p1
    kind: openai-compatible
    models: [gpt-4o, gpt-4o-mini]
  - name: p2
    kind: anthropic
    models: [claude-3-5-sonnet]
"#,
	);
	let req = http::Request::builder()
		.uri("/v1/models")
		.body(axum::body::Body::empty())
		.unwrap();
	let resp = gw.router.clone().oneshot(req).await.unwrap();
	assert_eq!(resp.status(), 200);
	let body = read_json(resp).await;
	assert_eq!(body["object"], "list");
	let ids: Vec<&str> = body["data"]
		.as_array()
		.unwrap()
		.iter()
		.map(|m| m["id"].as_str().unwrap())
		.collect();
	assert_eq!(ids, vec!["claude-3-5-sonnet", "gpt-4o", "gpt-4o-mini"]);
	assert_eq!(body["data"][0]["object"], "model");
}

#[tokio::test]
async fn health_endpoints() {
	let gw = gateway(
		r#"
providers:
  - name: p1
    kind: openai-compatible
    models: [gpt-4o]
"#,
	);
	let live = gw
		.router
		.clone()
		.oneshot(
			http::Request::builder()
				.uri("/health/live")
				.body(axum::body::Body::empty())
				.unwrap(),
		)
		.await
		.unwrap();
	assert_eq!(live.status(), 200);

	let ready = gw
		.router
		.clone()
		.oneshot(
			http::Request::builder()
				.uri("/health/ready")
				.body(axum::body::Body::empty())
				.unwrap(),
		)
		.await
		.unwrap();
	assert_eq!(ready.status(), 200);

	// Draining flips readiness and rejects new work with 503.
	gw.dispatcher.start_draining();
	let ready = gw
		.router
		.clone()
		.oneshot(
			http::Request::builder()
				.uri("/health/ready")
				.body(axum::body::Body::empty())
				.unwrap(),
		)
		.await
		.unwrap();
	assert_eq!(ready.status(), 503);

	let rejected = gw
		.router
		.clone()
		.oneshot(chat_request(&chat_body("gpt-4o", false)))
		.await
		.unwrap();
	assert_eq!(rejected.status(), 503);
}

#[tokio::test]
async fn validation_failures_are_422() {
	let gw = gateway(
		r#"
providers:
  - name: p1
    kind: openai-compatible
    models: [gpt-4o]
"#,
	);
	let body = json!({
		"model": "gpt-4o",
		"messages": [{"role": "user", "content": "hi"}],
		"temperature": 9.0,
	});
	let resp = gw.router.clone().oneshot(chat_request(&body)).await.unwrap();
	assert_eq!(resp.status(), 422);
	let parsed = read_json(resp).await;
	assert_eq!(parsed["error"]["param"], "temperature");
}

#[tokio::test]
async fn stream_mid_failure_emits_terminal_error_frame() {
	let upstream = MockServer::start().await;
	// A stream that starts well and is then cut off without [DONE].
	let chunk = json!({
		"id": "chatcmpl-1",
		"object": "chat.completion.chunk",
		"created": 1700000000,
		"model": "gpt-4o",
		"choices": [{"index": 0, "delta": {"content": "He"}, "finish_reason": null}]
	});
	let sse = format!("data: {chunk}\n\ndata: {chunk}\n\n");
	mock_completions(
		&upstream,
		ResponseTemplate::new(200).set_body_raw(sse.into_bytes(), "text/event-stream"),
		1,
	)
	.await;

	let gw = gateway(&single_provider_config(&upstream.uri(), ""));
	let resp = gw
		.router
		.clone()
		.oneshot(chat_request(&chat_body("gpt-4o", true)))
		.await
		.unwrap();
	// Headers were already committed before the failure.
	assert_eq!(resp.status(), 200);
	let body = String::from_utf8(read_body(resp).await.to_vec()).unwrap();
	assert!(body.contains("\"type\":\"provider_error\""));
	assert!(body.contains("\"code\":\"stream_interrupted\""));
	assert!(body.trim_end().ends_with("data: [DONE]"));

	// Give the completion hook a moment, then confirm the failure counted.
	tokio::time::sleep(std::time::Duration::from_millis(20)).await;
	let snap = gw.registry.snapshot();
	let p1 = snap.by_name.get("p1").unwrap();
	assert_eq!(p1.breaker.consecutive_failures(), 1);
	assert_eq!(p1.inflight_count(), 0);
}
