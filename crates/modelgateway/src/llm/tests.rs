use futures::StreamExt;
use serde_json::{Value, json};

use super::*;
use crate::types::provider::{Capability, ProviderDescriptor, ProviderKind};
use crate::types::uniform::*;

fn request(model: &str, stream: bool) -> UniformRequest {
	UniformRequest {
		id: strng::new("req-1"),
		principal: strng::new("p"),
		tenant: strng::new("t"),
		model: strng::new(model),
		messages: vec![
			Message {
				role: Role::System,
				content: Content::Text("be terse".to_string()),
				name: None,
				tool_calls: None,
				tool_call_id: None,
			},
			Message {
				role: Role::User,
				content: Content::Text("hi".to_string()),
				name: None,
				tool_calls: None,
				tool_call_id: None,
			},
		],
		temperature: Some(0.2),
		top_p: None,
		max_tokens: Some(128),
		stop: vec![],
		tools: None,
		stream,
		deadline: None,
		idempotency_key: None,
		hints: Default::default(),
	}
}

fn descriptor(kind: ProviderKind) -> ProviderDescriptor {
	serde_yaml::from_str(&format!(
		r#"
name: test
kind: {}
models: [m]
capabilities: [streaming, tools, vision, system-msg]
"#,
		serde_yaml::to_string(&kind).unwrap().trim()
	))
	.unwrap()
}

fn body_json(enc: &EncodedRequest) -> Value {
	serde_json::from_slice(&enc.body).unwrap()
}

/// Feed a byte blob to a stream decoder in deliberately awkward splits.
fn chopped(bytes: &[u8], at: usize) -> ByteStream {
	let chunks: Vec<Result<Bytes, std::io::Error>> = bytes
		.chunks(at)
		.map(|c| Ok(Bytes::copy_from_slice(c)))
		.collect();
	Box::pin(futures::stream::iter(chunks))
}

async fn collect_events(s: ChunkStream) -> Vec<Result<StreamEvent, AIError>> {
	s.collect().await
}

#[test]
fn openai_encode_shape() {
	let req = request("gpt-4o", false);
	let enc = openai::encode(&req, "gpt-4o").unwrap();
	assert_eq!(enc.path, "/v1/chat/completions");
	assert_eq!(enc.method, http::Method::POST);
	let body = body_json(&enc);
	assert_eq!(body["model"], "gpt-4o");
	assert_eq!(body["messages"][0]["role"], "system");
	assert_eq!(body["messages"][1]["content"], "hi");
	assert_eq!(body["max_tokens"], 128);
	assert!(body.get("stream").is_none());
	assert!(body.get("stream_options").is_none());
}

#[test]
fn openai_encode_stream_requests_usage() {
	let req = request("gpt-4o", true);
	let enc = openai::encode(&req, "gpt-4o").unwrap();
	let body = body_json(&enc);
	assert_eq!(body["stream"], true);
	assert_eq!(body["stream_options"]["include_usage"], true);
}

#[test]
fn openai_decode_response() {
	let body = Bytes::from(
		json!({
			"id": "chatcmpl-1",
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
		.to_string(),
	);
	let resp = openai::decode_response(&body).unwrap();
	assert_eq!(resp.choices[0].finish_reason, Some(FinishReason::Stop));
	assert_eq!(resp.usage.unwrap().prompt_tokens, 5);
}

#[tokio::test]
async fn openai_stream_decodes_split_events() {
	let chunk = json!({
		"id": "c", "object": "chat.completion.chunk", "created": 1, "model": "m",
		"choices": [{"index": 0, "delta": {"content": "hel"}, "finish_reason": null}]
	});
	let raw = format!("data: {chunk}\n\ndata: {chunk}\n\ndata: [DONE]\n\n");
	// Split every 7 bytes so JSON objects straddle chunk boundaries.
	let events = collect_events(openai::decode_stream(chopped(raw.as_bytes(), 7))).await;
	let ok: Vec<_> = events.into_iter().map(|e| e.unwrap()).collect();
	assert_eq!(ok.len(), 3);
	assert!(matches!(&ok[0], StreamEvent::Chunk(c) if c.content_delta() == Some("hel")));
	assert!(matches!(ok[2], StreamEvent::Done));
}

#[tokio::test]
async fn openai_stream_without_done_is_an_error() {
	let raw = "data: {\"id\":\"c\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"m\",\"choices\":[]}\n\n";
	let events = collect_events(openai::decode_stream(chopped(raw.as_bytes(), 16))).await;
	assert!(matches!(events.first().unwrap(), Ok(StreamEvent::Chunk(_))));
	assert!(matches!(
		events.last().unwrap(),
		Err(AIError::StreamProtocol(_))
	));
}

#[tokio::test]
async fn openai_stream_malformed_json_is_terminal() {
	let raw = "data: {not json}\n\ndata: [DONE]\n\n";
	let events = collect_events(openai::decode_stream(chopped(raw.as_bytes(), 64))).await;
	assert_eq!(events.len(), 1);
	assert!(matches!(
		events.first().unwrap(),
		Err(AIError::ResponseParsing { .. })
	));
}

#[test]
fn anthropic_encode_folds_system() {
	let req = request("claude-3-5-sonnet", false);
	let enc = anthropic::encode(&req, "claude-3-5-sonnet").unwrap();
	assert_eq!(enc.path, "/v1/messages");
	assert_eq!(
		enc.headers.get("anthropic-version").unwrap(),
		anthropic::API_VERSION
	);
	let body = body_json(&enc);
	assert_eq!(body["system"], "be terse");
	// System messages never appear in the message list.
	let messages = body["messages"].as_array().unwrap();
	assert_eq!(messages.len(), 1);
	assert_eq!(messages[0]["role"], "user");
	assert_eq!(body["max_tokens"], 128);
}

#[test]
fn anthropic_encode_tools_use_input_schema() {
	let mut req = request("claude-3-5-sonnet", false);
	req.tools = Some(vec![ToolDef {
		kind: ToolType::Function,
		function: FunctionDef {
			name: "get_weather".to_string(),
			description: Some("weather lookup".to_string()),
			parameters: json!({"type": "object", "properties": {"city": {"type": "string"}}}),
		},
	}]);
	let enc = anthropic::encode(&req, "claude-3-5-sonnet").unwrap();
	let body = body_json(&enc);
	assert_eq!(body["tools"][0]["name"], "get_weather");
	assert!(body["tools"][0]["input_schema"]["properties"]["city"].is_object());
}

#[test]
fn anthropic_decode_response() {
	let body = Bytes::from(
		json!({
			"id": "msg_1",
			"type": "message",
			"role": "assistant",
			"content": [{"type": "text", "text": "Hi"}],
			"model": "claude-3-5-sonnet",
			"stop_reason": "end_turn",
			"stop_sequence": null,
			"usage": {"input_tokens": 10, "output_tokens": 3}
		})
		.to_string(),
	);
	let resp = anthropic::decode_response(&body).unwrap();
	assert_eq!(resp.choices[0].finish_reason, Some(FinishReason::Stop));
	assert_eq!(resp.choices[0].message.content.as_deref(), Some("Hi"));
	let usage = resp.usage.unwrap();
	assert_eq!(usage.prompt_tokens, 10);
	assert_eq!(usage.total_tokens, 13);
}

#[test]
fn anthropic_max_tokens_maps_to_length() {
	let body = Bytes::from(
		json!({
			"id": "msg_1", "type": "message", "role": "assistant",
			"content": [{"type": "text", "text": "x"}],
			"model": "claude-3-5-sonnet",
			"stop_reason": "max_tokens",
			"usage": {"input_tokens": 1, "output_tokens": 1}
		})
		.to_string(),
	);
	let resp = anthropic::decode_response(&body).unwrap();
	assert_eq!(resp.choices[0].finish_reason, Some(FinishReason::Length));
}

#[tokio::test]
async fn anthropic_stream_decodes() {
	let raw = concat!(
		"event: message_start\n",
		"data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\",\"type\":\"message\",\"role\":\"assistant\",\"content\":[],\"model\":\"claude\",\"stop_reason\":null,\"usage\":{\"input_tokens\":7,\"output_tokens\":1}}}\n\n",
		"event: content_block_delta\n",
		"data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hi\"}}\n\n",
		"event: message_delta\n",
		"data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":2}}\n\n",
		"event: message_stop\n",
		"data: {\"type\":\"message_stop\"}\n\n",
	);
	let events = collect_events(anthropic::decode_stream(
		chopped(raw.as_bytes(), 11),
		strng::new("claude"),
	))
	.await;
	let ok: Vec<_> = events.into_iter().map(|e| e.unwrap()).collect();
	// role, content, finish, done
	assert_eq!(ok.len(), 4);
	let StreamEvent::Chunk(role) = &ok[0] else {
		panic!("expected chunk")
	};
	assert_eq!(role.choices[0].delta.role, Some(Role::Assistant));
	assert!(matches!(&ok[1], StreamEvent::Chunk(c) if c.content_delta() == Some("Hi")));
	let StreamEvent::Chunk(fin) = &ok[2] else {
		panic!("expected chunk")
	};
	assert_eq!(fin.finish_reason(), Some(FinishReason::Stop));
	let usage = fin.usage.unwrap();
	assert_eq!(usage.prompt_tokens, 7);
	assert_eq!(usage.completion_tokens, 2);
	assert!(matches!(ok[3], StreamEvent::Done));
}

#[test]
fn google_encode_shape() {
	let req = request("gemini-1.5-pro", false);
	let enc = google::encode(&req, "gemini-1.5-pro").unwrap();
	assert_eq!(enc.path, "/v1beta/models/gemini-1.5-pro:generateContent");
	let body = body_json(&enc);
	assert_eq!(body["systemInstruction"]["parts"][0]["text"], "be terse");
	assert_eq!(body["contents"][0]["role"], "user");
	assert_eq!(body["generationConfig"]["maxOutputTokens"], 128);
}

#[test]
fn google_encode_stream_path() {
	let req = request("gemini-1.5-pro", true);
	let enc = google::encode(&req, "gemini-1.5-pro").unwrap();
	assert_eq!(
		enc.path,
		"/v1beta/models/gemini-1.5-pro:streamGenerateContent?alt=sse"
	);
}

#[test]
fn google_encode_tools_use_function_declarations() {
	let mut req = request("gemini-1.5-pro", false);
	req.tools = Some(vec![ToolDef {
		kind: ToolType::Function,
		function: FunctionDef {
			name: "lookup".to_string(),
			description: None,
			parameters: json!({"type": "object"}),
		},
	}]);
	let enc = google::encode(&req, "gemini-1.5-pro").unwrap();
	let body = body_json(&enc);
	assert_eq!(body["tools"][0]["functionDeclarations"][0]["name"], "lookup");
}

#[test]
fn google_decode_response() {
	let body = Bytes::from(
		json!({
			"candidates": [{
				"content": {"role": "model", "parts": [{"text": "Hi"}]},
				"finishReason": "STOP"
			}],
			"usageMetadata": {"promptTokenCount": 4, "candidatesTokenCount": 1, "totalTokenCount": 5}
		})
		.to_string(),
	);
	let resp = google::decode_response(&body, "gemini-1.5-pro").unwrap();
	assert_eq!(resp.choices[0].finish_reason, Some(FinishReason::Stop));
	assert_eq!(resp.usage.unwrap().prompt_tokens, 4);
	assert_eq!(resp.choices[0].message.content.as_deref(), Some("Hi"));
}

#[tokio::test]
async fn google_stream_finishes_on_finish_reason() {
	let ev1 = json!({"candidates": [{"content": {"parts": [{"text": "He"}]}}]});
	let ev2 = json!({
		"candidates": [{"content": {"parts": [{"text": "y"}]}, "finishReason": "STOP"}],
		"usageMetadata": {"promptTokenCount": 2, "candidatesTokenCount": 2, "totalTokenCount": 4}
	});
	let raw = format!("data: {ev1}\n\ndata: {ev2}\n\n");
	let events = collect_events(google::decode_stream(
		chopped(raw.as_bytes(), 9),
		strng::new("gemini-1.5-pro"),
	))
	.await;
	let ok: Vec<_> = events.into_iter().map(|e| e.unwrap()).collect();
	// role, "He", "y", finish, done
	assert_eq!(ok.len(), 5);
	assert!(matches!(ok.last().unwrap(), StreamEvent::Done));
	let StreamEvent::Chunk(fin) = &ok[3] else {
		panic!("expected finish chunk")
	};
	assert_eq!(fin.usage.unwrap().total_tokens, 4);
}

#[test]
fn bedrock_encode_shape() {
	let req = request("anthropic.claude-3-haiku", false);
	let enc = bedrock::encode(&req, "anthropic.claude-3-haiku").unwrap();
	assert_eq!(enc.path, "/model/anthropic.claude-3-haiku/converse");
	let body = body_json(&enc);
	assert_eq!(body["system"][0]["text"], "be terse");
	assert_eq!(body["messages"][0]["content"][0]["text"], "hi");
	assert_eq!(body["inferenceConfig"]["maxTokens"], 128);
}

#[test]
fn bedrock_encode_stream_path() {
	let req = request("m", true);
	let enc = bedrock::encode(&req, "m").unwrap();
	assert_eq!(enc.path, "/model/m/converse-stream");
}

#[test]
fn bedrock_decode_response() {
	let body = Bytes::from(
		json!({
			"output": {"message": {"role": "assistant", "content": [{"text": "Hi"}]}},
			"stopReason": "end_turn",
			"usage": {"inputTokens": 6, "outputTokens": 1, "totalTokens": 7}
		})
		.to_string(),
	);
	let resp = bedrock::decode_response(&body, "anthropic.claude-3-haiku").unwrap();
	assert_eq!(resp.choices[0].finish_reason, Some(FinishReason::Stop));
	assert_eq!(resp.model, "anthropic.claude-3-haiku");
	assert_eq!(resp.usage.unwrap().total_tokens, 7);
}

#[test]
fn bedrock_tool_use_maps_to_tool_calls() {
	let body = Bytes::from(
		json!({
			"output": {"message": {"role": "assistant", "content": [
				{"toolUse": {"toolUseId": "t1", "name": "lookup", "input": {"q": "x"}}}
			]}},
			"stopReason": "tool_use",
			"usage": {"inputTokens": 1, "outputTokens": 1, "totalTokens": 2}
		})
		.to_string(),
	);
	let resp = bedrock::decode_response(&body, "m").unwrap();
	assert_eq!(resp.choices[0].finish_reason, Some(FinishReason::ToolCalls));
	let calls = resp.choices[0].message.tool_calls.as_ref().unwrap();
	assert_eq!(calls[0].id, "t1");
	assert_eq!(calls[0].function.name, "lookup");
}

#[tokio::test]
async fn ollama_stream_decodes_ndjson() {
	let raw = concat!(
		"{\"model\":\"llama3\",\"message\":{\"role\":\"assistant\",\"content\":\"H\"},\"done\":false}\n",
		"{\"model\":\"llama3\",\"message\":{\"role\":\"assistant\",\"content\":\"i\"},\"done\":false}\n",
		"{\"model\":\"llama3\",\"message\":{\"role\":\"assistant\",\"content\":\"\"},\"done\":true,\"done_reason\":\"stop\",\"prompt_eval_count\":3,\"eval_count\":2}\n",
	);
	let events = collect_events(ollama::decode_stream(chopped(raw.as_bytes(), 13))).await;
	let ok: Vec<_> = events.into_iter().map(|e| e.unwrap()).collect();
	// role, "H", "i", finish, done
	assert_eq!(ok.len(), 5);
	let StreamEvent::Chunk(fin) = &ok[3] else {
		panic!("expected finish chunk")
	};
	assert_eq!(fin.usage.unwrap().total_tokens, 5);
	assert!(matches!(ok[4], StreamEvent::Done));
}

#[test]
fn encode_rejects_missing_capability() {
	let mut desc = descriptor(ProviderKind::OpenAICompatible);
	desc.capabilities.remove(&Capability::Tools);
	let mut req = request("m", false);
	req.tools = Some(vec![ToolDef {
		kind: ToolType::Function,
		function: FunctionDef {
			name: "f".to_string(),
			description: None,
			parameters: json!({}),
		},
	}]);
	let err = encode(&desc, &req).unwrap_err();
	assert!(matches!(
		err,
		AIError::UnsupportedCapability(Capability::Tools)
	));
	assert!(err.is_client_error());
}

#[test]
fn encode_applies_model_override() {
	let mut desc = descriptor(ProviderKind::OpenAICompatible);
	desc.model_override = Some(strng::new("gpt-4o-2024-08-06"));
	let req = request("gpt-4o", false);
	let enc = encode(&desc, &req).unwrap();
	let body = body_json(&enc);
	assert_eq!(body["model"], "gpt-4o-2024-08-06");
}

#[test]
fn decode_error_message_falls_back_to_raw() {
	let desc = descriptor(ProviderKind::OpenAICompatible);
	let msg = decode_error_message(&desc, &Bytes::from_static(b"upstream exploded"));
	assert_eq!(msg, "upstream exploded");
	let msg = decode_error_message(
		&desc,
		&Bytes::from(json!({"error": {"message": "bad key"}}).to_string()),
	);
	assert_eq!(msg, "bad key");
}
