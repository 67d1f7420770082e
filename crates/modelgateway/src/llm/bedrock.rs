//! AWS Bedrock Converse API codec. Requests are signed by the provider
//! client (SigV4); streams use the AWS event-stream binary framing rather
//! than SSE.

use async_stream::try_stream;
use futures::StreamExt;

use crate::llm::{AIError, ByteStream, ChunkStream, EncodedRequest};
use crate::parse::sse::EventStreamScanner;
use crate::types::uniform::*;
use crate::*;

pub fn encode(req: &UniformRequest, model: &str) -> Result<EncodedRequest, AIError> {
	let body = translate_request(req)?;
	let body = serde_json::to_vec(&body).map_err(AIError::RequestMarshal)?;
	let path = if req.stream {
		format!("/model/{model}/converse-stream")
	} else {
		format!("/model/{model}/converse")
	};
	let mut headers = http::HeaderMap::new();
	headers.insert(
		http::header::CONTENT_TYPE,
		http::HeaderValue::from_static("application/json"),
	);
	Ok(EncodedRequest {
		method: http::Method::POST,
		path,
		headers,
		body: Bytes::from(body),
	})
}

pub(super) fn translate_request(req: &UniformRequest) -> Result<types::ConverseRequest, AIError> {
	let system: Vec<types::SystemBlock> = req
		.messages
		.iter()
		.filter(|m| m.role == Role::System)
		.map(|m| types::SystemBlock {
			text: m.content.text(),
		})
		.collect();

	let mut messages = Vec::new();
	for msg in req.messages.iter().filter(|m| m.role != Role::System) {
		match msg.role {
			Role::Assistant => {
				let mut content = Vec::new();
				let text = msg.content.text();
				if !text.is_empty() {
					content.push(types::ContentBlock::Text(text));
				}
				for tc in msg.tool_calls.iter().flatten() {
					let input = serde_json::from_str(&tc.function.arguments)
						.unwrap_or(serde_json::Value::Object(Default::default()));
					content.push(types::ContentBlock::ToolUse(types::ToolUseBlock {
						tool_use_id: tc.id.clone(),
						name: tc.function.name.clone(),
						input,
					}));
				}
				messages.push(types::Message {
					role: types::Role::Assistant,
					content,
				});
			},
			Role::Tool => {
				messages.push(types::Message {
					role: types::Role::User,
					content: vec![types::ContentBlock::ToolResult(types::ToolResultBlock {
						tool_use_id: msg.tool_call_id.clone().unwrap_or_default(),
						content: vec![types::ToolResultContent {
							text: msg.content.text(),
						}],
					})],
				});
			},
			_ => {
				messages.push(types::Message {
					role: types::Role::User,
					content: vec![types::ContentBlock::Text(msg.content.text())],
				});
			},
		}
	}

	let tool_config = req.tools.as_ref().map(|tools| types::ToolConfig {
		tools: tools
			.iter()
			.map(|t| types::Tool {
				tool_spec: types::ToolSpecification {
					name: t.function.name.clone(),
					description: t.function.description.clone(),
					input_schema: types::ToolInputSchema {
						json: t.function.parameters.clone(),
					},
				},
			})
			.collect(),
	});

	Ok(types::ConverseRequest {
		messages,
		system,
		inference_config: Some(types::InferenceConfig {
			max_tokens: req.max_tokens,
			temperature: req.temperature,
			top_p: req.top_p,
			stop_sequences: if req.stop.is_empty() {
				None
			} else {
				Some(req.stop.clone())
			},
		}),
		tool_config,
	})
}

pub fn decode_response(body: &Bytes, model: &str) -> Result<UniformResponse, AIError> {
	let resp = serde_json::from_slice::<types::ConverseResponse>(body).map_err(AIError::parse)?;
	translate_response(resp, model)
}

pub(super) fn translate_response(
	resp: types::ConverseResponse,
	model: &str,
) -> Result<UniformResponse, AIError> {
	let output = resp.output.ok_or(AIError::IncompleteResponse)?;
	let message = output.message.ok_or(AIError::IncompleteResponse)?;

	// Bedrock carries a vec of blocks; OpenAI allows one text content plus
	// any number of tool calls.
	let mut content: Option<String> = None;
	let mut tool_calls = Vec::new();
	for block in message.content {
		match block {
			types::ContentBlock::Text(text) => match &mut content {
				Some(existing) => existing.push_str(&text),
				None => content = Some(text),
			},
			types::ContentBlock::ToolUse(tu) => {
				tool_calls.push(ToolCall {
					id: tu.tool_use_id,
					kind: ToolType::Function,
					function: FunctionCall {
						name: tu.name,
						arguments: tu.input.to_string(),
					},
				});
			},
			types::ContentBlock::ToolResult(_) => {},
		}
	}

	let usage = resp.usage.map(|u| Usage {
		prompt_tokens: u.input_tokens,
		completion_tokens: u.output_tokens,
		total_tokens: u.total_tokens,
	});

	Ok(UniformResponse {
		// Bedrock responses carry no id; synthesize one.
		id: format!("bedrock-{}", chrono::Utc::now().timestamp_millis()),
		object: OBJECT_COMPLETION.to_string(),
		created: super::now_ts(),
		model: model.to_string(),
		choices: vec![Choice {
			index: 0,
			message: ResponseMessage {
				role: Role::Assistant,
				content,
				tool_calls: if tool_calls.is_empty() {
					None
				} else {
					Some(tool_calls)
				},
			},
			finish_reason: Some(translate_stop_reason(&resp.stop_reason)),
		}],
		usage,
	})
}

fn translate_stop_reason(reason: &types::StopReason) -> FinishReason {
	match reason {
		types::StopReason::EndTurn => FinishReason::Stop,
		types::StopReason::StopSequence => FinishReason::Stop,
		types::StopReason::MaxTokens => FinishReason::Length,
		types::StopReason::ToolUse => FinishReason::ToolCalls,
		types::StopReason::ContentFiltered | types::StopReason::GuardrailIntervened => {
			FinishReason::ContentFilter
		},
	}
}

pub fn decode_stream(bytes: ByteStream, model: Strng) -> ChunkStream {
	Box::pin(try_stream! {
		let mut scanner = EventStreamScanner::new();
		let mut bytes = bytes;
		let created = super::now_ts();
		let id = format!("bedrock-{created}");
		let mut usage: Option<Usage> = None;
		let mut stop_reason: Option<FinishReason> = None;
		let mut finished = false;

		while let Some(chunk) = bytes.next().await {
			let chunk = chunk.map_err(|e| AIError::Transport(e.to_string()))?;
			scanner.push(&chunk);
			loop {
				let message = scanner
					.next_message()
					.map_err(|e| AIError::StreamProtocol(e.to_string()))?;
				let Some(message) = message else { break };
				let Some(output) = types::ConverseStreamOutput::from_message(message)
					.map_err(|e| AIError::StreamProtocol(e.to_string()))?
				else {
					continue;
				};
				match output {
					types::ConverseStreamOutput::MessageStart(_) => {
						yield StreamEvent::Chunk(super::role_chunk(&id, &model, created));
					},
					types::ConverseStreamOutput::ContentBlockDelta(d) => {
						if let Some(types::ContentBlockDelta::Text(text)) = d.delta {
							yield StreamEvent::Chunk(super::content_chunk(&id, &model, created, text));
						}
					},
					types::ConverseStreamOutput::ContentBlockStart(_)
					| types::ConverseStreamOutput::ContentBlockStop(_) => {},
					types::ConverseStreamOutput::MessageStop(stop) => {
						stop_reason = Some(translate_stop_reason(&stop.stop_reason));
					},
					types::ConverseStreamOutput::Metadata(metadata) => {
						if let Some(u) = metadata.usage {
							usage = Some(Usage {
								prompt_tokens: u.input_tokens,
								completion_tokens: u.output_tokens,
								total_tokens: u.total_tokens,
							});
						}
						// Metadata is the final frame of the stream.
						yield StreamEvent::Chunk(super::finish_chunk(
							&id,
							&model,
							created,
							stop_reason.take().unwrap_or(FinishReason::Stop),
							usage.take(),
						));
						finished = true;
					},
				}
			}
		}
		if finished {
			yield StreamEvent::Done;
		} else {
			Err(AIError::StreamProtocol("stream ended without metadata frame".to_string()))?;
		}
	})
}

pub fn decode_error(body: &Bytes) -> Option<String> {
	let err = serde_json::from_slice::<types::ConverseErrorResponse>(body).ok()?;
	Some(err.message)
}

pub(super) mod types {
	use serde::{Deserialize, Serialize};

	#[derive(Copy, Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
	#[serde(rename_all = "snake_case")]
	pub enum Role {
		User,
		Assistant,
	}

	#[derive(Clone, Debug, Serialize, Deserialize)]
	#[serde(rename_all = "camelCase")]
	pub enum ContentBlock {
		Text(String),
		ToolUse(ToolUseBlock),
		ToolResult(ToolResultBlock),
	}

	#[derive(Clone, Debug, Serialize, Deserialize)]
	#[serde(rename_all = "camelCase")]
	pub struct ToolUseBlock {
		pub tool_use_id: String,
		pub name: String,
		pub input: serde_json::Value,
	}

	#[derive(Clone, Debug, Serialize, Deserialize)]
	#[serde(rename_all = "camelCase")]
	pub struct ToolResultBlock {
		pub tool_use_id: String,
		pub content: Vec<ToolResultContent>,
	}

	#[derive(Clone, Debug, Serialize, Deserialize)]
	pub struct ToolResultContent {
		pub text: String,
	}

	#[derive(Clone, Debug, Serialize, Deserialize)]
	pub struct Message {
		pub role: Role,
		pub content: Vec<ContentBlock>,
	}

	#[derive(Clone, Debug, Serialize)]
	pub struct SystemBlock {
		pub text: String,
	}

	#[derive(Clone, Debug, Serialize)]
	#[serde(rename_all = "camelCase")]
	pub struct InferenceConfig {
		#[serde(skip_serializing_if = "Option::is_none")]
		pub max_tokens: Option<u64>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub temperature: Option<f64>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub top_p: Option<f64>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub stop_sequences: Option<Vec<String>>,
	}

	#[derive(Clone, Debug, Serialize)]
	#[serde(rename_all = "camelCase")]
	pub struct ToolConfig {
		pub tools: Vec<Tool>,
	}

	#[derive(Clone, Debug, Serialize)]
	#[serde(rename_all = "camelCase")]
	pub struct Tool {
		pub tool_spec: ToolSpecification,
	}

	#[derive(Clone, Debug, Serialize)]
	#[serde(rename_all = "camelCase")]
	pub struct ToolSpecification {
		pub name: String,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub description: Option<String>,
		pub input_schema: ToolInputSchema,
	}

	#[derive(Clone, Debug, Serialize)]
	pub struct ToolInputSchema {
		pub json: serde_json::Value,
	}

	#[derive(Clone, Debug, Serialize)]
	#[serde(rename_all = "camelCase")]
	pub struct ConverseRequest {
		pub messages: Vec<Message>,
		#[serde(skip_serializing_if = "Vec::is_empty")]
		pub system: Vec<SystemBlock>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub inference_config: Option<InferenceConfig>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub tool_config: Option<ToolConfig>,
	}

	#[derive(Clone, Debug, Deserialize)]
	#[serde(rename_all = "camelCase")]
	pub struct ConverseResponse {
		pub output: Option<ConverseOutput>,
		pub stop_reason: StopReason,
		#[serde(default)]
		pub usage: Option<TokenUsage>,
	}

	#[derive(Clone, Debug, Deserialize)]
	pub struct ConverseOutput {
		pub message: Option<Message>,
	}

	#[derive(Copy, Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
	#[serde(rename_all = "snake_case")]
	pub enum StopReason {
		EndTurn,
		ToolUse,
		MaxTokens,
		StopSequence,
		GuardrailIntervened,
		ContentFiltered,
	}

	#[derive(Copy, Clone, Debug, Deserialize)]
	#[serde(rename_all = "camelCase")]
	pub struct TokenUsage {
		pub input_tokens: u32,
		pub output_tokens: u32,
		pub total_tokens: u32,
	}

	#[derive(Clone, Debug, Deserialize)]
	pub struct ConverseErrorResponse {
		pub message: String,
	}

	// Stream frames, keyed by the `:event-type` header of each event-stream
	// message rather than a serde tag.
	#[derive(Clone, Debug)]
	pub enum ConverseStreamOutput {
		MessageStart(MessageStartEvent),
		ContentBlockStart(ContentBlockStartEvent),
		ContentBlockDelta(ContentBlockDeltaEvent),
		ContentBlockStop(ContentBlockStopEvent),
		MessageStop(MessageStopEvent),
		Metadata(ConverseStreamMetadataEvent),
	}

	impl ConverseStreamOutput {
		pub fn from_message(
			m: aws_event_stream_parser::Message,
		) -> anyhow::Result<Option<Self>> {
			let Some(event_type) = m
				.headers
				.headers
				.iter()
				.find(|h| h.key.as_str() == ":event-type")
				.and_then(|h| match &h.value {
					aws_event_stream_parser::HeaderValue::String(s) => Some(s.to_string()),
					_ => None,
				})
			else {
				// Exception or unknown frame; surface the body as an error.
				anyhow::bail!(
					"unexpected event stream frame: {}",
					String::from_utf8_lossy(&m.body)
				)
			};
			Ok(match event_type.as_str() {
				"messageStart" => Some(ConverseStreamOutput::MessageStart(serde_json::from_slice(
					&m.body,
				)?)),
				"contentBlockStart" => Some(ConverseStreamOutput::ContentBlockStart(
					serde_json::from_slice(&m.body)?,
				)),
				"contentBlockDelta" => Some(ConverseStreamOutput::ContentBlockDelta(
					serde_json::from_slice(&m.body)?,
				)),
				"contentBlockStop" => Some(ConverseStreamOutput::ContentBlockStop(
					serde_json::from_slice(&m.body)?,
				)),
				"messageStop" => Some(ConverseStreamOutput::MessageStop(serde_json::from_slice(
					&m.body,
				)?)),
				"metadata" => Some(ConverseStreamOutput::Metadata(serde_json::from_slice(
					&m.body,
				)?)),
				_ => None,
			})
		}
	}

	#[derive(Clone, Debug, Deserialize)]
	#[serde(rename_all = "camelCase")]
	pub struct MessageStartEvent {
		pub role: Role,
	}

	#[derive(Clone, Debug, Deserialize)]
	#[serde(rename_all = "camelCase")]
	pub struct ContentBlockStartEvent {
		pub content_block_index: i32,
	}

	#[derive(Clone, Debug, Deserialize)]
	#[serde(rename_all = "camelCase")]
	pub struct ContentBlockDeltaEvent {
		pub delta: Option<ContentBlockDelta>,
		pub content_block_index: i32,
	}

	#[derive(Clone, Debug, Deserialize)]
	#[serde(rename_all = "camelCase")]
	pub enum ContentBlockDelta {
		Text(String),
	}

	#[derive(Clone, Debug, Deserialize)]
	#[serde(rename_all = "camelCase")]
	pub struct ContentBlockStopEvent {
		pub content_block_index: i32,
	}

	#[derive(Clone, Debug, Deserialize)]
	#[serde(rename_all = "camelCase")]
	pub struct MessageStopEvent {
		pub stop_reason: StopReason,
	}

	#[derive(Clone, Debug, Deserialize)]
	#[serde(rename_all = "camelCase")]
	pub struct ConverseStreamMetadataEvent {
		pub usage: Option<TokenUsage>,
	}
}
