//! Anthropic Messages API codec.

use async_stream::try_stream;
use futures::StreamExt;
use itertools::Itertools;

use crate::llm::{AIError, ByteStream, ChunkStream, EncodedRequest};
use crate::parse::sse::SseScanner;
use crate::types::uniform::*;
use crate::*;

pub const DEFAULT_PATH: &str = "/v1/messages";
// https://docs.anthropic.com/en/api/versioning
pub const API_VERSION: &str = "2023-06-01";

pub fn encode(req: &UniformRequest, model: &str) -> Result<EncodedRequest, AIError> {
	let body = translate_request(req, model)?;
	let body = serde_json::to_vec(&body).map_err(AIError::RequestMarshal)?;
	let mut headers = http::HeaderMap::new();
	headers.insert(
		http::header::CONTENT_TYPE,
		http::HeaderValue::from_static("application/json"),
	);
	headers.insert(
		"anthropic-version",
		http::HeaderValue::from_static(API_VERSION),
	);
	Ok(EncodedRequest {
		method: http::Method::POST,
		path: DEFAULT_PATH.to_string(),
		headers,
		body: Bytes::from(body),
	})
}

pub(super) fn translate_request(
	req: &UniformRequest,
	model: &str,
) -> Result<types::MessagesRequest, AIError> {
	// Anthropic carries all system prompts in a single field; join them.
	let system = req
		.messages
		.iter()
		.filter(|m| m.role == Role::System)
		.map(|m| m.content.text())
		.join("\n");

	let mut messages = Vec::new();
	for msg in req.messages.iter().filter(|m| m.role != Role::System) {
		match msg.role {
			Role::Tool => {
				// Tool results are user-turn content blocks.
				messages.push(types::Message {
					role: types::Role::User,
					content: vec![types::ContentBlock::ToolResult {
						tool_use_id: msg.tool_call_id.clone().unwrap_or_default(),
						content: msg.content.text(),
					}],
				});
			},
			Role::Assistant => {
				let mut content = Vec::new();
				let text = msg.content.text();
				if !text.is_empty() {
					content.push(types::ContentBlock::Text { text });
				}
				for tc in msg.tool_calls.iter().flatten() {
					let input = serde_json::from_str(&tc.function.arguments)
						.unwrap_or(serde_json::Value::Object(Default::default()));
					content.push(types::ContentBlock::ToolUse {
						id: tc.id.clone(),
						name: tc.function.name.clone(),
						input,
					});
				}
				messages.push(types::Message {
					role: types::Role::Assistant,
					content,
				});
			},
			_ => {
				let content = match &msg.content {
					Content::Text(text) => vec![types::ContentBlock::Text { text: text.clone() }],
					Content::Parts(parts) => parts
						.iter()
						.map(|p| match p {
							ContentPart::Text { text } => types::ContentBlock::Text { text: text.clone() },
							ContentPart::ImageUrl { image_url } => types::ContentBlock::Image {
								source: types::ImageSource {
									r#type: "url".to_string(),
									url: image_url.url.clone(),
								},
							},
						})
						.collect(),
				};
				messages.push(types::Message {
					role: types::Role::User,
					content,
				});
			},
		}
	}

	let tools = req.tools.as_ref().map(|tools| {
		tools
			.iter()
			.map(|t| types::Tool {
				name: t.function.name.clone(),
				description: t.function.description.clone(),
				input_schema: t.function.parameters.clone(),
			})
			.collect()
	});

	Ok(types::MessagesRequest {
		model: model.to_string(),
		messages,
		system,
		max_tokens: req.max_tokens.unwrap_or(4096),
		stop_sequences: req.stop.clone(),
		stream: req.stream,
		temperature: req.temperature,
		top_p: req.top_p,
		tools,
	})
}

pub fn decode_response(body: &Bytes) -> Result<UniformResponse, AIError> {
	let resp = serde_json::from_slice::<types::MessagesResponse>(body).map_err(AIError::parse)?;
	Ok(translate_response(resp))
}

pub(super) fn translate_response(resp: types::MessagesResponse) -> UniformResponse {
	let mut content: Option<String> = None;
	let mut tool_calls = Vec::new();
	for block in resp.content {
		match block {
			types::ContentBlock::Text { text } => match &mut content {
				Some(existing) => existing.push_str(&text),
				None => content = Some(text),
			},
			types::ContentBlock::ToolUse { id, name, input } => {
				tool_calls.push(ToolCall {
					id,
					kind: ToolType::Function,
					function: FunctionCall {
						name,
						arguments: input.to_string(),
					},
				});
			},
			_ => {},
		}
	}

	let usage = Usage {
		prompt_tokens: resp.usage.input_tokens,
		completion_tokens: resp.usage.output_tokens,
		total_tokens: resp.usage.input_tokens + resp.usage.output_tokens,
	};

	UniformResponse {
		id: resp.id,
		object: OBJECT_COMPLETION.to_string(),
		// Anthropic responses carry no timestamp; call it "now".
		created: super::now_ts(),
		model: resp.model,
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
			finish_reason: resp.stop_reason.map(translate_stop_reason),
		}],
		usage: Some(usage),
	}
}

fn translate_stop_reason(reason: types::StopReason) -> FinishReason {
	match reason {
		types::StopReason::EndTurn => FinishReason::Stop,
		types::StopReason::MaxTokens => FinishReason::Length,
		types::StopReason::StopSequence => FinishReason::Stop,
		types::StopReason::ToolUse => FinishReason::ToolCalls,
	}
}

pub fn decode_stream(bytes: ByteStream, model: Strng) -> ChunkStream {
	Box::pin(try_stream! {
		let mut scanner = SseScanner::new();
		let mut bytes = bytes;
		let created = super::now_ts();
		let mut message_id = String::new();
		let mut response_model = model.to_string();
		let mut input_tokens: u32 = 0;
		// Anthropic block index -> OpenAI tool call index.
		let mut tool_indices: HashMap<usize, u32> = HashMap::new();
		let mut stopped = false;

		'outer: while let Some(chunk) = bytes.next().await {
			let chunk = chunk.map_err(|e| AIError::Transport(e.to_string()))?;
			scanner.push(&chunk);
			while let Some(event) = scanner.next_event() {
				let parsed = serde_json::from_str::<types::MessagesStreamEvent>(&event.data)
					.map_err(AIError::parse)?;
				match parsed {
					types::MessagesStreamEvent::MessageStart { message } => {
						message_id = message.id;
						response_model = message.model;
						input_tokens = message.usage.input_tokens;
						yield StreamEvent::Chunk(super::role_chunk(&message_id, &response_model, created));
					},
					types::MessagesStreamEvent::ContentBlockStart { index, content_block } => {
						if let types::ContentBlock::ToolUse { id, name, .. } = content_block {
							let tool_index = tool_indices.len() as u32;
							tool_indices.insert(index, tool_index);
							yield StreamEvent::Chunk(tool_call_start_chunk(
								&message_id, &response_model, created, tool_index, id, name,
							));
						}
					},
					types::MessagesStreamEvent::ContentBlockDelta { index, delta } => match delta {
						types::ContentBlockDelta::TextDelta { text } => {
							yield StreamEvent::Chunk(super::content_chunk(&message_id, &response_model, created, text));
						},
						types::ContentBlockDelta::InputJsonDelta { partial_json } => {
							if let Some(tool_index) = tool_indices.get(&index) {
								yield StreamEvent::Chunk(tool_call_args_chunk(
									&message_id, &response_model, created, *tool_index, partial_json,
								));
							}
						},
					},
					types::MessagesStreamEvent::ContentBlockStop { .. } => {},
					types::MessagesStreamEvent::MessageDelta { delta, usage } => {
						let reason = delta
							.stop_reason
							.map(translate_stop_reason)
							.unwrap_or(FinishReason::Stop);
						let usage = Usage {
							prompt_tokens: input_tokens,
							completion_tokens: usage.output_tokens,
							total_tokens: input_tokens + usage.output_tokens,
						};
						yield StreamEvent::Chunk(super::finish_chunk(
							&message_id, &response_model, created, reason, Some(usage),
						));
					},
					types::MessagesStreamEvent::MessageStop => {
						stopped = true;
						yield StreamEvent::Done;
						break 'outer;
					},
					types::MessagesStreamEvent::Ping => {},
					types::MessagesStreamEvent::Error { error } => {
						Err(AIError::StreamProtocol(format!(
							"{}: {}", error.r#type, error.message
						)))?;
					},
				}
			}
		}
		if !stopped {
			Err(AIError::StreamProtocol("stream ended without message_stop".to_string()))?;
		}
	})
}

fn tool_call_start_chunk(
	id: &str,
	model: &str,
	created: i64,
	index: u32,
	call_id: String,
	name: String,
) -> UniformChunk {
	UniformChunk {
		id: id.to_string(),
		object: OBJECT_CHUNK.to_string(),
		created,
		model: model.to_string(),
		choices: vec![ChunkChoice {
			index: 0,
			delta: Delta {
				tool_calls: Some(vec![ToolCallDelta {
					index,
					id: Some(call_id),
					kind: Some(ToolType::Function),
					function: Some(FunctionCallDelta {
						name: Some(name),
						arguments: Some(String::new()),
					}),
				}]),
				..Default::default()
			},
			finish_reason: None,
		}],
		usage: None,
	}
}

fn tool_call_args_chunk(
	id: &str,
	model: &str,
	created: i64,
	index: u32,
	arguments: String,
) -> UniformChunk {
	UniformChunk {
		id: id.to_string(),
		object: OBJECT_CHUNK.to_string(),
		created,
		model: model.to_string(),
		choices: vec![ChunkChoice {
			index: 0,
			delta: Delta {
				tool_calls: Some(vec![ToolCallDelta {
					index,
					id: None,
					kind: None,
					function: Some(FunctionCallDelta {
						name: None,
						arguments: Some(arguments),
					}),
				}]),
				..Default::default()
			},
			finish_reason: None,
		}],
		usage: None,
	}
}

pub fn decode_error(body: &Bytes) -> Option<String> {
	let resp = serde_json::from_slice::<types::MessagesErrorResponse>(body).ok()?;
	Some(resp.error.message)
}

pub(super) mod types {
	use serde::{Deserialize, Serialize};

	#[derive(Copy, Clone, Deserialize, Serialize, Debug, PartialEq, Eq)]
	#[serde(rename_all = "snake_case")]
	pub enum Role {
		User,
		Assistant,
	}

	#[derive(Clone, Deserialize, Serialize, Debug, PartialEq)]
	#[serde(rename_all = "snake_case", tag = "type")]
	pub enum ContentBlock {
		Text {
			text: String,
		},
		Image {
			source: ImageSource,
		},
		ToolUse {
			id: String,
			name: String,
			input: serde_json::Value,
		},
		ToolResult {
			tool_use_id: String,
			content: String,
		},
	}

	#[derive(Clone, Deserialize, Serialize, Debug, PartialEq, Eq)]
	pub struct ImageSource {
		pub r#type: String,
		pub url: String,
	}

	#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
	pub struct Message {
		pub role: Role,
		pub content: Vec<ContentBlock>,
	}

	#[derive(Clone, Serialize, Debug, PartialEq)]
	pub struct Tool {
		pub name: String,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub description: Option<String>,
		pub input_schema: serde_json::Value,
	}

	#[derive(Clone, Serialize, Debug, PartialEq)]
	pub struct MessagesRequest {
		pub model: String,
		pub messages: Vec<Message>,
		#[serde(skip_serializing_if = "String::is_empty")]
		pub system: String,
		pub max_tokens: u64,
		#[serde(skip_serializing_if = "Vec::is_empty")]
		pub stop_sequences: Vec<String>,
		#[serde(skip_serializing_if = "crate::serdes::is_default")]
		pub stream: bool,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub temperature: Option<f64>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub top_p: Option<f64>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub tools: Option<Vec<Tool>>,
	}

	#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
	pub struct MessagesResponse {
		pub id: String,
		pub r#type: String,
		pub role: Role,
		pub content: Vec<ContentBlock>,
		pub model: String,
		pub stop_reason: Option<StopReason>,
		#[serde(default)]
		pub stop_sequence: Option<String>,
		pub usage: Usage,
	}

	#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
	#[serde(rename_all = "snake_case", tag = "type")]
	pub enum MessagesStreamEvent {
		MessageStart {
			message: MessagesResponse,
		},
		ContentBlockStart {
			index: usize,
			content_block: ContentBlock,
		},
		ContentBlockDelta {
			index: usize,
			delta: ContentBlockDelta,
		},
		ContentBlockStop {
			index: usize,
		},
		MessageDelta {
			delta: MessageDelta,
			usage: MessageDeltaUsage,
		},
		MessageStop,
		Ping,
		Error {
			error: MessagesError,
		},
	}

	#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
	#[serde(rename_all = "snake_case", tag = "type")]
	pub enum ContentBlockDelta {
		TextDelta { text: String },
		InputJsonDelta { partial_json: String },
	}

	#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
	pub struct MessageDeltaUsage {
		pub output_tokens: u32,
	}

	#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
	pub struct MessageDelta {
		pub stop_reason: Option<StopReason>,
		#[serde(default)]
		pub stop_sequence: Option<String>,
	}

	#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
	pub struct MessagesErrorResponse {
		pub r#type: String,
		pub error: MessagesError,
	}

	#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
	pub struct MessagesError {
		pub r#type: String,
		pub message: String,
	}

	#[derive(Copy, Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
	#[serde(rename_all = "snake_case")]
	pub enum StopReason {
		EndTurn,
		MaxTokens,
		StopSequence,
		ToolUse,
	}

	#[derive(Copy, Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
	pub struct Usage {
		pub input_tokens: u32,
		#[serde(default)]
		pub output_tokens: u32,
	}
}
