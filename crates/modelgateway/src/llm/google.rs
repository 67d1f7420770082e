//! Google Gemini generateContent codec (native API shape).

use async_stream::try_stream;
use futures::StreamExt;

use crate::llm::{AIError, ByteStream, ChunkStream, EncodedRequest};
use crate::parse::sse::SseScanner;
use crate::types::uniform::*;
use crate::*;

pub fn encode(req: &UniformRequest, model: &str) -> Result<EncodedRequest, AIError> {
	let body = translate_request(req)?;
	let body = serde_json::to_vec(&body).map_err(AIError::RequestMarshal)?;
	let path = if req.stream {
		format!("/v1beta/models/{model}:streamGenerateContent?alt=sse")
	} else {
		format!("/v1beta/models/{model}:generateContent")
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

pub(super) fn translate_request(req: &UniformRequest) -> Result<types::GenerateRequest, AIError> {
	let system_text = req
		.messages
		.iter()
		.filter(|m| m.role == Role::System)
		.map(|m| m.content.text())
		.collect::<Vec<_>>()
		.join("\n");
	let system_instruction = if system_text.is_empty() {
		None
	} else {
		Some(types::Content {
			role: None,
			parts: vec![types::Part::Text { text: system_text }],
		})
	};

	let mut contents = Vec::new();
	for msg in req.messages.iter().filter(|m| m.role != Role::System) {
		let (role, parts) = match msg.role {
			Role::Assistant => {
				let mut parts = Vec::new();
				let text = msg.content.text();
				if !text.is_empty() {
					parts.push(types::Part::Text { text });
				}
				for tc in msg.tool_calls.iter().flatten() {
					let args = serde_json::from_str(&tc.function.arguments)
						.unwrap_or(serde_json::Value::Object(Default::default()));
					parts.push(types::Part::FunctionCall {
						function_call: types::FunctionCall {
							name: tc.function.name.clone(),
							args,
						},
					});
				}
				("model", parts)
			},
			Role::Tool => {
				let response = serde_json::from_str(&msg.content.text())
					.unwrap_or_else(|_| serde_json::json!({"result": msg.content.text()}));
				(
					"user",
					vec![types::Part::FunctionResponse {
						function_response: types::FunctionResponse {
							name: msg.name.clone().unwrap_or_default(),
							response,
						},
					}],
				)
			},
			_ => {
				let parts = match &msg.content {
					Content::Text(text) => vec![types::Part::Text { text: text.clone() }],
					Content::Parts(parts) => parts
						.iter()
						.map(|p| match p {
							ContentPart::Text { text } => types::Part::Text { text: text.clone() },
							ContentPart::ImageUrl { image_url } => types::Part::FileData {
								file_data: types::FileData {
									file_uri: image_url.url.clone(),
								},
							},
						})
						.collect(),
				};
				("user", parts)
			},
		};
		contents.push(types::Content {
			role: Some(role.to_string()),
			parts,
		});
	}

	let tools = req.tools.as_ref().map(|tools| {
		vec![types::Tool {
			function_declarations: tools
				.iter()
				.map(|t| types::FunctionDeclaration {
					name: t.function.name.clone(),
					description: t.function.description.clone(),
					parameters: t.function.parameters.clone(),
				})
				.collect(),
		}]
	});

	Ok(types::GenerateRequest {
		contents,
		system_instruction,
		generation_config: Some(types::GenerationConfig {
			temperature: req.temperature,
			top_p: req.top_p,
			max_output_tokens: req.max_tokens,
			stop_sequences: if req.stop.is_empty() {
				None
			} else {
				Some(req.stop.clone())
			},
		}),
		tools,
	})
}

pub fn decode_response(body: &Bytes, model: &str) -> Result<UniformResponse, AIError> {
	let resp = serde_json::from_slice::<types::GenerateResponse>(body).map_err(AIError::parse)?;
	translate_response(resp, model)
}

pub(super) fn translate_response(
	resp: types::GenerateResponse,
	model: &str,
) -> Result<UniformResponse, AIError> {
	let candidate = resp
		.candidates
		.into_iter()
		.next()
		.ok_or(AIError::IncompleteResponse)?;

	let mut content: Option<String> = None;
	let mut tool_calls = Vec::new();
	for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
		match part {
			types::Part::Text { text } => match &mut content {
				Some(existing) => existing.push_str(&text),
				None => content = Some(text),
			},
			types::Part::FunctionCall { function_call } => {
				tool_calls.push(ToolCall {
					// Gemini function calls carry no id; synthesize a stable one.
					id: format!("call_{}", tool_calls.len()),
					kind: ToolType::Function,
					function: FunctionCall {
						name: function_call.name,
						arguments: function_call.args.to_string(),
					},
				});
			},
			_ => {},
		}
	}

	let finish_reason = if !tool_calls.is_empty() {
		Some(FinishReason::ToolCalls)
	} else {
		candidate.finish_reason.as_deref().map(translate_finish)
	};

	let usage = resp.usage_metadata.map(|u| Usage {
		prompt_tokens: u.prompt_token_count,
		completion_tokens: u.candidates_token_count,
		total_tokens: u.total_token_count,
	});

	Ok(UniformResponse {
		id: format!("gemini-{}", super::now_ts()),
		object: OBJECT_COMPLETION.to_string(),
		created: super::now_ts(),
		model: resp.model_version.unwrap_or_else(|| model.to_string()),
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
			finish_reason,
		}],
		usage,
	})
}

fn translate_finish(reason: &str) -> FinishReason {
	match reason {
		"STOP" => FinishReason::Stop,
		"MAX_TOKENS" => FinishReason::Length,
		"SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" => FinishReason::ContentFilter,
		_ => FinishReason::Stop,
	}
}

pub fn decode_stream(bytes: ByteStream, model: Strng) -> ChunkStream {
	Box::pin(try_stream! {
		let mut scanner = SseScanner::new();
		let mut bytes = bytes;
		let created = super::now_ts();
		let id = format!("gemini-{created}");
		let mut sent_role = false;
		let mut finished = false;
		let mut usage: Option<Usage> = None;

		while let Some(chunk) = bytes.next().await {
			let chunk = chunk.map_err(|e| AIError::Transport(e.to_string()))?;
			scanner.push(&chunk);
			while let Some(event) = scanner.next_event() {
				let parsed = serde_json::from_str::<types::GenerateResponse>(&event.data)
					.map_err(AIError::parse)?;
				if let Some(u) = parsed.usage_metadata {
					usage = Some(Usage {
						prompt_tokens: u.prompt_token_count,
						completion_tokens: u.candidates_token_count,
						total_tokens: u.total_token_count,
					});
				}
				let Some(candidate) = parsed.candidates.into_iter().next() else {
					// An event with no candidates carries usage only.
					continue;
				};
				if !sent_role {
					sent_role = true;
					yield StreamEvent::Chunk(super::role_chunk(&id, &model, created));
				}
				for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
					if let types::Part::Text { text } = part {
						yield StreamEvent::Chunk(super::content_chunk(&id, &model, created, text));
					}
				}
				if let Some(reason) = candidate.finish_reason.as_deref() {
					finished = true;
					yield StreamEvent::Chunk(super::finish_chunk(
						&id, &model, created, translate_finish(reason), usage.take(),
					));
				}
			}
		}
		// Gemini streams have no explicit sentinel; the final event carries
		// the finish reason and the connection closes.
		if finished {
			yield StreamEvent::Done;
		} else {
			Err(AIError::StreamProtocol("stream ended without finish reason".to_string()))?;
		}
	})
}

pub fn decode_error(body: &Bytes) -> Option<String> {
	let err = serde_json::from_slice::<types::ErrorResponse>(body).ok()?;
	Some(err.error.message)
}

pub(super) mod types {
	use serde::{Deserialize, Serialize};

	#[derive(Debug, Clone, Serialize)]
	#[serde(rename_all = "camelCase")]
	pub struct GenerateRequest {
		pub contents: Vec<Content>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub system_instruction: Option<Content>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub generation_config: Option<GenerationConfig>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub tools: Option<Vec<Tool>>,
	}

	#[derive(Debug, Clone, Serialize, Deserialize)]
	#[serde(rename_all = "camelCase")]
	pub struct Content {
		#[serde(skip_serializing_if = "Option::is_none")]
		pub role: Option<String>,
		#[serde(default)]
		pub parts: Vec<Part>,
	}

	#[derive(Debug, Clone, Serialize, Deserialize)]
	#[serde(rename_all = "camelCase", untagged)]
	pub enum Part {
		Text {
			text: String,
		},
		FunctionCall {
			#[serde(rename = "functionCall")]
			function_call: FunctionCall,
		},
		FunctionResponse {
			#[serde(rename = "functionResponse")]
			function_response: FunctionResponse,
		},
		FileData {
			#[serde(rename = "fileData")]
			file_data: FileData,
		},
	}

	#[derive(Debug, Clone, Serialize, Deserialize)]
	pub struct FunctionCall {
		pub name: String,
		#[serde(default)]
		pub args: serde_json::Value,
	}

	#[derive(Debug, Clone, Serialize, Deserialize)]
	pub struct FunctionResponse {
		pub name: String,
		pub response: serde_json::Value,
	}

	#[derive(Debug, Clone, Serialize, Deserialize)]
	#[serde(rename_all = "camelCase")]
	pub struct FileData {
		pub file_uri: String,
	}

	#[derive(Debug, Clone, Serialize, Deserialize)]
	#[serde(rename_all = "camelCase")]
	pub struct GenerationConfig {
		#[serde(skip_serializing_if = "Option::is_none")]
		pub temperature: Option<f64>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub top_p: Option<f64>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub max_output_tokens: Option<u64>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub stop_sequences: Option<Vec<String>>,
	}

	#[derive(Debug, Clone, Serialize)]
	#[serde(rename_all = "camelCase")]
	pub struct Tool {
		pub function_declarations: Vec<FunctionDeclaration>,
	}

	#[derive(Debug, Clone, Serialize)]
	#[serde(rename_all = "camelCase")]
	pub struct FunctionDeclaration {
		pub name: String,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub description: Option<String>,
		pub parameters: serde_json::Value,
	}

	#[derive(Debug, Clone, Deserialize)]
	#[serde(rename_all = "camelCase")]
	pub struct GenerateResponse {
		#[serde(default)]
		pub candidates: Vec<Candidate>,
		#[serde(default)]
		pub usage_metadata: Option<UsageMetadata>,
		#[serde(default)]
		pub model_version: Option<String>,
	}

	#[derive(Debug, Clone, Deserialize)]
	#[serde(rename_all = "camelCase")]
	pub struct Candidate {
		#[serde(default)]
		pub content: Option<Content>,
		#[serde(default)]
		pub finish_reason: Option<String>,
	}

	#[derive(Debug, Clone, Copy, Deserialize)]
	#[serde(rename_all = "camelCase")]
	pub struct UsageMetadata {
		#[serde(default)]
		pub prompt_token_count: u32,
		#[serde(default)]
		pub candidates_token_count: u32,
		#[serde(default)]
		pub total_token_count: u32,
	}

	#[derive(Debug, Deserialize)]
	pub struct ErrorResponse {
		pub error: ErrorDetail,
	}

	#[derive(Debug, Deserialize)]
	pub struct ErrorDetail {
		pub message: String,
		#[serde(default)]
		pub status: Option<String>,
	}
}
