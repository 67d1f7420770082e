//! Ollama native chat codec. Streams are newline-delimited JSON; the final
//! object carries `done: true` plus token counts.

use async_stream::try_stream;
use futures::StreamExt;

use crate::llm::{AIError, ByteStream, ChunkStream, EncodedRequest};
use crate::parse::sse::LineScanner;
use crate::types::uniform::*;
use crate::*;

pub const DEFAULT_PATH: &str = "/api/chat";

pub fn encode(req: &UniformRequest, model: &str) -> Result<EncodedRequest, AIError> {
	let messages = req
		.messages
		.iter()
		.map(|m| types::Message {
			role: m.role.as_str().to_string(),
			content: m.content.text(),
		})
		.collect();
	let body = types::ChatRequest {
		model: model.to_string(),
		messages,
		stream: req.stream,
		options: Some(types::Options {
			temperature: req.temperature,
			top_p: req.top_p,
			num_predict: req.max_tokens,
			stop: if req.stop.is_empty() {
				None
			} else {
				Some(req.stop.clone())
			},
		}),
	};
	let body = serde_json::to_vec(&body).map_err(AIError::RequestMarshal)?;
	let mut headers = http::HeaderMap::new();
	headers.insert(
		http::header::CONTENT_TYPE,
		http::HeaderValue::from_static("application/json"),
	);
	Ok(EncodedRequest {
		method: http::Method::POST,
		path: DEFAULT_PATH.to_string(),
		headers,
		body: Bytes::from(body),
	})
}

pub fn decode_response(body: &Bytes) -> Result<UniformResponse, AIError> {
	let resp = serde_json::from_slice::<types::ChatResponse>(body).map_err(AIError::parse)?;
	let usage = resp.usage();
	let message = resp.message.ok_or(AIError::IncompleteResponse)?;
	Ok(UniformResponse {
		id: format!("ollama-{}", super::now_ts()),
		object: OBJECT_COMPLETION.to_string(),
		created: super::now_ts(),
		model: resp.model,
		choices: vec![Choice {
			index: 0,
			message: ResponseMessage {
				role: Role::Assistant,
				content: Some(message.content),
				tool_calls: None,
			},
			finish_reason: Some(translate_done_reason(resp.done_reason.as_deref())),
		}],
		usage: Some(usage),
	})
}

fn translate_done_reason(reason: Option<&str>) -> FinishReason {
	match reason {
		Some("length") => FinishReason::Length,
		_ => FinishReason::Stop,
	}
}

pub fn decode_stream(bytes: ByteStream) -> ChunkStream {
	Box::pin(try_stream! {
		let mut scanner = LineScanner::new();
		let mut bytes = bytes;
		let created = super::now_ts();
		let id = format!("ollama-{created}");
		let mut sent_role = false;
		let mut done = false;

		'outer: while let Some(chunk) = bytes.next().await {
			let chunk = chunk.map_err(|e| AIError::Transport(e.to_string()))?;
			scanner.push(&chunk);
			while let Some(line) = scanner.next_line() {
				let parsed = serde_json::from_str::<types::ChatResponse>(&line).map_err(AIError::parse)?;
				if !sent_role {
					sent_role = true;
					yield StreamEvent::Chunk(super::role_chunk(&id, &parsed.model, created));
				}
				if let Some(message) = &parsed.message
					&& !message.content.is_empty()
				{
					yield StreamEvent::Chunk(super::content_chunk(
						&id, &parsed.model, created, message.content.clone(),
					));
				}
				if parsed.done {
					let usage = parsed.usage();
					yield StreamEvent::Chunk(super::finish_chunk(
						&id,
						&parsed.model,
						created,
						translate_done_reason(parsed.done_reason.as_deref()),
						Some(usage),
					));
					done = true;
					yield StreamEvent::Done;
					break 'outer;
				}
			}
		}
		if !done {
			Err(AIError::StreamProtocol("stream ended without done marker".to_string()))?;
		}
	})
}

pub(super) mod types {
	use serde::{Deserialize, Serialize};

	use crate::types::uniform::Usage;

	#[derive(Debug, Serialize)]
	pub struct ChatRequest {
		pub model: String,
		pub messages: Vec<Message>,
		pub stream: bool,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub options: Option<Options>,
	}

	#[derive(Debug, Serialize, Deserialize)]
	pub struct Message {
		pub role: String,
		pub content: String,
	}

	#[derive(Debug, Serialize)]
	pub struct Options {
		#[serde(skip_serializing_if = "Option::is_none")]
		pub temperature: Option<f64>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub top_p: Option<f64>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub num_predict: Option<u64>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub stop: Option<Vec<String>>,
	}

	#[derive(Debug, Deserialize)]
	pub struct ChatResponse {
		pub model: String,
		#[serde(default)]
		pub message: Option<Message>,
		#[serde(default)]
		pub done: bool,
		#[serde(default)]
		pub done_reason: Option<String>,
		#[serde(default)]
		pub prompt_eval_count: Option<u32>,
		#[serde(default)]
		pub eval_count: Option<u32>,
	}

	impl ChatResponse {
		pub fn usage(&self) -> Usage {
			let prompt = self.prompt_eval_count.unwrap_or_default();
			let completion = self.eval_count.unwrap_or_default();
			Usage {
				prompt_tokens: prompt,
				completion_tokens: completion,
				total_tokens: prompt + completion,
			}
		}
	}
}
