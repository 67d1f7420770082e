//! OpenAI-compatible wire codec. Also used for the `vllm` and `generic`
//! provider kinds, which speak the same schema. Since the uniform model
//! mirrors this schema, translation is mostly serialization.

use async_stream::try_stream;
use futures::StreamExt;

use crate::llm::{AIError, ByteStream, ChunkStream, EncodedRequest};
use crate::parse::sse::SseScanner;
use crate::types::uniform::*;
use crate::*;

pub const DEFAULT_PATH: &str = "/v1/chat/completions";
pub const DONE_SENTINEL: &str = "[DONE]";

pub fn encode(req: &UniformRequest, model: &str) -> Result<EncodedRequest, AIError> {
	let body = types::Request {
		model,
		messages: &req.messages,
		temperature: req.temperature,
		top_p: req.top_p,
		max_tokens: req.max_tokens,
		stop: if req.stop.is_empty() {
			None
		} else {
			Some(&req.stop)
		},
		tools: req.tools.as_deref(),
		stream: req.stream,
		// Always request usage on streams; the terminal accounting depends
		// on it.
		stream_options: req.stream.then_some(types::StreamOptions {
			include_usage: true,
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
	serde_json::from_slice::<UniformResponse>(body).map_err(AIError::parse)
}

pub fn decode_stream(bytes: ByteStream) -> ChunkStream {
	Box::pin(try_stream! {
		let mut scanner = SseScanner::new();
		let mut bytes = bytes;
		let mut done = false;
		while let Some(chunk) = bytes.next().await {
			let chunk = chunk.map_err(|e| AIError::Transport(e.to_string()))?;
			scanner.push(&chunk);
			while let Some(event) = scanner.next_event() {
				if event.data == DONE_SENTINEL {
					done = true;
					yield StreamEvent::Done;
					break;
				}
				let parsed = serde_json::from_str::<UniformChunk>(&event.data).map_err(AIError::parse)?;
				yield StreamEvent::Chunk(parsed);
			}
			if done {
				break;
			}
		}
		if !done {
			Err(AIError::StreamProtocol("stream ended without [DONE]".to_string()))?;
		}
	})
}

pub fn decode_error(body: &Bytes) -> Option<String> {
	let err = serde_json::from_slice::<types::ErrorResponse>(body).ok()?;
	Some(err.error.message)
}

pub(super) mod types {
	use serde::{Deserialize, Serialize};

	use crate::types::uniform::{Message, ToolDef};

	#[derive(Debug, Serialize)]
	pub struct Request<'a> {
		pub model: &'a str,
		pub messages: &'a [Message],
		#[serde(skip_serializing_if = "Option::is_none")]
		pub temperature: Option<f64>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub top_p: Option<f64>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub max_tokens: Option<u64>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub stop: Option<&'a [String]>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub tools: Option<&'a [ToolDef]>,
		#[serde(skip_serializing_if = "std::ops::Not::not")]
		pub stream: bool,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub stream_options: Option<StreamOptions>,
	}

	#[derive(Debug, Serialize)]
	pub struct StreamOptions {
		pub include_usage: bool,
	}

	#[derive(Debug, Deserialize)]
	pub struct ErrorResponse {
		pub error: ErrorDetail,
	}

	#[derive(Debug, Deserialize)]
	pub struct ErrorDetail {
		pub message: String,
		#[serde(default)]
		pub r#type: Option<String>,
		#[serde(default)]
		pub code: Option<serde_json::Value>,
	}
}
