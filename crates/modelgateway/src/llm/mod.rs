//! Provider codecs: translate the uniform request/response model to and from
//! each provider's wire schema. `encode` and `decode_response` are pure;
//! `decode_stream` is incremental and never buffers the full response.

use futures::Stream;

use crate::types::provider::{Capability, ProviderDescriptor, ProviderKind};
use crate::types::uniform::*;
use crate::*;

pub mod anthropic;
pub mod bedrock;
pub mod google;
pub mod ollama;
pub mod openai;
#[cfg(test)]
mod tests;

/// The on-wire form of an encoded request: everything the provider client
/// needs besides the base URL and credentials.
#[derive(Debug)]
pub struct EncodedRequest {
	pub method: http::Method,
	pub path: String,
	pub headers: http::HeaderMap,
	pub body: Bytes,
}

/// Bytes arriving from the upstream connection.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

/// Decoded uniform chunks flowing toward the client.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, AIError>> + Send>>;

#[derive(thiserror::Error, Debug)]
pub enum AIError {
	#[error("unsupported capability: {0}")]
	UnsupportedCapability(Capability),
	#[error("request has no messages")]
	MessageNotFound,
	#[error("response was missing fields")]
	IncompleteResponse,
	#[error("failed to marshal request: {0}")]
	RequestMarshal(#[source] serde_json::Error),
	#[error("failed to parse response at byte {offset}: {source}")]
	ResponseParsing {
		#[source]
		source: serde_json::Error,
		offset: usize,
	},
	#[error("stream protocol error: {0}")]
	StreamProtocol(String),
	#[error("upstream transport error: {0}")]
	Transport(String),
}

impl AIError {
	pub fn parse(source: serde_json::Error) -> AIError {
		let offset = source.column().saturating_sub(1);
		AIError::ResponseParsing { source, offset }
	}

	/// Encode-side errors are the caller's fault (400-class); everything else
	/// is a provider fault (502-class).
	pub fn is_client_error(&self) -> bool {
		matches!(
			self,
			AIError::UnsupportedCapability(_) | AIError::MessageNotFound | AIError::RequestMarshal(_)
		)
	}
}

/// The model name sent upstream: the descriptor override wins, otherwise the
/// canonical model from the request.
pub fn upstream_model(desc: &ProviderDescriptor, req: &UniformRequest) -> Strng {
	desc
		.model_override
		.clone()
		.unwrap_or_else(|| req.model.clone())
}

fn check_capabilities(desc: &ProviderDescriptor, req: &UniformRequest) -> Result<(), AIError> {
	if req.messages.is_empty() {
		return Err(AIError::MessageNotFound);
	}
	if req.stream && !desc.supports(Capability::Streaming) {
		return Err(AIError::UnsupportedCapability(Capability::Streaming));
	}
	if req.has_tools() && !desc.supports(Capability::Tools) {
		return Err(AIError::UnsupportedCapability(Capability::Tools));
	}
	if req.needs_vision() && !desc.supports(Capability::Vision) {
		return Err(AIError::UnsupportedCapability(Capability::Vision));
	}
	if !desc.supports(Capability::SystemMsg)
		&& req.messages.iter().any(|m| m.role == Role::System)
	{
		return Err(AIError::UnsupportedCapability(Capability::SystemMsg));
	}
	Ok(())
}

pub fn encode(desc: &ProviderDescriptor, req: &UniformRequest) -> Result<EncodedRequest, AIError> {
	check_capabilities(desc, req)?;
	let model = upstream_model(desc, req);
	match desc.kind {
		k if k.is_openai_wire() => openai::encode(req, &model),
		ProviderKind::Anthropic => anthropic::encode(req, &model),
		ProviderKind::Google => google::encode(req, &model),
		ProviderKind::Bedrock => bedrock::encode(req, &model),
		ProviderKind::Ollama => ollama::encode(req, &model),
		_ => unreachable!("openai wire kinds handled above"),
	}
}

pub fn decode_response(
	desc: &ProviderDescriptor,
	model: &str,
	body: &Bytes,
) -> Result<UniformResponse, AIError> {
	match desc.kind {
		k if k.is_openai_wire() => openai::decode_response(body),
		ProviderKind::Anthropic => anthropic::decode_response(body),
		ProviderKind::Google => google::decode_response(body, model),
		ProviderKind::Bedrock => bedrock::decode_response(body, model),
		ProviderKind::Ollama => ollama::decode_response(body),
		_ => unreachable!("openai wire kinds handled above"),
	}
}

pub fn decode_stream(desc: &ProviderDescriptor, model: Strng, bytes: ByteStream) -> ChunkStream {
	match desc.kind {
		k if k.is_openai_wire() => openai::decode_stream(bytes),
		ProviderKind::Anthropic => anthropic::decode_stream(bytes, model),
		ProviderKind::Google => google::decode_stream(bytes, model),
		ProviderKind::Bedrock => bedrock::decode_stream(bytes, model),
		ProviderKind::Ollama => ollama::decode_stream(bytes),
		_ => unreachable!("openai wire kinds handled above"),
	}
}

/// Best-effort extraction of a human-readable message from a provider error
/// body. Falls back to the raw body (truncated) when the shape is unknown.
pub fn decode_error_message(desc: &ProviderDescriptor, body: &Bytes) -> String {
	let parsed: Option<String> = match desc.kind {
		ProviderKind::Anthropic => anthropic::decode_error(body),
		ProviderKind::Bedrock => bedrock::decode_error(body),
		ProviderKind::Google => google::decode_error(body),
		_ => openai::decode_error(body),
	};
	parsed.unwrap_or_else(|| {
		let text = String::from_utf8_lossy(body);
		text.trim().chars().take(256).collect()
	})
}

pub(crate) fn now_ts() -> i64 {
	chrono::Utc::now().timestamp()
}

/// A terminal chunk carrying only a finish reason, used by codecs whose wire
/// protocol signals completion out of band.
pub(crate) fn finish_chunk(
	id: &str,
	model: &str,
	created: i64,
	reason: FinishReason,
	usage: Option<Usage>,
) -> UniformChunk {
	UniformChunk {
		id: id.to_string(),
		object: OBJECT_CHUNK.to_string(),
		created,
		model: model.to_string(),
		choices: vec![ChunkChoice {
			index: 0,
			delta: Delta::default(),
			finish_reason: Some(reason),
		}],
		usage,
	}
}

/// A role-only first chunk.
pub(crate) fn role_chunk(id: &str, model: &str, created: i64) -> UniformChunk {
	UniformChunk {
		id: id.to_string(),
		object: OBJECT_CHUNK.to_string(),
		created,
		model: model.to_string(),
		choices: vec![ChunkChoice {
			index: 0,
			delta: Delta {
				role: Some(Role::Assistant),
				..Default::default()
			},
			finish_reason: None,
		}],
		usage: None,
	}
}

/// A content-delta chunk.
pub(crate) fn content_chunk(id: &str, model: &str, created: i64, text: String) -> UniformChunk {
	UniformChunk {
		id: id.to_string(),
		object: OBJECT_CHUNK.to_string(),
		created,
		model: model.to_string(),
		choices: vec![ChunkChoice {
			index: 0,
			delta: Delta {
				content: Some(text),
				..Default::default()
			},
			finish_reason: None,
		}],
		usage: None,
	}
}
