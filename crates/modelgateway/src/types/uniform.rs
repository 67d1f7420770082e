//! The uniform chat-completion model. Inbound requests are parsed into this
//! shape once; every provider codec translates from and back to it. The wire
//! field names follow the OpenAI chat completions schema, which is also what
//! we serve back to clients.

use crate::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
	System,
	User,
	Assistant,
	Tool,
}

impl Role {
	pub fn as_str(&self) -> &'static str {
		match self {
			Role::System => "system",
			Role::User => "user",
			Role::Assistant => "assistant",
			Role::Tool => "tool",
		}
	}
}

/// Message content: plain text or multi-part (text and image parts).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
	Text(String),
	Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ContentPart {
	Text { text: String },
	ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageUrl {
	pub url: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub detail: Option<String>,
}

impl Content {
	/// The text of this content, joining multi-part text segments. Image
	/// parts are skipped.
	pub fn text(&self) -> String {
		match self {
			Content::Text(t) => t.clone(),
			Content::Parts(parts) => parts
				.iter()
				.filter_map(|p| match p {
					ContentPart::Text { text } => Some(text.as_str()),
					ContentPart::ImageUrl { .. } => None,
				})
				.collect::<Vec<_>>()
				.join("\n"),
		}
	}

	pub fn has_image(&self) -> bool {
		matches!(self, Content::Parts(parts) if parts.iter().any(|p| matches!(p, ContentPart::ImageUrl { .. })))
	}

	pub fn char_len(&self) -> usize {
		match self {
			Content::Text(t) => t.len(),
			Content::Parts(parts) => parts
				.iter()
				.map(|p| match p {
					ContentPart::Text { text } => text.len(),
					ContentPart::ImageUrl { .. } => 0,
				})
				.sum(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
	pub role: Role,
	pub content: Content,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tool_calls: Option<Vec<ToolCall>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tool_call_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolType {
	Function,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
	pub id: String,
	#[serde(rename = "type")]
	pub kind: ToolType,
	pub function: FunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
	pub name: String,
	/// JSON-encoded arguments, passed through verbatim.
	pub arguments: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDef {
	#[serde(rename = "type")]
	pub kind: ToolType,
	pub function: FunctionDef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDef {
	pub name: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub description: Option<String>,
	#[serde(default = "empty_schema")]
	pub parameters: serde_json::Value,
}

fn empty_schema() -> serde_json::Value {
	serde_json::json!({"type": "object", "properties": {}})
}

/// Client routing hints carried in the request body under `routing`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingHints {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub preferred_provider: Option<Strng>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub cost_weight: Option<f64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub latency_weight: Option<f64>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub required_capabilities: Vec<crate::types::provider::Capability>,
}

/// The request as owned by the dispatch pipeline: identity, model, messages,
/// sampling knobs and routing hints. Immutable once constructed.
#[derive(Debug, Clone)]
pub struct UniformRequest {
	pub id: Strng,
	pub principal: Strng,
	pub tenant: Strng,
	pub model: Strng,
	pub messages: Vec<Message>,
	pub temperature: Option<f64>,
	pub top_p: Option<f64>,
	pub max_tokens: Option<u64>,
	pub stop: Vec<String>,
	pub tools: Option<Vec<ToolDef>>,
	pub stream: bool,
	pub deadline: Option<Instant>,
	pub idempotency_key: Option<String>,
	pub hints: RoutingHints,
}

impl UniformRequest {
	/// Rough input token estimate used for cost-based routing when the
	/// request has not been tokenized: prompt characters divided by four.
	pub fn estimated_input_tokens(&self) -> u64 {
		let chars: usize = self.messages.iter().map(|m| m.content.char_len()).sum();
		(chars / 4) as u64
	}

	pub fn estimated_output_tokens(&self) -> u64 {
		self.max_tokens.unwrap_or(1024)
	}

	pub fn needs_vision(&self) -> bool {
		self.messages.iter().any(|m| m.content.has_image())
	}

	pub fn has_tools(&self) -> bool {
		self.tools.as_ref().is_some_and(|t| !t.is_empty())
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
	Stop,
	Length,
	ToolCalls,
	ContentFilter,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
	pub prompt_tokens: u32,
	pub completion_tokens: u32,
	pub total_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMessage {
	pub role: Role,
	pub content: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
	pub index: u32,
	pub message: ResponseMessage,
	pub finish_reason: Option<FinishReason>,
}

/// A complete (non-streaming) response in the uniform shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UniformResponse {
	pub id: String,
	pub object: String,
	pub created: i64,
	pub model: String,
	pub choices: Vec<Choice>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub usage: Option<Usage>,
}

pub const OBJECT_COMPLETION: &str = "chat.completion";
pub const OBJECT_CHUNK: &str = "chat.completion.chunk";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Delta {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub role: Option<Role>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub content: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallDelta {
	pub index: u32,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub id: Option<String>,
	#[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
	pub kind: Option<ToolType>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub function: Option<FunctionCallDelta>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FunctionCallDelta {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub arguments: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkChoice {
	pub index: u32,
	pub delta: Delta,
	pub finish_reason: Option<FinishReason>,
}

/// One delta event of a streaming response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UniformChunk {
	pub id: String,
	pub object: String,
	pub created: i64,
	pub model: String,
	pub choices: Vec<ChunkChoice>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub usage: Option<Usage>,
}

impl UniformChunk {
	pub fn content_delta(&self) -> Option<&str> {
		self
			.choices
			.first()
			.and_then(|c| c.delta.content.as_deref())
	}

	pub fn finish_reason(&self) -> Option<FinishReason> {
		self.choices.first().and_then(|c| c.finish_reason)
	}
}

/// An item of a decoded provider stream. The terminator is an explicit,
/// observable sentinel: a well-formed stream yields any number of `Chunk`
/// items followed by exactly one `Done`.
#[derive(Debug, Clone)]
pub enum StreamEvent {
	Chunk(UniformChunk),
	Done,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn content_accepts_text_and_parts() {
		let text: Content = serde_json::from_str(r#""hello""#).unwrap();
		assert_eq!(text.text(), "hello");

		let parts: Content = serde_json::from_str(
			r#"[{"type":"text","text":"a"},{"type":"image_url","image_url":{"url":"http://x/y.png"}}]"#,
		)
		.unwrap();
		assert_eq!(parts.text(), "a");
		assert!(parts.has_image());
	}

	#[test]
	fn finish_reason_wire_names() {
		assert_eq!(
			serde_json::to_string(&FinishReason::ToolCalls).unwrap(),
			r#""tool_calls""#
		);
		assert_eq!(
			serde_json::to_string(&FinishReason::ContentFilter).unwrap(),
			r#""content_filter""#
		);
	}
}
