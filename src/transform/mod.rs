//! Dialect transformation layer.
//!
//! One transformer per wire dialect converts between that dialect and the
//! unified internal representation, for unary bodies and for SSE streams.
//! Conversions preserve semantic content; dialect features with no
//! counterpart on the target side are dropped with a structured warning.

pub mod chat;
pub mod gemini;
pub mod messages;
pub mod responses;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::pricing::{Pricing, TokenCounts};

/// Supported wire dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiType {
    Chat,
    Messages,
    Gemini,
    Responses,
}

impl ApiType {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "chat" | "openai" => Some(ApiType::Chat),
            "messages" | "anthropic" => Some(ApiType::Messages),
            "gemini" | "google" => Some(ApiType::Gemini),
            "responses" => Some(ApiType::Responses),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ApiType::Chat => "chat",
            ApiType::Messages => "messages",
            ApiType::Gemini => "gemini",
            ApiType::Responses => "responses",
        }
    }
}

impl std::fmt::Display for ApiType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Message author role in the unified representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
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

/// Where image/file bytes come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum MediaSource {
    Base64 { media_type: String, data: String },
    Url { url: String },
    FileId { file_id: String },
}

/// One ordered piece of message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ContentPart {
    Text { text: String },
    Reasoning { text: String },
    Image { source: MediaSource },
    Document { source: MediaSource, media_type: Option<String> },
    ToolUse { id: String, name: String, arguments: Value },
    ToolResult { tool_use_id: String, content: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedMessage {
    pub role: Role,
    pub parts: Vec<ContentPart>,
}

impl UnifiedMessage {
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            parts: vec![ContentPart::Text { text: text.into() }],
        }
    }

    /// Concatenated text of all text parts.
    pub fn plain_text(&self) -> String {
        let mut out = String::new();
        for part in &self.parts {
            if let ContentPart::Text { text } = part {
                out.push_str(text);
            }
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: Option<String>,
    pub parameters: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoice {
    Auto,
    None,
    Required,
    Tool(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormat {
    Text,
    Json { schema: Option<Value> },
}

/// Structured warning for an inbound feature dropped during conversion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformWarning {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
}

impl TransformWarning {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

/// Dialect-agnostic request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedRequest {
    pub model: String,
    pub messages: Vec<UnifiedMessage>,
    pub system: Option<String>,
    pub tools: Vec<ToolDefinition>,
    pub tool_choice: Option<ToolChoice>,
    pub max_tokens: Option<u64>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub stop_sequences: Vec<String>,
    pub response_format: Option<ResponseFormat>,
    pub stream: bool,
    pub metadata: Option<Value>,
    pub incoming_api_type: ApiType,
    pub original_body: Value,
    pub request_id: String,
    pub warnings: Vec<TransformWarning>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolUse,
    ContentFilter,
    Other(String),
}

impl FinishReason {
    pub fn as_openai(&self) -> &str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
            FinishReason::ToolUse => "tool_calls",
            FinishReason::ContentFilter => "content_filter",
            FinishReason::Other(s) => s,
        }
    }

    pub fn as_anthropic(&self) -> &str {
        match self {
            FinishReason::Stop => "end_turn",
            FinishReason::Length => "max_tokens",
            FinishReason::ToolUse => "tool_use",
            FinishReason::ContentFilter => "refusal",
            FinishReason::Other(s) => s,
        }
    }

    pub fn as_gemini(&self) -> &str {
        match self {
            FinishReason::Stop => "STOP",
            FinishReason::Length => "MAX_TOKENS",
            FinishReason::ToolUse => "STOP",
            FinishReason::ContentFilter => "SAFETY",
            FinishReason::Other(s) => s,
        }
    }

    pub fn from_openai(s: &str) -> Self {
        match s {
            "stop" => FinishReason::Stop,
            "length" => FinishReason::Length,
            "tool_calls" | "function_call" => FinishReason::ToolUse,
            "content_filter" => FinishReason::ContentFilter,
            other => FinishReason::Other(other.to_string()),
        }
    }

    pub fn from_anthropic(s: &str) -> Self {
        match s {
            "end_turn" | "stop_sequence" => FinishReason::Stop,
            "max_tokens" => FinishReason::Length,
            "tool_use" => FinishReason::ToolUse,
            "refusal" => FinishReason::ContentFilter,
            other => FinishReason::Other(other.to_string()),
        }
    }

    pub fn from_gemini(s: &str) -> Self {
        match s {
            "STOP" => FinishReason::Stop,
            "MAX_TOKENS" => FinishReason::Length,
            "SAFETY" | "RECITATION" => FinishReason::ContentFilter,
            other => FinishReason::Other(other.to_string()),
        }
    }
}

/// Routing metadata attached to a response internally. Stripped before the
/// body reaches the client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlexusEnvelope {
    pub provider: String,
    pub model: String,
    pub canonical_model: String,
    pub api_type: Option<ApiType>,
    pub pricing: Option<Pricing>,
    pub provider_discount: Option<f64>,
    pub attempt_count: u32,
    pub final_attempt_provider: String,
    pub final_attempt_model: String,
    pub all_attempted_providers: Vec<String>,
}

/// Dialect-agnostic response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnifiedResponse {
    pub id: String,
    pub model: String,
    pub parts: Vec<ContentPart>,
    pub finish_reason: Option<FinishReason>,
    pub usage: TokenCounts,
    pub raw_response: Option<Value>,
    pub bypass_transformation: bool,
    pub warnings: Vec<TransformWarning>,
    pub plexus: PlexusEnvelope,
}

/// Partial usage pulled from one stream event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageDelta {
    pub input: Option<i64>,
    pub output: Option<i64>,
    pub reasoning: Option<i64>,
    pub cached: Option<i64>,
    pub cache_write: Option<i64>,
}

impl UsageDelta {
    pub fn is_empty(&self) -> bool {
        self.input.is_none()
            && self.output.is_none()
            && self.reasoning.is_none()
            && self.cached.is_none()
            && self.cache_write.is_none()
    }
}

/// One unit of a unified streaming response.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    Start { id: String, model: String },
    TextDelta { index: usize, text: String },
    ReasoningDelta { index: usize, text: String },
    ToolCallStart { index: usize, id: String, name: String },
    ToolCallDelta { index: usize, arguments: String },
    Usage(UsageDelta),
    Finish { reason: FinishReason },
    Done,
}

#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Stateful decoder: provider-dialect SSE event data -> unified chunks.
pub trait StreamDecoder: Send {
    fn decode_event(&mut self, data: &str) -> Vec<StreamChunk>;
    fn finish(&mut self) -> Vec<StreamChunk>;
}

/// Stateful encoder: unified chunks -> client-dialect SSE frames.
pub trait StreamEncoder: Send {
    fn encode(&mut self, chunk: &StreamChunk) -> Vec<String>;
    fn finish(&mut self) -> Vec<String>;
}

/// A wire dialect's full conversion contract.
pub trait Transformer: Send + Sync {
    fn name(&self) -> &'static str;
    fn api_type(&self) -> ApiType;
    /// Path appended to a provider base URL for this dialect.
    fn default_endpoint(&self) -> &'static str;

    fn parse_request(&self, body: &Value, request_id: &str) -> Result<UnifiedRequest, TransformError>;
    fn transform_request(&self, request: &UnifiedRequest, model: &str) -> (Value, Vec<TransformWarning>);
    fn format_response(&self, response: &UnifiedResponse) -> Value;
    /// Logical inverse of `format_response`: parse a provider-dialect unary
    /// body into unified form.
    fn parse_response(&self, body: &Value, model: &str) -> UnifiedResponse;

    fn stream_decoder(&self) -> Box<dyn StreamDecoder>;
    fn stream_encoder(&self, model: &str) -> Box<dyn StreamEncoder>;

    /// Pull a usage object out of one SSE event's data payload, if present.
    fn extract_usage(&self, data: &str) -> Option<UsageDelta>;
}

static CHAT: chat::ChatTransformer = chat::ChatTransformer;
static MESSAGES: messages::MessagesTransformer = messages::MessagesTransformer;
static GEMINI: gemini::GeminiTransformer = gemini::GeminiTransformer;
static RESPONSES: responses::ResponsesTransformer = responses::ResponsesTransformer;

/// Look up the transformer for a dialect.
pub fn get(api: ApiType) -> &'static dyn Transformer {
    match api {
        ApiType::Chat => &CHAT,
        ApiType::Messages => &MESSAGES,
        ApiType::Gemini => &GEMINI,
        ApiType::Responses => &RESPONSES,
    }
}

/// Rough token estimate (~3.5 chars per token). Used for usage fallback and
/// reasoning imputation; flagged as estimated wherever it lands in a record.
pub fn estimate_tokens(text: &str) -> i64 {
    let char_count = text.chars().count();
    (char_count as f64 / 3.5).round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn messages_request_transforms_to_chat_body() {
        let body = json!({
            "model": "my-alias",
            "max_tokens": 1024,
            "messages": [{ "role": "user", "content": "Hello" }]
        });
        let request = get(ApiType::Messages).parse_request(&body, "r1").unwrap();
        let (out, warnings) = get(ApiType::Chat).transform_request(&request, "target-model");
        assert_eq!(out["model"], "target-model");
        assert_eq!(out["messages"].as_array().unwrap().len(), 1);
        assert_eq!(out["messages"][0]["role"], "user");
        assert_eq!(out["messages"][0]["content"], "Hello");
        assert_eq!(out["max_tokens"], 1024);
        assert!(warnings.is_empty());
    }

    #[test]
    fn formatted_responses_never_leak_the_routing_envelope() {
        let response = UnifiedResponse {
            id: "resp-1".to_string(),
            model: "m".to_string(),
            parts: vec![ContentPart::Text { text: "hello".to_string() }],
            finish_reason: Some(FinishReason::Stop),
            usage: TokenCounts { input: 1, output: 2, ..Default::default() },
            plexus: PlexusEnvelope {
                provider: "secret-provider".to_string(),
                model: "secret-model".to_string(),
                attempt_count: 3,
                ..Default::default()
            },
            ..Default::default()
        };
        for api in [ApiType::Chat, ApiType::Messages, ApiType::Gemini, ApiType::Responses] {
            let body = get(api).format_response(&response).to_string();
            assert!(!body.contains("plexus"), "{} leaked the envelope", api);
            assert!(!body.contains("secret-provider"), "{} leaked the provider", api);
        }
    }

    #[test]
    fn api_type_round_trip() {
        for api in [ApiType::Chat, ApiType::Messages, ApiType::Gemini, ApiType::Responses] {
            assert_eq!(ApiType::from_str(api.as_str()), Some(api));
        }
        assert_eq!(ApiType::from_str("anthropic"), Some(ApiType::Messages));
        assert_eq!(ApiType::from_str("unknown"), None);
    }

    #[test]
    fn registry_returns_matching_dialect() {
        for api in [ApiType::Chat, ApiType::Messages, ApiType::Gemini, ApiType::Responses] {
            assert_eq!(get(api).api_type(), api);
        }
    }

    #[test]
    fn estimate_tokens_rough_scale() {
        assert_eq!(estimate_tokens(""), 0);
        let est = estimate_tokens("hello world");
        assert!((2..=4).contains(&est), "estimate was {est}");
    }
}
