//! Anthropic messages dialect.

use serde_json::{json, Map, Value};

use super::{
    ApiType, ContentPart, FinishReason, MediaSource, Role, StreamChunk, StreamDecoder,
    StreamEncoder, ToolChoice, ToolDefinition, TransformError, TransformWarning, Transformer,
    UnifiedMessage, UnifiedRequest, UnifiedResponse, UsageDelta,
};

const DEFAULT_MAX_TOKENS: u64 = 4096;

pub struct MessagesTransformer;

fn parse_media_source(source: &Value) -> Option<MediaSource> {
    match source.get("type").and_then(|v| v.as_str())? {
        "base64" => Some(MediaSource::Base64 {
            media_type: source
                .get("media_type")
                .and_then(|v| v.as_str())
                .unwrap_or("application/octet-stream")
                .to_string(),
            data: source.get("data").and_then(|v| v.as_str())?.to_string(),
        }),
        "url" => Some(MediaSource::Url {
            url: source.get("url").and_then(|v| v.as_str())?.to_string(),
        }),
        "file" => Some(MediaSource::FileId {
            file_id: source.get("file_id").and_then(|v| v.as_str())?.to_string(),
        }),
        _ => None,
    }
}

fn media_source_value(source: &MediaSource) -> Value {
    match source {
        MediaSource::Base64 { media_type, data } => {
            json!({ "type": "base64", "media_type": media_type, "data": data })
        }
        MediaSource::Url { url } => json!({ "type": "url", "url": url }),
        MediaSource::FileId { file_id } => json!({ "type": "file", "file_id": file_id }),
    }
}

fn tool_result_text(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(|v| v.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn parse_blocks(content: &Value, warnings: &mut Vec<TransformWarning>) -> Vec<ContentPart> {
    let mut parts = Vec::new();
    match content {
        Value::String(text) => {
            if !text.is_empty() {
                parts.push(ContentPart::Text { text: text.clone() });
            }
        }
        Value::Array(blocks) => {
            for block in blocks {
                match block.get("type").and_then(|v| v.as_str()).unwrap_or("") {
                    "text" => {
                        if let Some(text) = block.get("text").and_then(|v| v.as_str()) {
                            parts.push(ContentPart::Text { text: text.to_string() });
                        }
                    }
                    "thinking" => {
                        if let Some(text) = block.get("thinking").and_then(|v| v.as_str()) {
                            parts.push(ContentPart::Reasoning { text: text.to_string() });
                        }
                    }
                    "redacted_thinking" => {
                        warnings.push(TransformWarning::new(
                            "dropped_content",
                            "redacted thinking block cannot be forwarded",
                        ));
                    }
                    "image" => {
                        if let Some(source) = block.get("source").and_then(parse_media_source) {
                            parts.push(ContentPart::Image { source });
                        }
                    }
                    "document" => {
                        if let Some(source) = block.get("source").and_then(parse_media_source) {
                            let media_type = block
                                .get("source")
                                .and_then(|s| s.get("media_type"))
                                .and_then(|v| v.as_str())
                                .map(|s| s.to_string());
                            parts.push(ContentPart::Document { source, media_type });
                        }
                    }
                    "tool_use" => {
                        parts.push(ContentPart::ToolUse {
                            id: block.get("id").and_then(|v| v.as_str()).unwrap_or("toolu_0").to_string(),
                            name: block.get("name").and_then(|v| v.as_str()).unwrap_or("tool").to_string(),
                            arguments: block.get("input").cloned().unwrap_or_else(|| json!({})),
                        });
                    }
                    "tool_result" => {
                        parts.push(ContentPart::ToolResult {
                            tool_use_id: block
                                .get("tool_use_id")
                                .and_then(|v| v.as_str())
                                .unwrap_or("toolu_0")
                                .to_string(),
                            content: tool_result_text(block.get("content").unwrap_or(&Value::Null)),
                        });
                    }
                    other => {
                        warnings.push(TransformWarning::new(
                            "unknown_content",
                            format!("unrecognized content block type '{}' dropped", other),
                        ));
                    }
                }
            }
        }
        _ => {}
    }
    parts
}

fn block_value(part: &ContentPart) -> Option<Value> {
    match part {
        ContentPart::Text { text } => Some(json!({ "type": "text", "text": text })),
        ContentPart::Reasoning { text } => {
            Some(json!({ "type": "thinking", "thinking": text, "signature": "" }))
        }
        ContentPart::Image { source } => {
            Some(json!({ "type": "image", "source": media_source_value(source) }))
        }
        ContentPart::Document { source, .. } => {
            Some(json!({ "type": "document", "source": media_source_value(source) }))
        }
        ContentPart::ToolUse { id, name, arguments } => {
            Some(json!({ "type": "tool_use", "id": id, "name": name, "input": arguments }))
        }
        ContentPart::ToolResult { tool_use_id, content } => Some(json!({
            "type": "tool_result", "tool_use_id": tool_use_id, "content": content
        })),
    }
}

fn usage_from_value(usage: &Value) -> UsageDelta {
    UsageDelta {
        input: usage.get("input_tokens").and_then(|v| v.as_i64()),
        output: usage.get("output_tokens").and_then(|v| v.as_i64()),
        reasoning: usage
            .get("reasoning_tokens")
            .or_else(|| usage.get("thinking_tokens"))
            .and_then(|v| v.as_i64()),
        cached: usage.get("cache_read_input_tokens").and_then(|v| v.as_i64()),
        cache_write: usage.get("cache_creation_input_tokens").and_then(|v| v.as_i64()),
    }
}

impl Transformer for MessagesTransformer {
    fn name(&self) -> &'static str {
        "messages"
    }

    fn api_type(&self) -> ApiType {
        ApiType::Messages
    }

    fn default_endpoint(&self) -> &'static str {
        "/v1/messages"
    }

    fn parse_request(&self, body: &Value, request_id: &str) -> Result<UnifiedRequest, TransformError> {
        let model = body
            .get("model")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| TransformError::InvalidRequest("missing 'model' field".to_string()))?
            .to_string();
        let raw_messages = body
            .get("messages")
            .and_then(|v| v.as_array())
            .ok_or_else(|| TransformError::InvalidRequest("missing 'messages' array".to_string()))?;

        let mut warnings = Vec::new();

        let system = match body.get("system") {
            Some(Value::String(text)) => Some(text.clone()),
            Some(Value::Array(blocks)) => {
                let joined: Vec<&str> = blocks
                    .iter()
                    .filter_map(|b| b.get("text").and_then(|v| v.as_str()))
                    .collect();
                if joined.is_empty() { None } else { Some(joined.join("\n\n")) }
            }
            _ => None,
        };

        let mut messages = Vec::new();
        for msg in raw_messages {
            let role = match msg.get("role").and_then(|v| v.as_str()).unwrap_or("user") {
                "assistant" => Role::Assistant,
                _ => Role::User,
            };
            let parts = parse_blocks(msg.get("content").unwrap_or(&Value::Null), &mut warnings);
            messages.push(UnifiedMessage { role, parts });
        }

        let tools = body
            .get("tools")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|t| {
                        Some(ToolDefinition {
                            name: t.get("name")?.as_str()?.to_string(),
                            description: t
                                .get("description")
                                .and_then(|v| v.as_str())
                                .map(|s| s.to_string()),
                            parameters: t.get("input_schema").cloned().unwrap_or_else(|| json!({})),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        let tool_choice = body.get("tool_choice").and_then(|tc| {
            match tc.get("type").and_then(|v| v.as_str())? {
                // "any" normalizes to auto in the unified form.
                "auto" | "any" => Some(ToolChoice::Auto),
                "none" => Some(ToolChoice::None),
                "tool" => tc
                    .get("name")
                    .and_then(|v| v.as_str())
                    .map(|name| ToolChoice::Tool(name.to_string())),
                _ => None,
            }
        });

        if body.get("thinking").is_some() {
            warnings.push(TransformWarning::new(
                "dropped_field",
                "extended thinking configuration is not forwarded",
            ));
        }

        let stop_sequences = body
            .get("stop_sequences")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default();

        Ok(UnifiedRequest {
            model,
            messages,
            system,
            tools,
            tool_choice,
            max_tokens: body.get("max_tokens").and_then(|v| v.as_u64()),
            temperature: body.get("temperature").and_then(|v| v.as_f64()),
            top_p: body.get("top_p").and_then(|v| v.as_f64()),
            stop_sequences,
            response_format: None,
            stream: body.get("stream").and_then(|v| v.as_bool()).unwrap_or(false),
            metadata: body.get("metadata").cloned(),
            incoming_api_type: ApiType::Messages,
            original_body: body.clone(),
            request_id: request_id.to_string(),
            warnings,
        })
    }

    fn transform_request(&self, request: &UnifiedRequest, model: &str) -> (Value, Vec<TransformWarning>) {
        let mut warnings = Vec::new();
        let mut out = Map::new();
        out.insert("model".to_string(), Value::String(model.to_string()));
        out.insert(
            "max_tokens".to_string(),
            json!(request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)),
        );
        if let Some(system) = &request.system {
            out.insert("system".to_string(), json!(system));
        }

        let mut messages = Vec::new();
        for msg in &request.messages {
            // Tool results ride in a user turn; everything else keeps its role.
            let role = match msg.role {
                Role::Assistant => "assistant",
                _ => "user",
            };
            let blocks: Vec<Value> = msg.parts.iter().filter_map(block_value).collect();
            if blocks.is_empty() {
                continue;
            }
            messages.push(json!({ "role": role, "content": blocks }));
        }
        out.insert("messages".to_string(), Value::Array(messages));

        if !request.tools.is_empty() {
            let tools: Vec<Value> = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.parameters,
                    })
                })
                .collect();
            out.insert("tools".to_string(), Value::Array(tools));
        }
        if let Some(choice) = &request.tool_choice {
            let value = match choice {
                ToolChoice::Auto => json!({ "type": "auto" }),
                ToolChoice::None => json!({ "type": "none" }),
                ToolChoice::Required => json!({ "type": "any" }),
                ToolChoice::Tool(name) => json!({ "type": "tool", "name": name }),
            };
            out.insert("tool_choice".to_string(), value);
        }
        if let Some(temperature) = request.temperature {
            out.insert("temperature".to_string(), json!(temperature));
        }
        if let Some(top_p) = request.top_p {
            out.insert("top_p".to_string(), json!(top_p));
        }
        if !request.stop_sequences.is_empty() {
            out.insert("stop_sequences".to_string(), json!(request.stop_sequences));
        }
        if request.stream {
            out.insert("stream".to_string(), Value::Bool(true));
        }
        if let Some(metadata) = &request.metadata {
            out.insert("metadata".to_string(), metadata.clone());
        }
        if request.response_format.is_some() {
            warnings.push(TransformWarning::new(
                "dropped_field",
                "response_format has no messages-dialect equivalent",
            ));
        }

        (Value::Object(out), warnings)
    }

    fn format_response(&self, response: &UnifiedResponse) -> Value {
        let mut content = Vec::new();
        for part in &response.parts {
            match part {
                ContentPart::Reasoning { text } => {
                    content.push(json!({ "type": "thinking", "thinking": text, "signature": "" }))
                }
                ContentPart::Text { text } => content.push(json!({ "type": "text", "text": text })),
                ContentPart::ToolUse { id, name, arguments } => content.push(json!({
                    "type": "tool_use", "id": id, "name": name, "input": arguments
                })),
                _ => {}
            }
        }
        let stop_reason = response
            .finish_reason
            .as_ref()
            .map(|r| r.as_anthropic().to_string())
            .unwrap_or_else(|| "end_turn".to_string());
        let id = if response.id.is_empty() {
            format!("msg_{}", uuid::Uuid::new_v4().simple())
        } else if response.id.starts_with("msg_") {
            response.id.clone()
        } else {
            format!("msg_{}", response.id)
        };
        json!({
            "id": id,
            "type": "message",
            "role": "assistant",
            "model": response.model,
            "content": content,
            "stop_reason": stop_reason,
            "stop_sequence": null,
            "usage": {
                "input_tokens": response.usage.input,
                "output_tokens": response.usage.output + response.usage.reasoning,
                "cache_read_input_tokens": response.usage.cached,
                "cache_creation_input_tokens": response.usage.cache_write,
            },
        })
    }

    fn parse_response(&self, body: &Value, model: &str) -> UnifiedResponse {
        let mut warnings = Vec::new();
        let parts = parse_blocks(body.get("content").unwrap_or(&Value::Null), &mut warnings);
        let usage = body.get("usage").map(usage_from_value).unwrap_or_default();
        UnifiedResponse {
            id: body.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            model: body.get("model").and_then(|v| v.as_str()).unwrap_or(model).to_string(),
            parts,
            finish_reason: body
                .get("stop_reason")
                .and_then(|v| v.as_str())
                .map(FinishReason::from_anthropic),
            usage: crate::pricing::TokenCounts {
                input: usage.input.unwrap_or(0),
                output: usage.output.unwrap_or(0),
                reasoning: usage.reasoning.unwrap_or(0),
                cached: usage.cached.unwrap_or(0),
                cache_write: usage.cache_write.unwrap_or(0),
            },
            raw_response: Some(body.clone()),
            warnings,
            ..Default::default()
        }
    }

    fn stream_decoder(&self) -> Box<dyn StreamDecoder> {
        Box::new(MessagesDecoder::default())
    }

    fn stream_encoder(&self, model: &str) -> Box<dyn StreamEncoder> {
        Box::new(MessagesEncoder::new(model))
    }

    fn extract_usage(&self, data: &str) -> Option<UsageDelta> {
        let json: Value = serde_json::from_str(data.trim()).ok()?;
        match json.get("type").and_then(|v| v.as_str())? {
            "message_start" => {
                let usage = json.get("message")?.get("usage")?;
                let delta = usage_from_value(usage);
                if delta.is_empty() { None } else { Some(delta) }
            }
            "message_delta" => {
                let usage = json.get("usage")?;
                let delta = usage_from_value(usage);
                if delta.is_empty() { None } else { Some(delta) }
            }
            _ => None,
        }
    }
}

#[derive(Default)]
struct MessagesDecoder;

impl StreamDecoder for MessagesDecoder {
    fn decode_event(&mut self, data: &str) -> Vec<StreamChunk> {
        let Ok(json) = serde_json::from_str::<Value>(data.trim()) else {
            return Vec::new();
        };
        let mut chunks = Vec::new();
        match json.get("type").and_then(|v| v.as_str()).unwrap_or("") {
            "message_start" => {
                let message = json.get("message").cloned().unwrap_or(Value::Null);
                chunks.push(StreamChunk::Start {
                    id: message.get("id").and_then(|v| v.as_str()).unwrap_or("").to_string(),
                    model: message.get("model").and_then(|v| v.as_str()).unwrap_or("").to_string(),
                });
                if let Some(usage) = message.get("usage") {
                    let delta = usage_from_value(usage);
                    if !delta.is_empty() {
                        chunks.push(StreamChunk::Usage(delta));
                    }
                }
            }
            "content_block_start" => {
                let index = json.get("index").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
                if let Some(block) = json.get("content_block") {
                    if block.get("type").and_then(|v| v.as_str()) == Some("tool_use") {
                        chunks.push(StreamChunk::ToolCallStart {
                            index,
                            id: block.get("id").and_then(|v| v.as_str()).unwrap_or("toolu_0").to_string(),
                            name: block.get("name").and_then(|v| v.as_str()).unwrap_or("tool").to_string(),
                        });
                    }
                }
            }
            "content_block_delta" => {
                let index = json.get("index").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
                if let Some(delta) = json.get("delta") {
                    match delta.get("type").and_then(|v| v.as_str()).unwrap_or("") {
                        "text_delta" => {
                            if let Some(text) = delta.get("text").and_then(|v| v.as_str()) {
                                chunks.push(StreamChunk::TextDelta { index, text: text.to_string() });
                            }
                        }
                        "thinking_delta" => {
                            if let Some(text) = delta.get("thinking").and_then(|v| v.as_str()) {
                                chunks.push(StreamChunk::ReasoningDelta { index, text: text.to_string() });
                            }
                        }
                        "input_json_delta" => {
                            if let Some(partial) = delta.get("partial_json").and_then(|v| v.as_str()) {
                                chunks.push(StreamChunk::ToolCallDelta {
                                    index,
                                    arguments: partial.to_string(),
                                });
                            }
                        }
                        _ => {}
                    }
                }
            }
            "message_delta" => {
                if let Some(usage) = json.get("usage") {
                    let delta = usage_from_value(usage);
                    if !delta.is_empty() {
                        chunks.push(StreamChunk::Usage(delta));
                    }
                }
                if let Some(reason) = json
                    .get("delta")
                    .and_then(|d| d.get("stop_reason"))
                    .and_then(|v| v.as_str())
                {
                    chunks.push(StreamChunk::Finish { reason: FinishReason::from_anthropic(reason) });
                }
            }
            "message_stop" => chunks.push(StreamChunk::Done),
            _ => {}
        }
        chunks
    }

    fn finish(&mut self) -> Vec<StreamChunk> {
        Vec::new()
    }
}

/// Tracks which content blocks are open on the encoder side, mirroring the
/// index discipline of the messages stream protocol.
#[derive(Default)]
struct BlockState {
    next_index: usize,
    thinking_index: Option<usize>,
    text_index: Option<usize>,
    tool_indices: std::collections::HashMap<usize, usize>,
}

impl BlockState {
    fn ensure_thinking(&mut self) -> (usize, bool) {
        match self.thinking_index {
            Some(i) => (i, false),
            None => {
                let i = self.next_index;
                self.next_index += 1;
                self.thinking_index = Some(i);
                (i, true)
            }
        }
    }

    fn ensure_text(&mut self) -> (usize, bool) {
        match self.text_index {
            Some(i) => (i, false),
            None => {
                let i = self.next_index;
                self.next_index += 1;
                self.text_index = Some(i);
                (i, true)
            }
        }
    }

    fn close_thinking(&mut self) -> Option<usize> {
        self.thinking_index.take()
    }

    fn open_tool(&mut self, source_index: usize) -> usize {
        let i = self.next_index;
        self.next_index += 1;
        self.tool_indices.insert(source_index, i);
        i
    }

    fn tool(&self, source_index: usize) -> Option<usize> {
        self.tool_indices.get(&source_index).copied()
    }

    fn open_indices(&mut self) -> Vec<usize> {
        let mut open: Vec<usize> = self
            .thinking_index
            .take()
            .into_iter()
            .chain(self.text_index.take())
            .chain(self.tool_indices.drain().map(|(_, i)| i))
            .collect();
        open.sort_unstable();
        open
    }
}

struct MessagesEncoder {
    model: String,
    message_id: String,
    started: bool,
    stopped: bool,
    blocks: BlockState,
    output_tokens: i64,
    finish_reason: Option<FinishReason>,
}

fn event_frame(event: &str, data: Value) -> String {
    format!("event: {}\ndata: {}\n\n", event, data)
}

impl MessagesEncoder {
    fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            message_id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
            started: false,
            stopped: false,
            blocks: BlockState::default(),
            output_tokens: 0,
            finish_reason: None,
        }
    }

    fn ensure_started(&mut self, frames: &mut Vec<String>, input_tokens: i64) {
        if self.started {
            return;
        }
        self.started = true;
        let start = json!({
            "type": "message_start",
            "message": {
                "id": self.message_id,
                "type": "message",
                "role": "assistant",
                "content": [],
                "model": self.model,
                "stop_reason": null,
                "stop_sequence": null,
                "usage": { "input_tokens": input_tokens, "output_tokens": 0 },
            },
        });
        frames.push(event_frame("message_start", start));
    }

    fn push_block_start(frames: &mut Vec<String>, index: usize, block: Value) {
        frames.push(event_frame(
            "content_block_start",
            json!({ "type": "content_block_start", "index": index, "content_block": block }),
        ));
    }

    fn push_block_stop(frames: &mut Vec<String>, index: usize) {
        frames.push(event_frame(
            "content_block_stop",
            json!({ "type": "content_block_stop", "index": index }),
        ));
    }

    fn push_delta(frames: &mut Vec<String>, index: usize, delta: Value) {
        frames.push(event_frame(
            "content_block_delta",
            json!({ "type": "content_block_delta", "index": index, "delta": delta }),
        ));
    }

    fn emit_stop(&mut self, frames: &mut Vec<String>) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        for index in self.blocks.open_indices() {
            Self::push_block_stop(frames, index);
        }
        let stop_reason = self
            .finish_reason
            .as_ref()
            .map(|r| r.as_anthropic().to_string())
            .unwrap_or_else(|| "end_turn".to_string());
        frames.push(event_frame(
            "message_delta",
            json!({
                "type": "message_delta",
                "delta": { "stop_reason": stop_reason, "stop_sequence": null },
                "usage": { "output_tokens": self.output_tokens },
            }),
        ));
        frames.push(event_frame("message_stop", json!({ "type": "message_stop" })));
    }
}

impl StreamEncoder for MessagesEncoder {
    fn encode(&mut self, chunk: &StreamChunk) -> Vec<String> {
        let mut frames = Vec::new();
        match chunk {
            StreamChunk::Start { id, model } => {
                if !id.is_empty() {
                    self.message_id = if id.starts_with("msg_") {
                        id.clone()
                    } else {
                        format!("msg_{}", id)
                    };
                }
                if !model.is_empty() {
                    self.model = model.clone();
                }
            }
            StreamChunk::ReasoningDelta { text, .. } => {
                self.ensure_started(&mut frames, 0);
                let (index, opened) = self.blocks.ensure_thinking();
                if opened {
                    Self::push_block_start(
                        &mut frames,
                        index,
                        json!({ "type": "thinking", "thinking": "" }),
                    );
                }
                Self::push_delta(&mut frames, index, json!({ "type": "thinking_delta", "thinking": text }));
            }
            StreamChunk::TextDelta { text, .. } => {
                self.ensure_started(&mut frames, 0);
                if let Some(index) = self.blocks.close_thinking() {
                    Self::push_block_stop(&mut frames, index);
                }
                let (index, opened) = self.blocks.ensure_text();
                if opened {
                    Self::push_block_start(&mut frames, index, json!({ "type": "text", "text": "" }));
                }
                Self::push_delta(&mut frames, index, json!({ "type": "text_delta", "text": text }));
            }
            StreamChunk::ToolCallStart { index, id, name } => {
                self.ensure_started(&mut frames, 0);
                let block_index = self.blocks.open_tool(*index);
                Self::push_block_start(
                    &mut frames,
                    block_index,
                    json!({ "type": "tool_use", "id": id, "name": name, "input": {} }),
                );
            }
            StreamChunk::ToolCallDelta { index, arguments } => {
                self.ensure_started(&mut frames, 0);
                if let Some(block_index) = self.blocks.tool(*index) {
                    Self::push_delta(
                        &mut frames,
                        block_index,
                        json!({ "type": "input_json_delta", "partial_json": arguments }),
                    );
                }
            }
            StreamChunk::Usage(delta) => {
                if let Some(input) = delta.input {
                    self.ensure_started(&mut frames, input);
                }
                if let Some(output) = delta.output {
                    self.output_tokens = self.output_tokens.max(output);
                }
            }
            StreamChunk::Finish { reason } => {
                self.ensure_started(&mut frames, 0);
                self.finish_reason = Some(reason.clone());
            }
            StreamChunk::Done => {
                self.ensure_started(&mut frames, 0);
                self.emit_stop(&mut frames);
            }
        }
        frames
    }

    fn finish(&mut self) -> Vec<String> {
        let mut frames = Vec::new();
        if self.started {
            self.emit_stop(&mut frames);
        }
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_hello_request() {
        let body = json!({
            "model": "claude-x",
            "max_tokens": 1024,
            "messages": [{ "role": "user", "content": "Hello" }]
        });
        let req = MessagesTransformer.parse_request(&body, "r1").unwrap();
        assert_eq!(req.max_tokens, Some(1024));
        assert_eq!(req.messages[0].plain_text(), "Hello");
        assert_eq!(req.incoming_api_type, ApiType::Messages);
    }

    #[test]
    fn thinking_config_is_dropped_with_warning() {
        let body = json!({
            "model": "claude-x",
            "max_tokens": 16,
            "thinking": { "type": "enabled", "budget_tokens": 2048 },
            "messages": [{ "role": "user", "content": "hi" }]
        });
        let req = MessagesTransformer.parse_request(&body, "r1").unwrap();
        assert!(req.warnings.iter().any(|w| w.kind == "dropped_field"));
    }

    #[test]
    fn tool_use_and_result_blocks() {
        let body = json!({
            "model": "claude-x",
            "max_tokens": 16,
            "messages": [
                { "role": "assistant", "content": [
                    { "type": "tool_use", "id": "toolu_1", "name": "lookup", "input": { "q": "rust" } }
                ]},
                { "role": "user", "content": [
                    { "type": "tool_result", "tool_use_id": "toolu_1", "content": "found it" }
                ]}
            ]
        });
        let req = MessagesTransformer.parse_request(&body, "r1").unwrap();
        assert!(matches!(req.messages[0].parts[0], ContentPart::ToolUse { .. }));
        assert!(matches!(req.messages[1].parts[0], ContentPart::ToolResult { .. }));

        let (out, _) = MessagesTransformer.transform_request(&req, "claude-y");
        assert_eq!(out["messages"][0]["content"][0]["type"], "tool_use");
        assert_eq!(out["messages"][1]["content"][0]["type"], "tool_result");
    }

    #[test]
    fn any_tool_choice_normalizes_to_auto() {
        let body = json!({
            "model": "claude-x",
            "max_tokens": 16,
            "tool_choice": { "type": "any" },
            "tools": [{ "name": "f", "input_schema": {} }],
            "messages": [{ "role": "user", "content": "hi" }]
        });
        let req = MessagesTransformer.parse_request(&body, "r1").unwrap();
        assert_eq!(req.tool_choice, Some(ToolChoice::Auto));

        // A required choice still renders as the dialect's "any".
        let mut required = req.clone();
        required.tool_choice = Some(ToolChoice::Required);
        let (out, _) = MessagesTransformer.transform_request(&required, "claude-x");
        assert_eq!(out["tool_choice"]["type"], "any");
    }

    #[test]
    fn extract_usage_message_start_and_delta() {
        let start = r#"{"type":"message_start","message":{"usage":{"input_tokens":42,"cache_read_input_tokens":7}}}"#;
        let usage = MessagesTransformer.extract_usage(start).unwrap();
        assert_eq!(usage.input, Some(42));
        assert_eq!(usage.cached, Some(7));

        let delta = r#"{"type":"message_delta","usage":{"output_tokens":100}}"#;
        let usage = MessagesTransformer.extract_usage(delta).unwrap();
        assert_eq!(usage.output, Some(100));
        assert_eq!(usage.input, None);
    }

    #[test]
    fn decoder_walks_block_protocol() {
        let mut decoder = MessagesDecoder::default();
        let start = decoder.decode_event(
            r#"{"type":"message_start","message":{"id":"msg_1","model":"claude-x","usage":{"input_tokens":5}}}"#,
        );
        assert!(matches!(start[0], StreamChunk::Start { .. }));
        assert!(matches!(start[1], StreamChunk::Usage(_)));

        let text = decoder.decode_event(
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"hey"}}"#,
        );
        assert!(matches!(&text[0], StreamChunk::TextDelta { text, .. } if text == "hey"));

        let fin = decoder.decode_event(
            r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":9}}"#,
        );
        assert!(matches!(fin[0], StreamChunk::Usage(_)));
        assert!(matches!(fin[1], StreamChunk::Finish { reason: FinishReason::Stop }));
        assert_eq!(
            decoder.decode_event(r#"{"type":"message_stop"}"#),
            vec![StreamChunk::Done]
        );
    }

    #[test]
    fn encoder_opens_and_closes_blocks_in_order() {
        let mut encoder = MessagesEncoder::new("claude-x");
        let mut frames = Vec::new();
        frames.extend(encoder.encode(&StreamChunk::ReasoningDelta { index: 0, text: "mm".to_string() }));
        frames.extend(encoder.encode(&StreamChunk::TextDelta { index: 0, text: "hello".to_string() }));
        frames.extend(encoder.encode(&StreamChunk::Finish { reason: FinishReason::Stop }));
        frames.extend(encoder.encode(&StreamChunk::Done));
        let all = frames.join("");

        let start_pos = all.find("message_start").unwrap();
        let think_pos = all.find("thinking_delta").unwrap();
        let text_pos = all.find("text_delta").unwrap();
        let stop_pos = all.find("message_stop").unwrap();
        assert!(start_pos < think_pos && think_pos < text_pos && text_pos < stop_pos);
        assert!(all.contains("\"stop_reason\":\"end_turn\""));
    }
}
