//! OpenAI chat-completions dialect.

use serde_json::{json, Map, Value};

use super::{
    ApiType, ContentPart, FinishReason, MediaSource, ResponseFormat, Role, StreamChunk,
    StreamDecoder, StreamEncoder, ToolChoice, ToolDefinition, TransformError, TransformWarning,
    Transformer, UnifiedMessage, UnifiedRequest, UnifiedResponse, UsageDelta,
};

pub struct ChatTransformer;

fn parse_image_url(url: &str) -> MediaSource {
    // data:image/png;base64,.... -> inline bytes, anything else stays a URL.
    if let Some(rest) = url.strip_prefix("data:") {
        if let Some((meta, data)) = rest.split_once(",") {
            let media_type = meta.trim_end_matches(";base64").to_string();
            return MediaSource::Base64 {
                media_type,
                data: data.to_string(),
            };
        }
    }
    MediaSource::Url { url: url.to_string() }
}

fn image_url_value(source: &MediaSource) -> Value {
    match source {
        MediaSource::Base64 { media_type, data } => {
            json!({ "url": format!("data:{};base64,{}", media_type, data) })
        }
        MediaSource::Url { url } => json!({ "url": url }),
        MediaSource::FileId { file_id } => json!({ "url": file_id }),
    }
}

fn parse_content_parts(content: &Value, warnings: &mut Vec<TransformWarning>) -> Vec<ContentPart> {
    let mut parts = Vec::new();
    match content {
        Value::String(text) => {
            if !text.is_empty() {
                parts.push(ContentPart::Text { text: text.clone() });
            }
        }
        Value::Array(items) => {
            for item in items {
                match item.get("type").and_then(|v| v.as_str()).unwrap_or("") {
                    "text" => {
                        if let Some(text) = item.get("text").and_then(|v| v.as_str()) {
                            parts.push(ContentPart::Text { text: text.to_string() });
                        }
                    }
                    "image_url" => {
                        if let Some(url) = item
                            .get("image_url")
                            .and_then(|v| v.get("url"))
                            .and_then(|v| v.as_str())
                        {
                            parts.push(ContentPart::Image { source: parse_image_url(url) });
                        }
                    }
                    "file" => {
                        let file = item.get("file").cloned().unwrap_or(Value::Null);
                        if let Some(file_id) = file.get("file_id").and_then(|v| v.as_str()) {
                            parts.push(ContentPart::Document {
                                source: MediaSource::FileId { file_id: file_id.to_string() },
                                media_type: None,
                            });
                        } else if let Some(data) = file.get("file_data").and_then(|v| v.as_str()) {
                            parts.push(ContentPart::Document {
                                source: MediaSource::Base64 {
                                    media_type: "application/pdf".to_string(),
                                    data: data.to_string(),
                                },
                                media_type: Some("application/pdf".to_string()),
                            });
                        }
                    }
                    "input_audio" => {
                        warnings.push(TransformWarning::new(
                            "unsupported_content",
                            "audio content parts are not forwarded",
                        ));
                    }
                    other => {
                        warnings.push(TransformWarning::new(
                            "unknown_content",
                            format!("unrecognized content part type '{}' dropped", other),
                        ));
                    }
                }
            }
        }
        _ => {}
    }
    parts
}

fn parse_tool_choice(value: &Value) -> Option<ToolChoice> {
    match value {
        Value::String(s) => match s.as_str() {
            "auto" => Some(ToolChoice::Auto),
            "none" => Some(ToolChoice::None),
            "required" | "any" => Some(ToolChoice::Required),
            _ => None,
        },
        Value::Object(_) => value
            .get("function")
            .and_then(|f| f.get("name"))
            .and_then(|n| n.as_str())
            .map(|name| ToolChoice::Tool(name.to_string())),
        _ => None,
    }
}

fn tool_choice_value(choice: &ToolChoice) -> Value {
    match choice {
        ToolChoice::Auto => json!("auto"),
        ToolChoice::None => json!("none"),
        ToolChoice::Required => json!("required"),
        ToolChoice::Tool(name) => json!({ "type": "function", "function": { "name": name } }),
    }
}

/// Build the chat `content` value for a message's non-tool parts: a plain
/// string when it is text-only, an array otherwise.
fn content_value(parts: &[ContentPart]) -> Value {
    let renderable: Vec<&ContentPart> = parts
        .iter()
        .filter(|p| {
            matches!(
                p,
                ContentPart::Text { .. } | ContentPart::Image { .. } | ContentPart::Document { .. }
            )
        })
        .collect();
    let all_text = renderable.iter().all(|p| matches!(p, ContentPart::Text { .. }));
    if all_text {
        let text: String = renderable
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        return Value::String(text);
    }
    let mut items = Vec::new();
    for part in renderable {
        match part {
            ContentPart::Text { text } => items.push(json!({ "type": "text", "text": text })),
            ContentPart::Image { source } => {
                items.push(json!({ "type": "image_url", "image_url": image_url_value(source) }))
            }
            ContentPart::Document { source, .. } => match source {
                MediaSource::FileId { file_id } => {
                    items.push(json!({ "type": "file", "file": { "file_id": file_id } }))
                }
                MediaSource::Base64 { data, .. } => {
                    items.push(json!({ "type": "file", "file": { "file_data": data } }))
                }
                MediaSource::Url { url } => {
                    items.push(json!({ "type": "file", "file": { "file_data": url } }))
                }
            },
            _ => {}
        }
    }
    Value::Array(items)
}

fn usage_from_value(usage: &Value) -> UsageDelta {
    UsageDelta {
        input: usage.get("prompt_tokens").and_then(|v| v.as_i64()),
        output: usage.get("completion_tokens").and_then(|v| v.as_i64()),
        cached: usage
            .get("prompt_tokens_details")
            .and_then(|d| d.get("cached_tokens"))
            .and_then(|v| v.as_i64()),
        reasoning: usage
            .get("completion_tokens_details")
            .and_then(|d| d.get("reasoning_tokens"))
            .and_then(|v| v.as_i64()),
        cache_write: None,
    }
}

fn usage_value(response: &UnifiedResponse) -> Value {
    json!({
        "prompt_tokens": response.usage.input,
        "completion_tokens": response.usage.output + response.usage.reasoning,
        "total_tokens": response.usage.input + response.usage.output + response.usage.reasoning,
        "prompt_tokens_details": { "cached_tokens": response.usage.cached },
        "completion_tokens_details": { "reasoning_tokens": response.usage.reasoning },
    })
}

impl Transformer for ChatTransformer {
    fn name(&self) -> &'static str {
        "chat"
    }

    fn api_type(&self) -> ApiType {
        ApiType::Chat
    }

    fn default_endpoint(&self) -> &'static str {
        "/chat/completions"
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
        let mut system_texts: Vec<String> = Vec::new();
        let mut messages = Vec::new();

        for msg in raw_messages {
            let role = msg.get("role").and_then(|v| v.as_str()).unwrap_or("user");
            match role {
                "system" | "developer" => {
                    let mut parts = parse_content_parts(
                        msg.get("content").unwrap_or(&Value::Null),
                        &mut warnings,
                    );
                    for part in parts.drain(..) {
                        if let ContentPart::Text { text } = part {
                            system_texts.push(text);
                        }
                    }
                }
                "tool" => {
                    let tool_use_id = msg
                        .get("tool_call_id")
                        .and_then(|v| v.as_str())
                        .unwrap_or("tool_call")
                        .to_string();
                    let content = match msg.get("content") {
                        Some(Value::String(text)) => text.clone(),
                        Some(Value::Array(items)) => items
                            .iter()
                            .filter_map(|p| p.get("text").and_then(|v| v.as_str()))
                            .collect::<Vec<_>>()
                            .join("\n"),
                        Some(other) => other.to_string(),
                        None => String::new(),
                    };
                    messages.push(UnifiedMessage {
                        role: Role::Tool,
                        parts: vec![ContentPart::ToolResult { tool_use_id, content }],
                    });
                }
                _ => {
                    let role = if role == "assistant" { Role::Assistant } else { Role::User };
                    let mut parts = parse_content_parts(
                        msg.get("content").unwrap_or(&Value::Null),
                        &mut warnings,
                    );
                    if let Some(reasoning) = msg.get("reasoning_content").and_then(|v| v.as_str()) {
                        parts.insert(0, ContentPart::Reasoning { text: reasoning.to_string() });
                    }
                    if let Some(tool_calls) = msg.get("tool_calls").and_then(|v| v.as_array()) {
                        for call in tool_calls {
                            let id = call.get("id").and_then(|v| v.as_str()).unwrap_or("tool_call");
                            let function = call.get("function").cloned().unwrap_or(Value::Null);
                            let name = function.get("name").and_then(|v| v.as_str()).unwrap_or("tool");
                            let arguments = function
                                .get("arguments")
                                .and_then(|v| v.as_str())
                                .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
                                .unwrap_or_else(|| json!({}));
                            parts.push(ContentPart::ToolUse {
                                id: id.to_string(),
                                name: name.to_string(),
                                arguments,
                            });
                        }
                    }
                    messages.push(UnifiedMessage { role, parts });
                }
            }
        }

        let tools = body
            .get("tools")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|t| {
                        let function = t.get("function")?;
                        Some(ToolDefinition {
                            name: function.get("name")?.as_str()?.to_string(),
                            description: function
                                .get("description")
                                .and_then(|v| v.as_str())
                                .map(|s| s.to_string()),
                            parameters: function.get("parameters").cloned().unwrap_or_else(|| json!({})),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        if body.get("functions").is_some() {
            warnings.push(TransformWarning::new(
                "deprecated_field",
                "legacy 'functions' field ignored; use 'tools'",
            ));
        }

        let response_format = body.get("response_format").and_then(|rf| {
            match rf.get("type").and_then(|v| v.as_str()) {
                Some("json_object") => Some(ResponseFormat::Json { schema: None }),
                Some("json_schema") => Some(ResponseFormat::Json {
                    schema: rf
                        .get("json_schema")
                        .and_then(|js| js.get("schema"))
                        .cloned(),
                }),
                Some("text") => Some(ResponseFormat::Text),
                _ => None,
            }
        });

        let stop_sequences = match body.get("stop") {
            Some(Value::String(s)) => vec![s.clone()],
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect(),
            _ => Vec::new(),
        };

        Ok(UnifiedRequest {
            model,
            messages,
            system: if system_texts.is_empty() { None } else { Some(system_texts.join("\n\n")) },
            tools,
            tool_choice: body.get("tool_choice").and_then(parse_tool_choice),
            max_tokens: body
                .get("max_tokens")
                .or_else(|| body.get("max_completion_tokens"))
                .and_then(|v| v.as_u64()),
            temperature: body.get("temperature").and_then(|v| v.as_f64()),
            top_p: body.get("top_p").and_then(|v| v.as_f64()),
            stop_sequences,
            response_format,
            stream: body.get("stream").and_then(|v| v.as_bool()).unwrap_or(false),
            metadata: body.get("metadata").cloned(),
            incoming_api_type: ApiType::Chat,
            original_body: body.clone(),
            request_id: request_id.to_string(),
            warnings,
        })
    }

    fn transform_request(&self, request: &UnifiedRequest, model: &str) -> (Value, Vec<TransformWarning>) {
        let mut warnings = Vec::new();
        let mut out = Map::new();
        out.insert("model".to_string(), Value::String(model.to_string()));

        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(json!({ "role": "system", "content": system }));
        }
        for msg in &request.messages {
            match msg.role {
                Role::Tool => {
                    for part in &msg.parts {
                        if let ContentPart::ToolResult { tool_use_id, content } = part {
                            messages.push(json!({
                                "role": "tool",
                                "tool_call_id": tool_use_id,
                                "content": content,
                            }));
                        }
                    }
                }
                _ => {
                    let mut entry = Map::new();
                    entry.insert("role".to_string(), Value::String(msg.role.as_str().to_string()));
                    entry.insert("content".to_string(), content_value(&msg.parts));

                    let reasoning: String = msg
                        .parts
                        .iter()
                        .filter_map(|p| match p {
                            ContentPart::Reasoning { text } => Some(text.as_str()),
                            _ => None,
                        })
                        .collect();
                    if !reasoning.is_empty() {
                        entry.insert("reasoning_content".to_string(), Value::String(reasoning));
                    }

                    let tool_calls: Vec<Value> = msg
                        .parts
                        .iter()
                        .filter_map(|p| match p {
                            ContentPart::ToolUse { id, name, arguments } => Some(json!({
                                "id": id,
                                "type": "function",
                                "function": {
                                    "name": name,
                                    "arguments": serde_json::to_string(arguments)
                                        .unwrap_or_else(|_| "{}".to_string()),
                                },
                            })),
                            _ => None,
                        })
                        .collect();
                    if !tool_calls.is_empty() {
                        entry.insert("tool_calls".to_string(), Value::Array(tool_calls));
                    }

                    // Tool results carried on a non-tool role still need their
                    // own tool message.
                    let mut trailing = Vec::new();
                    for part in &msg.parts {
                        if let ContentPart::ToolResult { tool_use_id, content } = part {
                            trailing.push(json!({
                                "role": "tool",
                                "tool_call_id": tool_use_id,
                                "content": content,
                            }));
                        }
                    }
                    messages.push(Value::Object(entry));
                    messages.extend(trailing);
                }
            }
        }
        out.insert("messages".to_string(), Value::Array(messages));

        if !request.tools.is_empty() {
            let tools: Vec<Value> = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        },
                    })
                })
                .collect();
            out.insert("tools".to_string(), Value::Array(tools));
        }
        if let Some(choice) = &request.tool_choice {
            out.insert("tool_choice".to_string(), tool_choice_value(choice));
        }
        if let Some(max_tokens) = request.max_tokens {
            out.insert("max_tokens".to_string(), json!(max_tokens));
        }
        if let Some(temperature) = request.temperature {
            out.insert("temperature".to_string(), json!(temperature));
        }
        if let Some(top_p) = request.top_p {
            out.insert("top_p".to_string(), json!(top_p));
        }
        if !request.stop_sequences.is_empty() {
            out.insert("stop".to_string(), json!(request.stop_sequences));
        }
        if let Some(format) = &request.response_format {
            let value = match format {
                ResponseFormat::Text => json!({ "type": "text" }),
                ResponseFormat::Json { schema: None } => json!({ "type": "json_object" }),
                ResponseFormat::Json { schema: Some(schema) } => json!({
                    "type": "json_schema",
                    "json_schema": { "name": "response", "schema": schema },
                }),
            };
            out.insert("response_format".to_string(), value);
        }
        if request.stream {
            out.insert("stream".to_string(), Value::Bool(true));
            out.insert("stream_options".to_string(), json!({ "include_usage": true }));
        }
        if request.metadata.is_some() {
            warnings.push(TransformWarning::new(
                "dropped_field",
                "request metadata has no chat-completions equivalent",
            ));
        }

        (Value::Object(out), warnings)
    }

    fn format_response(&self, response: &UnifiedResponse) -> Value {
        let text: String = response
            .parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        let reasoning: String = response
            .parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::Reasoning { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        let tool_calls: Vec<Value> = response
            .parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::ToolUse { id, name, arguments } => Some(json!({
                    "id": id,
                    "type": "function",
                    "function": {
                        "name": name,
                        "arguments": serde_json::to_string(arguments).unwrap_or_else(|_| "{}".to_string()),
                    },
                })),
                _ => None,
            })
            .collect();

        let mut message = Map::new();
        message.insert("role".to_string(), json!("assistant"));
        message.insert(
            "content".to_string(),
            if text.is_empty() && !tool_calls.is_empty() { Value::Null } else { json!(text) },
        );
        if !reasoning.is_empty() {
            message.insert("reasoning_content".to_string(), json!(reasoning));
        }
        if !tool_calls.is_empty() {
            message.insert("tool_calls".to_string(), Value::Array(tool_calls));
        }

        let finish_reason = response
            .finish_reason
            .as_ref()
            .map(|r| r.as_openai().to_string())
            .unwrap_or_else(|| "stop".to_string());

        json!({
            "id": if response.id.is_empty() { format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()) } else { response.id.clone() },
            "object": "chat.completion",
            "created": chrono::Utc::now().timestamp(),
            "model": response.model,
            "choices": [{
                "index": 0,
                "message": Value::Object(message),
                "finish_reason": finish_reason,
            }],
            "usage": usage_value(response),
        })
    }

    fn parse_response(&self, body: &Value, model: &str) -> UnifiedResponse {
        let mut parts = Vec::new();
        let mut finish_reason = None;
        if let Some(choice) = body
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
        {
            if let Some(message) = choice.get("message") {
                if let Some(reasoning) = message.get("reasoning_content").and_then(|v| v.as_str()) {
                    if !reasoning.is_empty() {
                        parts.push(ContentPart::Reasoning { text: reasoning.to_string() });
                    }
                }
                if let Some(text) = message.get("content").and_then(|v| v.as_str()) {
                    if !text.is_empty() {
                        parts.push(ContentPart::Text { text: text.to_string() });
                    }
                }
                if let Some(tool_calls) = message.get("tool_calls").and_then(|v| v.as_array()) {
                    for call in tool_calls {
                        let function = call.get("function").cloned().unwrap_or(Value::Null);
                        parts.push(ContentPart::ToolUse {
                            id: call.get("id").and_then(|v| v.as_str()).unwrap_or("tool_call").to_string(),
                            name: function.get("name").and_then(|v| v.as_str()).unwrap_or("tool").to_string(),
                            arguments: function
                                .get("arguments")
                                .and_then(|v| v.as_str())
                                .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
                                .unwrap_or_else(|| json!({})),
                        });
                    }
                }
            }
            finish_reason = choice
                .get("finish_reason")
                .and_then(|v| v.as_str())
                .map(FinishReason::from_openai);
        }

        let usage = body.get("usage").map(usage_from_value).unwrap_or_default();
        UnifiedResponse {
            id: body.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            model: body
                .get("model")
                .and_then(|v| v.as_str())
                .unwrap_or(model)
                .to_string(),
            parts,
            finish_reason,
            usage: crate::pricing::TokenCounts {
                input: usage.input.unwrap_or(0),
                output: usage.output.unwrap_or(0) - usage.reasoning.unwrap_or(0).min(usage.output.unwrap_or(0)),
                reasoning: usage.reasoning.unwrap_or(0),
                cached: usage.cached.unwrap_or(0),
                cache_write: 0,
            },
            raw_response: Some(body.clone()),
            ..Default::default()
        }
    }

    fn stream_decoder(&self) -> Box<dyn StreamDecoder> {
        Box::new(ChatDecoder::default())
    }

    fn stream_encoder(&self, model: &str) -> Box<dyn StreamEncoder> {
        Box::new(ChatEncoder::new(model))
    }

    fn extract_usage(&self, data: &str) -> Option<UsageDelta> {
        let json: Value = serde_json::from_str(data.trim()).ok()?;
        let usage = json.get("usage")?;
        if usage.is_null() {
            return None;
        }
        let delta = usage_from_value(usage);
        if delta.is_empty() { None } else { Some(delta) }
    }
}

#[derive(Default)]
struct ChatDecoder {
    started: bool,
}

impl StreamDecoder for ChatDecoder {
    fn decode_event(&mut self, data: &str) -> Vec<StreamChunk> {
        let trimmed = data.trim();
        if trimmed == "[DONE]" {
            return vec![StreamChunk::Done];
        }
        let Ok(json) = serde_json::from_str::<Value>(trimmed) else {
            return Vec::new();
        };
        let mut chunks = Vec::new();
        if !self.started {
            self.started = true;
            chunks.push(StreamChunk::Start {
                id: json.get("id").and_then(|v| v.as_str()).unwrap_or("").to_string(),
                model: json.get("model").and_then(|v| v.as_str()).unwrap_or("").to_string(),
            });
        }
        if let Some(choice) = json
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
        {
            if let Some(delta) = choice.get("delta") {
                if let Some(text) = delta.get("reasoning_content").and_then(|v| v.as_str()) {
                    if !text.is_empty() {
                        chunks.push(StreamChunk::ReasoningDelta { index: 0, text: text.to_string() });
                    }
                }
                if let Some(text) = delta.get("content").and_then(|v| v.as_str()) {
                    if !text.is_empty() {
                        chunks.push(StreamChunk::TextDelta { index: 0, text: text.to_string() });
                    }
                }
                if let Some(tool_calls) = delta.get("tool_calls").and_then(|v| v.as_array()) {
                    for call in tool_calls {
                        let index = call.get("index").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
                        let function = call.get("function").cloned().unwrap_or(Value::Null);
                        if let Some(name) = function.get("name").and_then(|v| v.as_str()) {
                            chunks.push(StreamChunk::ToolCallStart {
                                index,
                                id: call.get("id").and_then(|v| v.as_str()).unwrap_or("tool_call").to_string(),
                                name: name.to_string(),
                            });
                        }
                        if let Some(args) = function.get("arguments").and_then(|v| v.as_str()) {
                            if !args.is_empty() {
                                chunks.push(StreamChunk::ToolCallDelta { index, arguments: args.to_string() });
                            }
                        }
                    }
                }
            }
            if let Some(reason) = choice.get("finish_reason").and_then(|v| v.as_str()) {
                chunks.push(StreamChunk::Finish { reason: FinishReason::from_openai(reason) });
            }
        }
        if let Some(usage) = json.get("usage").filter(|u| !u.is_null()) {
            let delta = usage_from_value(usage);
            if !delta.is_empty() {
                chunks.push(StreamChunk::Usage(delta));
            }
        }
        chunks
    }

    fn finish(&mut self) -> Vec<StreamChunk> {
        Vec::new()
    }
}

struct ChatEncoder {
    id: String,
    model: String,
    created: i64,
    sent_role: bool,
    sent_done: bool,
}

impl ChatEncoder {
    fn new(model: &str) -> Self {
        Self {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            model: model.to_string(),
            created: chrono::Utc::now().timestamp(),
            sent_role: false,
            sent_done: false,
        }
    }

    fn frame(&mut self, delta: Value, finish_reason: Value, usage: Value) -> String {
        let mut delta = delta;
        if !self.sent_role {
            self.sent_role = true;
            if let Some(obj) = delta.as_object_mut() {
                obj.insert("role".to_string(), json!("assistant"));
            }
        }
        let body = json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{ "index": 0, "delta": delta, "finish_reason": finish_reason }],
            "usage": usage,
        });
        format!("data: {}\n\n", body)
    }
}

impl StreamEncoder for ChatEncoder {
    fn encode(&mut self, chunk: &StreamChunk) -> Vec<String> {
        match chunk {
            StreamChunk::Start { id, model } => {
                if !id.is_empty() {
                    self.id = id.clone();
                }
                if !model.is_empty() {
                    self.model = model.clone();
                }
                Vec::new()
            }
            StreamChunk::TextDelta { text, .. } => {
                vec![self.frame(json!({ "content": text }), Value::Null, Value::Null)]
            }
            StreamChunk::ReasoningDelta { text, .. } => {
                vec![self.frame(json!({ "reasoning_content": text }), Value::Null, Value::Null)]
            }
            StreamChunk::ToolCallStart { index, id, name } => vec![self.frame(
                json!({ "tool_calls": [{ "index": index, "id": id, "type": "function", "function": { "name": name, "arguments": "" } }] }),
                Value::Null,
                Value::Null,
            )],
            StreamChunk::ToolCallDelta { index, arguments } => vec![self.frame(
                json!({ "tool_calls": [{ "index": index, "function": { "arguments": arguments } }] }),
                Value::Null,
                Value::Null,
            )],
            StreamChunk::Usage(delta) => {
                let output = delta.output.unwrap_or(0);
                let usage = json!({
                    "prompt_tokens": delta.input.unwrap_or(0),
                    "completion_tokens": output,
                    "total_tokens": delta.input.unwrap_or(0) + output,
                    "prompt_tokens_details": { "cached_tokens": delta.cached.unwrap_or(0) },
                    "completion_tokens_details": { "reasoning_tokens": delta.reasoning.unwrap_or(0) },
                });
                vec![self.frame(json!({}), Value::Null, usage)]
            }
            StreamChunk::Finish { reason } => {
                vec![self.frame(json!({}), json!(reason.as_openai()), Value::Null)]
            }
            StreamChunk::Done => {
                if self.sent_done {
                    Vec::new()
                } else {
                    self.sent_done = true;
                    vec!["data: [DONE]\n\n".to_string()]
                }
            }
        }
    }

    fn finish(&mut self) -> Vec<String> {
        if self.sent_done {
            Vec::new()
        } else {
            self.sent_done = true;
            vec!["data: [DONE]\n\n".to_string()]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_request() {
        let body = json!({
            "model": "gpt-4o",
            "messages": [
                { "role": "system", "content": "be brief" },
                { "role": "user", "content": "Hello" }
            ],
            "max_tokens": 256,
            "stream": true
        });
        let req = ChatTransformer.parse_request(&body, "r1").unwrap();
        assert_eq!(req.model, "gpt-4o");
        assert_eq!(req.system.as_deref(), Some("be brief"));
        assert_eq!(req.messages.len(), 1);
        assert_eq!(req.messages[0].plain_text(), "Hello");
        assert_eq!(req.max_tokens, Some(256));
        assert!(req.stream);
    }

    #[test]
    fn missing_model_is_invalid() {
        let body = json!({ "messages": [] });
        assert!(ChatTransformer.parse_request(&body, "r1").is_err());
    }

    #[test]
    fn tool_round_trip() {
        let body = json!({
            "model": "m",
            "messages": [
                { "role": "assistant", "tool_calls": [
                    { "id": "call_1", "type": "function",
                      "function": { "name": "get_weather", "arguments": "{\"city\":\"Oslo\"}" } }
                ] },
                { "role": "tool", "tool_call_id": "call_1", "content": "12C" }
            ],
            "tools": [
                { "type": "function", "function": { "name": "get_weather", "parameters": { "type": "object" } } }
            ],
            "tool_choice": "required"
        });
        let req = ChatTransformer.parse_request(&body, "r1").unwrap();
        assert_eq!(req.tools.len(), 1);
        assert_eq!(req.tool_choice, Some(ToolChoice::Required));
        assert!(matches!(req.messages[0].parts[0], ContentPart::ToolUse { .. }));
        assert!(matches!(req.messages[1].parts[0], ContentPart::ToolResult { .. }));

        let (out, _) = ChatTransformer.transform_request(&req, "target");
        assert_eq!(out["model"], "target");
        assert_eq!(out["messages"][0]["tool_calls"][0]["function"]["name"], "get_weather");
        assert_eq!(out["messages"][1]["role"], "tool");
    }

    #[test]
    fn data_uri_image_becomes_base64() {
        let body = json!({
            "model": "m",
            "messages": [{ "role": "user", "content": [
                { "type": "text", "text": "what is this" },
                { "type": "image_url", "image_url": { "url": "data:image/png;base64,AAAA" } }
            ]}]
        });
        let req = ChatTransformer.parse_request(&body, "r1").unwrap();
        match &req.messages[0].parts[1] {
            ContentPart::Image { source: MediaSource::Base64 { media_type, data } } => {
                assert_eq!(media_type, "image/png");
                assert_eq!(data, "AAAA");
            }
            other => panic!("unexpected part: {:?}", other),
        }
    }

    #[test]
    fn extract_usage_with_details() {
        let data = r#"{"usage":{"prompt_tokens":8,"completion_tokens":174,
            "prompt_tokens_details":{"cached_tokens":2},
            "completion_tokens_details":{"reasoning_tokens":173}}}"#;
        let usage = ChatTransformer.extract_usage(data).unwrap();
        assert_eq!(usage.input, Some(8));
        assert_eq!(usage.output, Some(174));
        assert_eq!(usage.cached, Some(2));
        assert_eq!(usage.reasoning, Some(173));
    }

    #[test]
    fn decoder_emits_text_and_finish() {
        let mut decoder = ChatDecoder::default();
        let chunks = decoder.decode_event(
            r#"{"id":"c1","model":"m","choices":[{"delta":{"content":"hi"},"finish_reason":null}]}"#,
        );
        assert!(matches!(chunks[0], StreamChunk::Start { .. }));
        assert!(matches!(&chunks[1], StreamChunk::TextDelta { text, .. } if text == "hi"));

        let chunks = decoder.decode_event(
            r#"{"id":"c1","choices":[{"delta":{},"finish_reason":"stop"}]}"#,
        );
        assert!(matches!(chunks[0], StreamChunk::Finish { reason: FinishReason::Stop }));
        assert_eq!(decoder.decode_event("[DONE]"), vec![StreamChunk::Done]);
    }

    #[test]
    fn encoder_terminates_with_done_sentinel() {
        let mut encoder = ChatEncoder::new("m");
        let frames = encoder.encode(&StreamChunk::TextDelta { index: 0, text: "hey".to_string() });
        assert!(frames[0].starts_with("data: "));
        assert!(frames[0].contains("\"content\":\"hey\""));
        assert!(frames[0].contains("\"role\":\"assistant\""));
        let done = encoder.finish();
        assert_eq!(done, vec!["data: [DONE]\n\n".to_string()]);
        assert!(encoder.finish().is_empty());
    }
}
