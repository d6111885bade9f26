//! OpenAI responses dialect.

use serde_json::{json, Map, Value};

use super::{
    ApiType, ContentPart, FinishReason, MediaSource, ResponseFormat, Role, StreamChunk,
    StreamDecoder, StreamEncoder, ToolChoice, ToolDefinition, TransformError, TransformWarning,
    Transformer, UnifiedMessage, UnifiedRequest, UnifiedResponse, UsageDelta,
};

pub struct ResponsesTransformer;

fn parse_message_content(content: &Value, warnings: &mut Vec<TransformWarning>) -> Vec<ContentPart> {
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
                    "input_text" | "output_text" | "text" => {
                        if let Some(text) = item.get("text").and_then(|v| v.as_str()) {
                            parts.push(ContentPart::Text { text: text.to_string() });
                        }
                    }
                    "input_image" => {
                        if let Some(url) = item.get("image_url").and_then(|v| v.as_str()) {
                            parts.push(ContentPart::Image {
                                source: MediaSource::Url { url: url.to_string() },
                            });
                        } else if let Some(file_id) = item.get("file_id").and_then(|v| v.as_str()) {
                            parts.push(ContentPart::Image {
                                source: MediaSource::FileId { file_id: file_id.to_string() },
                            });
                        }
                    }
                    "input_file" => {
                        if let Some(file_id) = item.get("file_id").and_then(|v| v.as_str()) {
                            parts.push(ContentPart::Document {
                                source: MediaSource::FileId { file_id: file_id.to_string() },
                                media_type: None,
                            });
                        } else if let Some(data) = item.get("file_data").and_then(|v| v.as_str()) {
                            parts.push(ContentPart::Document {
                                source: MediaSource::Base64 {
                                    media_type: "application/pdf".to_string(),
                                    data: data.to_string(),
                                },
                                media_type: Some("application/pdf".to_string()),
                            });
                        }
                    }
                    "refusal" => {
                        if let Some(text) = item.get("refusal").and_then(|v| v.as_str()) {
                            parts.push(ContentPart::Text { text: text.to_string() });
                        }
                    }
                    other => {
                        warnings.push(TransformWarning::new(
                            "unknown_content",
                            format!("unrecognized responses content type '{}' dropped", other),
                        ));
                    }
                }
            }
        }
        _ => {}
    }
    parts
}

fn usage_from_value(usage: &Value) -> UsageDelta {
    UsageDelta {
        input: usage.get("input_tokens").and_then(|v| v.as_i64()),
        output: usage.get("output_tokens").and_then(|v| v.as_i64()),
        cached: usage
            .get("input_tokens_details")
            .and_then(|d| d.get("cached_tokens"))
            .and_then(|v| v.as_i64()),
        reasoning: usage
            .get("output_tokens_details")
            .and_then(|d| d.get("reasoning_tokens"))
            .and_then(|v| v.as_i64()),
        cache_write: None,
    }
}

/// Build the `output` array of a responses body from unified parts.
fn output_items(response: &UnifiedResponse) -> Vec<Value> {
    let mut output = Vec::new();
    let reasoning: String = response
        .parts
        .iter()
        .filter_map(|p| match p {
            ContentPart::Reasoning { text } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    if !reasoning.is_empty() {
        output.push(json!({
            "type": "reasoning",
            "id": format!("rs_{}", uuid::Uuid::new_v4().simple()),
            "summary": [{ "type": "summary_text", "text": reasoning }],
        }));
    }
    let text: String = response
        .parts
        .iter()
        .filter_map(|p| match p {
            ContentPart::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    if !text.is_empty() {
        output.push(json!({
            "type": "message",
            "id": format!("msg_{}", uuid::Uuid::new_v4().simple()),
            "status": "completed",
            "role": "assistant",
            "content": [{ "type": "output_text", "text": text, "annotations": [] }],
        }));
    }
    for part in &response.parts {
        if let ContentPart::ToolUse { id, name, arguments } = part {
            output.push(json!({
                "type": "function_call",
                "id": format!("fc_{}", uuid::Uuid::new_v4().simple()),
                "call_id": id,
                "name": name,
                "arguments": serde_json::to_string(arguments).unwrap_or_else(|_| "{}".to_string()),
                "status": "completed",
            }));
        }
    }
    output
}

impl Transformer for ResponsesTransformer {
    fn name(&self) -> &'static str {
        "responses"
    }

    fn api_type(&self) -> ApiType {
        ApiType::Responses
    }

    fn default_endpoint(&self) -> &'static str {
        "/responses"
    }

    fn parse_request(&self, body: &Value, request_id: &str) -> Result<UnifiedRequest, TransformError> {
        let model = body
            .get("model")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| TransformError::InvalidRequest("missing 'model' field".to_string()))?
            .to_string();

        let mut warnings = Vec::new();
        let mut messages = Vec::new();

        match body.get("input") {
            Some(Value::String(text)) => {
                messages.push(UnifiedMessage::text(Role::User, text.clone()));
            }
            Some(Value::Array(items)) => {
                for item in items {
                    // Bare {role, content} entries are accepted alongside
                    // typed items.
                    let item_type = item
                        .get("type")
                        .and_then(|v| v.as_str())
                        .unwrap_or("message");
                    match item_type {
                        "message" => {
                            let role = match item.get("role").and_then(|v| v.as_str()).unwrap_or("user") {
                                "assistant" => Role::Assistant,
                                "system" | "developer" => Role::System,
                                _ => Role::User,
                            };
                            let parts = parse_message_content(
                                item.get("content").unwrap_or(&Value::Null),
                                &mut warnings,
                            );
                            messages.push(UnifiedMessage { role, parts });
                        }
                        "function_call" => {
                            messages.push(UnifiedMessage {
                                role: Role::Assistant,
                                parts: vec![ContentPart::ToolUse {
                                    id: item
                                        .get("call_id")
                                        .and_then(|v| v.as_str())
                                        .unwrap_or("call_0")
                                        .to_string(),
                                    name: item
                                        .get("name")
                                        .and_then(|v| v.as_str())
                                        .unwrap_or("tool")
                                        .to_string(),
                                    arguments: item
                                        .get("arguments")
                                        .and_then(|v| v.as_str())
                                        .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
                                        .unwrap_or_else(|| json!({})),
                                }],
                            });
                        }
                        "function_call_output" => {
                            messages.push(UnifiedMessage {
                                role: Role::Tool,
                                parts: vec![ContentPart::ToolResult {
                                    tool_use_id: item
                                        .get("call_id")
                                        .and_then(|v| v.as_str())
                                        .unwrap_or("call_0")
                                        .to_string(),
                                    content: item
                                        .get("output")
                                        .and_then(|v| v.as_str())
                                        .unwrap_or_default()
                                        .to_string(),
                                }],
                            });
                        }
                        "reasoning" => {
                            let summary: String = item
                                .get("summary")
                                .and_then(|v| v.as_array())
                                .map(|items| {
                                    items
                                        .iter()
                                        .filter_map(|s| s.get("text").and_then(|v| v.as_str()))
                                        .collect::<Vec<_>>()
                                        .join("")
                                })
                                .unwrap_or_default();
                            if !summary.is_empty() {
                                messages.push(UnifiedMessage {
                                    role: Role::Assistant,
                                    parts: vec![ContentPart::Reasoning { text: summary }],
                                });
                            }
                        }
                        "mcp_approval_request" | "mcp_approval_response" | "local_shell_call"
                        | "local_shell_call_output" | "computer_call" | "computer_call_output" => {
                            warnings.push(TransformWarning::new(
                                "dropped_item",
                                format!("'{}' input items are not forwarded", item_type),
                            ));
                        }
                        other => {
                            warnings.push(TransformWarning::new(
                                "unknown_item",
                                format!("unrecognized input item type '{}' dropped", other),
                            ));
                        }
                    }
                }
            }
            _ => {
                return Err(TransformError::InvalidRequest("missing 'input' field".to_string()));
            }
        }

        // System entries fold into the instruction string.
        let mut system_texts: Vec<String> = Vec::new();
        if let Some(instructions) = body.get("instructions").and_then(|v| v.as_str()) {
            system_texts.push(instructions.to_string());
        }
        messages.retain(|m| {
            if m.role == Role::System {
                let text = m.plain_text();
                if !text.is_empty() {
                    system_texts.push(text);
                }
                false
            } else {
                true
            }
        });

        let tools = body
            .get("tools")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|t| {
                        match t.get("type").and_then(|v| v.as_str()).unwrap_or("function") {
                            "function" => Some(ToolDefinition {
                                name: t.get("name")?.as_str()?.to_string(),
                                description: t
                                    .get("description")
                                    .and_then(|v| v.as_str())
                                    .map(|s| s.to_string()),
                                parameters: t.get("parameters").cloned().unwrap_or_else(|| json!({})),
                            }),
                            other => {
                                warnings.push(TransformWarning::new(
                                    "dropped_tool",
                                    format!("'{}' tools are not forwarded", other),
                                ));
                                None
                            }
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();

        let tool_choice = body.get("tool_choice").and_then(|tc| match tc {
            Value::String(s) => match s.as_str() {
                "auto" => Some(ToolChoice::Auto),
                "none" => Some(ToolChoice::None),
                "required" => Some(ToolChoice::Required),
                _ => None,
            },
            Value::Object(_) => tc
                .get("name")
                .and_then(|v| v.as_str())
                .map(|name| ToolChoice::Tool(name.to_string())),
            _ => None,
        });

        let response_format = body
            .get("text")
            .and_then(|t| t.get("format"))
            .and_then(|format| match format.get("type").and_then(|v| v.as_str()) {
                Some("json_object") => Some(ResponseFormat::Json { schema: None }),
                Some("json_schema") => Some(ResponseFormat::Json {
                    schema: format.get("schema").cloned(),
                }),
                Some("text") => Some(ResponseFormat::Text),
                _ => None,
            });

        Ok(UnifiedRequest {
            model,
            messages,
            system: if system_texts.is_empty() { None } else { Some(system_texts.join("\n\n")) },
            tools,
            tool_choice,
            max_tokens: body.get("max_output_tokens").and_then(|v| v.as_u64()),
            temperature: body.get("temperature").and_then(|v| v.as_f64()),
            top_p: body.get("top_p").and_then(|v| v.as_f64()),
            stop_sequences: Vec::new(),
            response_format,
            stream: body.get("stream").and_then(|v| v.as_bool()).unwrap_or(false),
            metadata: body.get("metadata").cloned(),
            incoming_api_type: ApiType::Responses,
            original_body: body.clone(),
            request_id: request_id.to_string(),
            warnings,
        })
    }

    fn transform_request(&self, request: &UnifiedRequest, model: &str) -> (Value, Vec<TransformWarning>) {
        let warnings = Vec::new();
        let mut out = Map::new();
        out.insert("model".to_string(), Value::String(model.to_string()));

        let mut input = Vec::new();
        for msg in &request.messages {
            match msg.role {
                Role::Tool => {
                    for part in &msg.parts {
                        if let ContentPart::ToolResult { tool_use_id, content } = part {
                            input.push(json!({
                                "type": "function_call_output",
                                "call_id": tool_use_id,
                                "output": content,
                            }));
                        }
                    }
                }
                _ => {
                    let role = msg.role.as_str();
                    let content_type = if msg.role == Role::Assistant { "output_text" } else { "input_text" };
                    let mut content = Vec::new();
                    for part in &msg.parts {
                        match part {
                            ContentPart::Text { text } => {
                                content.push(json!({ "type": content_type, "text": text }))
                            }
                            ContentPart::Image { source } => match source {
                                MediaSource::Url { url } => content.push(json!({
                                    "type": "input_image", "image_url": url
                                })),
                                MediaSource::Base64 { media_type, data } => content.push(json!({
                                    "type": "input_image",
                                    "image_url": format!("data:{};base64,{}", media_type, data),
                                })),
                                MediaSource::FileId { file_id } => content.push(json!({
                                    "type": "input_image", "file_id": file_id
                                })),
                            },
                            ContentPart::Document { source, .. } => match source {
                                MediaSource::FileId { file_id } => content.push(json!({
                                    "type": "input_file", "file_id": file_id
                                })),
                                MediaSource::Base64 { data, .. } => content.push(json!({
                                    "type": "input_file", "file_data": data
                                })),
                                MediaSource::Url { url } => content.push(json!({
                                    "type": "input_file", "file_url": url
                                })),
                            },
                            _ => {}
                        }
                    }
                    if !content.is_empty() {
                        input.push(json!({ "type": "message", "role": role, "content": content }));
                    }
                    for part in &msg.parts {
                        if let ContentPart::ToolUse { id, name, arguments } = part {
                            input.push(json!({
                                "type": "function_call",
                                "call_id": id,
                                "name": name,
                                "arguments": serde_json::to_string(arguments)
                                    .unwrap_or_else(|_| "{}".to_string()),
                            }));
                        }
                    }
                }
            }
        }
        out.insert("input".to_string(), Value::Array(input));

        if let Some(system) = &request.system {
            out.insert("instructions".to_string(), json!(system));
        }
        if !request.tools.is_empty() {
            let tools: Vec<Value> = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    })
                })
                .collect();
            out.insert("tools".to_string(), Value::Array(tools));
        }
        if let Some(choice) = &request.tool_choice {
            let value = match choice {
                ToolChoice::Auto => json!("auto"),
                ToolChoice::None => json!("none"),
                ToolChoice::Required => json!("required"),
                ToolChoice::Tool(name) => json!({ "type": "function", "name": name }),
            };
            out.insert("tool_choice".to_string(), value);
        }
        if let Some(max_tokens) = request.max_tokens {
            out.insert("max_output_tokens".to_string(), json!(max_tokens));
        }
        if let Some(temperature) = request.temperature {
            out.insert("temperature".to_string(), json!(temperature));
        }
        if let Some(top_p) = request.top_p {
            out.insert("top_p".to_string(), json!(top_p));
        }
        if let Some(format) = &request.response_format {
            let value = match format {
                ResponseFormat::Text => json!({ "format": { "type": "text" } }),
                ResponseFormat::Json { schema: None } => json!({ "format": { "type": "json_object" } }),
                ResponseFormat::Json { schema: Some(schema) } => json!({
                    "format": { "type": "json_schema", "name": "response", "schema": schema }
                }),
            };
            out.insert("text".to_string(), value);
        }
        if request.stream {
            out.insert("stream".to_string(), Value::Bool(true));
        }
        if let Some(metadata) = &request.metadata {
            out.insert("metadata".to_string(), metadata.clone());
        }

        (Value::Object(out), warnings)
    }

    fn format_response(&self, response: &UnifiedResponse) -> Value {
        let id = if response.id.is_empty() {
            format!("resp_{}", uuid::Uuid::new_v4().simple())
        } else if response.id.starts_with("resp_") {
            response.id.clone()
        } else {
            format!("resp_{}", response.id)
        };
        let status = match response.finish_reason {
            Some(FinishReason::Length) => "incomplete",
            _ => "completed",
        };
        json!({
            "id": id,
            "object": "response",
            "created_at": chrono::Utc::now().timestamp(),
            "status": status,
            "model": response.model,
            "output": output_items(response),
            "usage": {
                "input_tokens": response.usage.input,
                "input_tokens_details": { "cached_tokens": response.usage.cached },
                "output_tokens": response.usage.output + response.usage.reasoning,
                "output_tokens_details": { "reasoning_tokens": response.usage.reasoning },
                "total_tokens": response.usage.input + response.usage.output + response.usage.reasoning,
            },
        })
    }

    fn parse_response(&self, body: &Value, model: &str) -> UnifiedResponse {
        let mut warnings = Vec::new();
        let mut parts = Vec::new();
        if let Some(output) = body.get("output").and_then(|v| v.as_array()) {
            for item in output {
                match item.get("type").and_then(|v| v.as_str()).unwrap_or("") {
                    "message" => {
                        parts.extend(parse_message_content(
                            item.get("content").unwrap_or(&Value::Null),
                            &mut warnings,
                        ));
                    }
                    "reasoning" => {
                        let summary: String = item
                            .get("summary")
                            .and_then(|v| v.as_array())
                            .map(|items| {
                                items
                                    .iter()
                                    .filter_map(|s| s.get("text").and_then(|v| v.as_str()))
                                    .collect::<Vec<_>>()
                                    .join("")
                            })
                            .unwrap_or_default();
                        if !summary.is_empty() {
                            parts.push(ContentPart::Reasoning { text: summary });
                        }
                    }
                    "function_call" => {
                        parts.push(ContentPart::ToolUse {
                            id: item
                                .get("call_id")
                                .and_then(|v| v.as_str())
                                .unwrap_or("call_0")
                                .to_string(),
                            name: item.get("name").and_then(|v| v.as_str()).unwrap_or("tool").to_string(),
                            arguments: item
                                .get("arguments")
                                .and_then(|v| v.as_str())
                                .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
                                .unwrap_or_else(|| json!({})),
                        });
                    }
                    _ => {}
                }
            }
        }
        let usage = body.get("usage").map(usage_from_value).unwrap_or_default();
        let finish_reason = match body.get("status").and_then(|v| v.as_str()) {
            Some("incomplete") => Some(FinishReason::Length),
            _ => {
                if parts.iter().any(|p| matches!(p, ContentPart::ToolUse { .. })) {
                    Some(FinishReason::ToolUse)
                } else {
                    Some(FinishReason::Stop)
                }
            }
        };
        UnifiedResponse {
            id: body.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            model: body.get("model").and_then(|v| v.as_str()).unwrap_or(model).to_string(),
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
            warnings,
            ..Default::default()
        }
    }

    fn stream_decoder(&self) -> Box<dyn StreamDecoder> {
        Box::new(ResponsesDecoder::default())
    }

    fn stream_encoder(&self, model: &str) -> Box<dyn StreamEncoder> {
        Box::new(ResponsesEncoder::new(model))
    }

    fn extract_usage(&self, data: &str) -> Option<UsageDelta> {
        let json: Value = serde_json::from_str(data.trim()).ok()?;
        let usage = match json.get("type").and_then(|v| v.as_str()) {
            Some("response.completed") | Some("response.incomplete") => {
                json.get("response")?.get("usage")?.clone()
            }
            _ => json.get("usage")?.clone(),
        };
        let delta = usage_from_value(&usage);
        if delta.is_empty() { None } else { Some(delta) }
    }
}

#[derive(Default)]
struct ResponsesDecoder {
    tool_indices: std::collections::HashMap<usize, usize>,
}

impl StreamDecoder for ResponsesDecoder {
    fn decode_event(&mut self, data: &str) -> Vec<StreamChunk> {
        let trimmed = data.trim();
        if trimmed == "[DONE]" {
            return vec![StreamChunk::Done];
        }
        let Ok(json) = serde_json::from_str::<Value>(trimmed) else {
            return Vec::new();
        };
        let mut chunks = Vec::new();
        match json.get("type").and_then(|v| v.as_str()).unwrap_or("") {
            "response.created" => {
                let response = json.get("response").cloned().unwrap_or(Value::Null);
                chunks.push(StreamChunk::Start {
                    id: response.get("id").and_then(|v| v.as_str()).unwrap_or("").to_string(),
                    model: response.get("model").and_then(|v| v.as_str()).unwrap_or("").to_string(),
                });
            }
            "response.output_item.added" => {
                if let Some(item) = json.get("item") {
                    if item.get("type").and_then(|v| v.as_str()) == Some("function_call") {
                        let output_index =
                            json.get("output_index").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
                        let index = self.tool_indices.len();
                        self.tool_indices.insert(output_index, index);
                        chunks.push(StreamChunk::ToolCallStart {
                            index,
                            id: item
                                .get("call_id")
                                .and_then(|v| v.as_str())
                                .unwrap_or("call_0")
                                .to_string(),
                            name: item.get("name").and_then(|v| v.as_str()).unwrap_or("tool").to_string(),
                        });
                    }
                }
            }
            "response.output_text.delta" => {
                if let Some(text) = json.get("delta").and_then(|v| v.as_str()) {
                    chunks.push(StreamChunk::TextDelta { index: 0, text: text.to_string() });
                }
            }
            "response.reasoning_summary_text.delta" | "response.reasoning_text.delta" => {
                if let Some(text) = json.get("delta").and_then(|v| v.as_str()) {
                    chunks.push(StreamChunk::ReasoningDelta { index: 0, text: text.to_string() });
                }
            }
            "response.function_call_arguments.delta" => {
                if let Some(args) = json.get("delta").and_then(|v| v.as_str()) {
                    let output_index =
                        json.get("output_index").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
                    let index = self.tool_indices.get(&output_index).copied().unwrap_or(0);
                    chunks.push(StreamChunk::ToolCallDelta { index, arguments: args.to_string() });
                }
            }
            "response.completed" | "response.incomplete" => {
                let response = json.get("response").cloned().unwrap_or(Value::Null);
                if let Some(usage) = response.get("usage") {
                    let delta = usage_from_value(usage);
                    if !delta.is_empty() {
                        chunks.push(StreamChunk::Usage(delta));
                    }
                }
                let reason = if json.get("type").and_then(|v| v.as_str()) == Some("response.incomplete") {
                    FinishReason::Length
                } else {
                    FinishReason::Stop
                };
                chunks.push(StreamChunk::Finish { reason });
                chunks.push(StreamChunk::Done);
            }
            _ => {}
        }
        chunks
    }

    fn finish(&mut self) -> Vec<StreamChunk> {
        Vec::new()
    }
}

struct ResponsesEncoder {
    id: String,
    model: String,
    sequence: u64,
    started: bool,
    message_opened: bool,
    completed: bool,
    text: String,
    usage: UsageDelta,
    finish_reason: Option<FinishReason>,
}

impl ResponsesEncoder {
    fn new(model: &str) -> Self {
        Self {
            id: format!("resp_{}", uuid::Uuid::new_v4().simple()),
            model: model.to_string(),
            sequence: 0,
            started: false,
            message_opened: false,
            completed: false,
            text: String::new(),
            usage: UsageDelta::default(),
            finish_reason: None,
        }
    }

    fn frame(&mut self, event: &str, mut data: Map<String, Value>) -> String {
        self.sequence += 1;
        data.insert("type".to_string(), json!(event));
        data.insert("sequence_number".to_string(), json!(self.sequence));
        format!("event: {}\ndata: {}\n\n", event, Value::Object(data))
    }

    fn response_value(&self, status: &str) -> Value {
        json!({
            "id": self.id,
            "object": "response",
            "status": status,
            "model": self.model,
            "usage": {
                "input_tokens": self.usage.input.unwrap_or(0),
                "input_tokens_details": { "cached_tokens": self.usage.cached.unwrap_or(0) },
                "output_tokens": self.usage.output.unwrap_or(0),
                "output_tokens_details": { "reasoning_tokens": self.usage.reasoning.unwrap_or(0) },
                "total_tokens": self.usage.input.unwrap_or(0) + self.usage.output.unwrap_or(0),
            },
        })
    }

    fn ensure_started(&mut self, frames: &mut Vec<String>) {
        if self.started {
            return;
        }
        self.started = true;
        let mut data = Map::new();
        data.insert("response".to_string(), self.response_value("in_progress"));
        frames.push(self.frame("response.created", data));
    }

    fn ensure_message(&mut self, frames: &mut Vec<String>) {
        if self.message_opened {
            return;
        }
        self.message_opened = true;
        let mut data = Map::new();
        data.insert("output_index".to_string(), json!(0));
        data.insert(
            "item".to_string(),
            json!({
                "type": "message",
                "id": format!("msg_{}", uuid::Uuid::new_v4().simple()),
                "status": "in_progress",
                "role": "assistant",
                "content": [],
            }),
        );
        frames.push(self.frame("response.output_item.added", data));
    }

    fn complete(&mut self, frames: &mut Vec<String>) {
        if self.completed {
            return;
        }
        self.completed = true;
        if self.message_opened {
            let mut done = Map::new();
            done.insert("output_index".to_string(), json!(0));
            done.insert("text".to_string(), json!(self.text));
            frames.push(self.frame("response.output_text.done", done));
        }
        let status = match self.finish_reason {
            Some(FinishReason::Length) => "incomplete",
            _ => "completed",
        };
        let event = if status == "incomplete" { "response.incomplete" } else { "response.completed" };
        let mut data = Map::new();
        data.insert("response".to_string(), self.response_value(status));
        frames.push(self.frame(event, data));
    }
}

impl StreamEncoder for ResponsesEncoder {
    fn encode(&mut self, chunk: &StreamChunk) -> Vec<String> {
        let mut frames = Vec::new();
        match chunk {
            StreamChunk::Start { id, model } => {
                if !id.is_empty() {
                    self.id = if id.starts_with("resp_") { id.clone() } else { format!("resp_{}", id) };
                }
                if !model.is_empty() {
                    self.model = model.clone();
                }
                self.ensure_started(&mut frames);
            }
            StreamChunk::TextDelta { text, .. } => {
                self.ensure_started(&mut frames);
                self.ensure_message(&mut frames);
                self.text.push_str(text);
                let mut data = Map::new();
                data.insert("output_index".to_string(), json!(0));
                data.insert("delta".to_string(), json!(text));
                frames.push(self.frame("response.output_text.delta", data));
            }
            StreamChunk::ReasoningDelta { text, .. } => {
                self.ensure_started(&mut frames);
                let mut data = Map::new();
                data.insert("output_index".to_string(), json!(0));
                data.insert("delta".to_string(), json!(text));
                frames.push(self.frame("response.reasoning_summary_text.delta", data));
            }
            StreamChunk::ToolCallStart { index, id, name } => {
                self.ensure_started(&mut frames);
                let mut data = Map::new();
                data.insert("output_index".to_string(), json!(index));
                data.insert(
                    "item".to_string(),
                    json!({
                        "type": "function_call",
                        "id": format!("fc_{}", uuid::Uuid::new_v4().simple()),
                        "call_id": id,
                        "name": name,
                        "arguments": "",
                    }),
                );
                frames.push(self.frame("response.output_item.added", data));
            }
            StreamChunk::ToolCallDelta { index, arguments } => {
                self.ensure_started(&mut frames);
                let mut data = Map::new();
                data.insert("output_index".to_string(), json!(index));
                data.insert("delta".to_string(), json!(arguments));
                frames.push(self.frame("response.function_call_arguments.delta", data));
            }
            StreamChunk::Usage(delta) => {
                if let Some(v) = delta.input {
                    self.usage.input = Some(self.usage.input.unwrap_or(0).max(v));
                }
                if let Some(v) = delta.output {
                    self.usage.output = Some(self.usage.output.unwrap_or(0).max(v));
                }
                if let Some(v) = delta.reasoning {
                    self.usage.reasoning = Some(self.usage.reasoning.unwrap_or(0).max(v));
                }
                if let Some(v) = delta.cached {
                    self.usage.cached = Some(self.usage.cached.unwrap_or(0).max(v));
                }
            }
            StreamChunk::Finish { reason } => {
                self.ensure_started(&mut frames);
                self.finish_reason = Some(reason.clone());
            }
            StreamChunk::Done => {
                self.ensure_started(&mut frames);
                self.complete(&mut frames);
            }
        }
        frames
    }

    fn finish(&mut self) -> Vec<String> {
        let mut frames = Vec::new();
        if self.started {
            self.complete(&mut frames);
        }
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_string_input() {
        let body = json!({ "model": "gpt-5", "input": "Hello", "instructions": "be brief" });
        let req = ResponsesTransformer.parse_request(&body, "r1").unwrap();
        assert_eq!(req.system.as_deref(), Some("be brief"));
        assert_eq!(req.messages[0].plain_text(), "Hello");
    }

    #[test]
    fn parse_item_list_with_function_output() {
        let body = json!({
            "model": "gpt-5",
            "input": [
                { "type": "message", "role": "user", "content": [{ "type": "input_text", "text": "hi" }] },
                { "type": "function_call", "call_id": "call_1", "name": "f", "arguments": "{}" },
                { "type": "function_call_output", "call_id": "call_1", "output": "42" }
            ]
        });
        let req = ResponsesTransformer.parse_request(&body, "r1").unwrap();
        assert_eq!(req.messages.len(), 3);
        assert!(matches!(req.messages[1].parts[0], ContentPart::ToolUse { .. }));
        assert!(matches!(req.messages[2].parts[0], ContentPart::ToolResult { .. }));
    }

    #[test]
    fn mcp_items_warn_and_drop() {
        let body = json!({
            "model": "gpt-5",
            "input": [{ "type": "mcp_approval_request", "id": "x" }]
        });
        let req = ResponsesTransformer.parse_request(&body, "r1").unwrap();
        assert!(req.messages.is_empty());
        assert!(req.warnings.iter().any(|w| w.kind == "dropped_item"));
    }

    #[test]
    fn format_response_builds_output_items() {
        let response = UnifiedResponse {
            model: "gpt-5".to_string(),
            parts: vec![
                ContentPart::Reasoning { text: "thinking...".to_string() },
                ContentPart::Text { text: "answer".to_string() },
            ],
            finish_reason: Some(FinishReason::Stop),
            usage: crate::pricing::TokenCounts { input: 5, output: 3, reasoning: 7, ..Default::default() },
            ..Default::default()
        };
        let body = ResponsesTransformer.format_response(&response);
        assert_eq!(body["object"], "response");
        assert_eq!(body["output"][0]["type"], "reasoning");
        assert_eq!(body["output"][1]["content"][0]["text"], "answer");
        assert_eq!(body["usage"]["output_tokens"], 10);
    }

    #[test]
    fn extract_usage_from_completed_event() {
        let data = r#"{"type":"response.completed","response":{"usage":{
            "input_tokens":12,"output_tokens":34,
            "input_tokens_details":{"cached_tokens":2},
            "output_tokens_details":{"reasoning_tokens":8}}}}"#;
        let usage = ResponsesTransformer.extract_usage(data).unwrap();
        assert_eq!(usage.input, Some(12));
        assert_eq!(usage.output, Some(34));
        assert_eq!(usage.cached, Some(2));
        assert_eq!(usage.reasoning, Some(8));
    }

    #[test]
    fn decoder_and_encoder_speak_event_protocol() {
        let mut decoder = ResponsesDecoder::default();
        let start = decoder.decode_event(r#"{"type":"response.created","response":{"id":"resp_1","model":"m"}}"#);
        assert!(matches!(start[0], StreamChunk::Start { .. }));
        let text = decoder.decode_event(r#"{"type":"response.output_text.delta","delta":"hey"}"#);
        assert!(matches!(&text[0], StreamChunk::TextDelta { text, .. } if text == "hey"));

        let mut encoder = ResponsesEncoder::new("m");
        let mut frames = Vec::new();
        frames.extend(encoder.encode(&StreamChunk::TextDelta { index: 0, text: "ok".to_string() }));
        frames.extend(encoder.encode(&StreamChunk::Done));
        let all = frames.join("");
        assert!(all.contains("event: response.created"));
        assert!(all.contains("event: response.output_text.delta"));
        assert!(all.contains("event: response.completed"));
    }
}
