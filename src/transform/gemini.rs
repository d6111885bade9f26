//! Google Gemini dialect.

use serde_json::{json, Map, Value};

use super::{
    ApiType, ContentPart, FinishReason, MediaSource, Role, StreamChunk, StreamDecoder,
    StreamEncoder, ToolChoice, ToolDefinition, TransformError, TransformWarning, Transformer,
    UnifiedMessage, UnifiedRequest, UnifiedResponse, UsageDelta,
};

pub struct GeminiTransformer;

fn parse_parts(parts: &Value, warnings: &mut Vec<TransformWarning>) -> Vec<ContentPart> {
    let mut out = Vec::new();
    let Some(items) = parts.as_array() else { return out };
    for part in items {
        if let Some(text) = part.get("text").and_then(|v| v.as_str()) {
            if part.get("thought").and_then(|v| v.as_bool()).unwrap_or(false) {
                out.push(ContentPart::Reasoning { text: text.to_string() });
            } else {
                out.push(ContentPart::Text { text: text.to_string() });
            }
        } else if let Some(inline) = part.get("inlineData").or_else(|| part.get("inline_data")) {
            let media_type = inline
                .get("mimeType")
                .or_else(|| inline.get("mime_type"))
                .and_then(|v| v.as_str())
                .unwrap_or("application/octet-stream")
                .to_string();
            let data = inline.get("data").and_then(|v| v.as_str()).unwrap_or("").to_string();
            let source = MediaSource::Base64 { media_type: media_type.clone(), data };
            if media_type.starts_with("image/") {
                out.push(ContentPart::Image { source });
            } else {
                out.push(ContentPart::Document { source, media_type: Some(media_type) });
            }
        } else if let Some(file) = part.get("fileData").or_else(|| part.get("file_data")) {
            if let Some(uri) = file
                .get("fileUri")
                .or_else(|| file.get("file_uri"))
                .and_then(|v| v.as_str())
            {
                out.push(ContentPart::Document {
                    source: MediaSource::Url { url: uri.to_string() },
                    media_type: file
                        .get("mimeType")
                        .or_else(|| file.get("mime_type"))
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_string()),
                });
            }
        } else if let Some(call) = part.get("functionCall").or_else(|| part.get("function_call")) {
            let name = call.get("name").and_then(|v| v.as_str()).unwrap_or("tool").to_string();
            out.push(ContentPart::ToolUse {
                id: name.clone(),
                name,
                arguments: call.get("args").cloned().unwrap_or_else(|| json!({})),
            });
        } else if let Some(resp) = part
            .get("functionResponse")
            .or_else(|| part.get("function_response"))
        {
            let name = resp.get("name").and_then(|v| v.as_str()).unwrap_or("tool").to_string();
            let content = resp
                .get("response")
                .map(|r| {
                    r.get("result")
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| r.to_string())
                })
                .unwrap_or_default();
            out.push(ContentPart::ToolResult { tool_use_id: name, content });
        } else {
            warnings.push(TransformWarning::new(
                "unknown_content",
                "unrecognized gemini part dropped",
            ));
        }
    }
    out
}

fn part_values(parts: &[ContentPart]) -> Vec<Value> {
    let mut out = Vec::new();
    for part in parts {
        match part {
            ContentPart::Text { text } => out.push(json!({ "text": text })),
            ContentPart::Reasoning { text } => out.push(json!({ "text": text, "thought": true })),
            ContentPart::Image { source } | ContentPart::Document { source, .. } => match source {
                MediaSource::Base64 { media_type, data } => out.push(json!({
                    "inlineData": { "mimeType": media_type, "data": data }
                })),
                MediaSource::Url { url } => out.push(json!({
                    "fileData": { "fileUri": url }
                })),
                MediaSource::FileId { file_id } => out.push(json!({
                    "fileData": { "fileUri": file_id }
                })),
            },
            ContentPart::ToolUse { name, arguments, .. } => out.push(json!({
                "functionCall": { "name": name, "args": arguments }
            })),
            ContentPart::ToolResult { tool_use_id, content } => out.push(json!({
                "functionResponse": { "name": tool_use_id, "response": { "result": content } }
            })),
        }
    }
    out
}

fn usage_from_metadata(metadata: &Value) -> UsageDelta {
    UsageDelta {
        input: metadata.get("promptTokenCount").and_then(|v| v.as_i64()),
        output: metadata.get("candidatesTokenCount").and_then(|v| v.as_i64()),
        reasoning: metadata.get("thoughtsTokenCount").and_then(|v| v.as_i64()),
        cached: metadata.get("cachedContentTokenCount").and_then(|v| v.as_i64()),
        cache_write: None,
    }
}

impl Transformer for GeminiTransformer {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn api_type(&self) -> ApiType {
        ApiType::Gemini
    }

    fn default_endpoint(&self) -> &'static str {
        "/v1beta/models"
    }

    fn parse_request(&self, body: &Value, request_id: &str) -> Result<UnifiedRequest, TransformError> {
        let model = body
            .get("model")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| TransformError::InvalidRequest("missing 'model' field".to_string()))?
            .to_string();
        let contents = body
            .get("contents")
            .and_then(|v| v.as_array())
            .ok_or_else(|| TransformError::InvalidRequest("missing 'contents' array".to_string()))?;

        let mut warnings = Vec::new();
        let mut messages = Vec::new();
        for content in contents {
            let role = match content.get("role").and_then(|v| v.as_str()).unwrap_or("user") {
                "model" => Role::Assistant,
                _ => Role::User,
            };
            let parts = parse_parts(content.get("parts").unwrap_or(&Value::Null), &mut warnings);
            messages.push(UnifiedMessage { role, parts });
        }

        let system = match body
            .get("systemInstruction")
            .or_else(|| body.get("system_instruction"))
        {
            Some(Value::String(text)) => Some(text.clone()),
            Some(instruction) => {
                let texts: Vec<&str> = instruction
                    .get("parts")
                    .and_then(|v| v.as_array())
                    .map(|parts| {
                        parts
                            .iter()
                            .filter_map(|p| p.get("text").and_then(|v| v.as_str()))
                            .collect()
                    })
                    .unwrap_or_default();
                if texts.is_empty() { None } else { Some(texts.join("\n\n")) }
            }
            None => None,
        };

        let mut tools = Vec::new();
        if let Some(items) = body.get("tools").and_then(|v| v.as_array()) {
            for tool in items {
                if let Some(declarations) = tool
                    .get("functionDeclarations")
                    .or_else(|| tool.get("function_declarations"))
                    .and_then(|v| v.as_array())
                {
                    for decl in declarations {
                        if let Some(name) = decl.get("name").and_then(|v| v.as_str()) {
                            tools.push(ToolDefinition {
                                name: name.to_string(),
                                description: decl
                                    .get("description")
                                    .and_then(|v| v.as_str())
                                    .map(|s| s.to_string()),
                                parameters: decl.get("parameters").cloned().unwrap_or_else(|| json!({})),
                            });
                        }
                    }
                } else {
                    warnings.push(TransformWarning::new(
                        "dropped_field",
                        "non-function gemini tool is not forwarded",
                    ));
                }
            }
        }

        let tool_choice = body
            .get("toolConfig")
            .or_else(|| body.get("tool_config"))
            .and_then(|tc| tc.get("functionCallingConfig").or_else(|| tc.get("function_calling_config")))
            .and_then(|fcc| {
                let allowed = fcc
                    .get("allowedFunctionNames")
                    .or_else(|| fcc.get("allowed_function_names"))
                    .and_then(|v| v.as_array());
                match fcc.get("mode").and_then(|v| v.as_str())? {
                    "AUTO" => Some(ToolChoice::Auto),
                    "NONE" => Some(ToolChoice::None),
                    "ANY" => match allowed.and_then(|a| a.first()).and_then(|v| v.as_str()) {
                        Some(name) => Some(ToolChoice::Tool(name.to_string())),
                        None => Some(ToolChoice::Required),
                    },
                    _ => None,
                }
            });

        let generation = body
            .get("generationConfig")
            .or_else(|| body.get("generation_config"))
            .cloned()
            .unwrap_or(Value::Null);
        let response_format = match generation
            .get("responseMimeType")
            .and_then(|v| v.as_str())
        {
            Some("application/json") => Some(super::ResponseFormat::Json {
                schema: generation.get("responseSchema").cloned(),
            }),
            _ => None,
        };
        let stop_sequences = generation
            .get("stopSequences")
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
            max_tokens: generation.get("maxOutputTokens").and_then(|v| v.as_u64()),
            temperature: generation.get("temperature").and_then(|v| v.as_f64()),
            top_p: generation.get("topP").and_then(|v| v.as_f64()),
            stop_sequences,
            response_format,
            stream: body.get("stream").and_then(|v| v.as_bool()).unwrap_or(false),
            metadata: None,
            incoming_api_type: ApiType::Gemini,
            original_body: body.clone(),
            request_id: request_id.to_string(),
            warnings,
        })
    }

    fn transform_request(&self, request: &UnifiedRequest, _model: &str) -> (Value, Vec<TransformWarning>) {
        let mut warnings = Vec::new();
        let mut out = Map::new();

        let mut contents = Vec::new();
        for msg in &request.messages {
            let role = match msg.role {
                Role::Assistant => "model",
                _ => "user",
            };
            let parts = part_values(&msg.parts);
            if parts.is_empty() {
                continue;
            }
            contents.push(json!({ "role": role, "parts": parts }));
        }
        out.insert("contents".to_string(), Value::Array(contents));

        if let Some(system) = &request.system {
            out.insert(
                "systemInstruction".to_string(),
                json!({ "parts": [{ "text": system }] }),
            );
        }

        let mut generation = Map::new();
        if let Some(temperature) = request.temperature {
            generation.insert("temperature".to_string(), json!(temperature));
        }
        if let Some(top_p) = request.top_p {
            generation.insert("topP".to_string(), json!(top_p));
        }
        if let Some(max_tokens) = request.max_tokens {
            generation.insert("maxOutputTokens".to_string(), json!(max_tokens));
        }
        if !request.stop_sequences.is_empty() {
            generation.insert("stopSequences".to_string(), json!(request.stop_sequences));
        }
        if let Some(super::ResponseFormat::Json { schema }) = &request.response_format {
            generation.insert("responseMimeType".to_string(), json!("application/json"));
            if let Some(schema) = schema {
                generation.insert("responseSchema".to_string(), schema.clone());
            }
        }
        if !generation.is_empty() {
            out.insert("generationConfig".to_string(), Value::Object(generation));
        }

        if !request.tools.is_empty() {
            let declarations: Vec<Value> = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    })
                })
                .collect();
            out.insert(
                "tools".to_string(),
                json!([{ "functionDeclarations": declarations }]),
            );
        }
        if let Some(choice) = &request.tool_choice {
            let config = match choice {
                ToolChoice::Auto => json!({ "mode": "AUTO" }),
                ToolChoice::None => json!({ "mode": "NONE" }),
                ToolChoice::Required => json!({ "mode": "ANY" }),
                ToolChoice::Tool(name) => json!({ "mode": "ANY", "allowedFunctionNames": [name] }),
            };
            out.insert(
                "toolConfig".to_string(),
                json!({ "functionCallingConfig": config }),
            );
        }
        if request.metadata.is_some() {
            warnings.push(TransformWarning::new(
                "dropped_field",
                "request metadata has no gemini equivalent",
            ));
        }

        (Value::Object(out), warnings)
    }

    fn format_response(&self, response: &UnifiedResponse) -> Value {
        let parts = part_values(&response.parts);
        let finish = response
            .finish_reason
            .as_ref()
            .map(|r| r.as_gemini().to_string())
            .unwrap_or_else(|| "STOP".to_string());
        json!({
            "candidates": [{
                "content": { "role": "model", "parts": parts },
                "finishReason": finish,
                "index": 0,
            }],
            "usageMetadata": {
                "promptTokenCount": response.usage.input,
                "candidatesTokenCount": response.usage.output,
                "thoughtsTokenCount": response.usage.reasoning,
                "cachedContentTokenCount": response.usage.cached,
                "totalTokenCount": response.usage.input + response.usage.output + response.usage.reasoning,
            },
            "modelVersion": response.model,
        })
    }

    fn parse_response(&self, body: &Value, model: &str) -> UnifiedResponse {
        let mut warnings = Vec::new();
        let mut parts = Vec::new();
        let mut finish_reason = None;
        if let Some(candidate) = body
            .get("candidates")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
        {
            parts = parse_parts(
                candidate
                    .get("content")
                    .and_then(|c| c.get("parts"))
                    .unwrap_or(&Value::Null),
                &mut warnings,
            );
            finish_reason = candidate
                .get("finishReason")
                .and_then(|v| v.as_str())
                .map(FinishReason::from_gemini);
        }
        let usage = body
            .get("usageMetadata")
            .map(usage_from_metadata)
            .unwrap_or_default();
        UnifiedResponse {
            id: body
                .get("responseId")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            model: body
                .get("modelVersion")
                .and_then(|v| v.as_str())
                .unwrap_or(model)
                .to_string(),
            parts,
            finish_reason,
            usage: crate::pricing::TokenCounts {
                input: usage.input.unwrap_or(0),
                output: usage.output.unwrap_or(0),
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
        Box::new(GeminiDecoder::default())
    }

    fn stream_encoder(&self, model: &str) -> Box<dyn StreamEncoder> {
        Box::new(GeminiEncoder { model: model.to_string() })
    }

    fn extract_usage(&self, data: &str) -> Option<UsageDelta> {
        let json: Value = serde_json::from_str(data.trim()).ok()?;
        let metadata = json.get("usageMetadata")?;
        let delta = usage_from_metadata(metadata);
        if delta.is_empty() { None } else { Some(delta) }
    }
}

#[derive(Default)]
struct GeminiDecoder {
    started: bool,
    tool_index: usize,
}

impl StreamDecoder for GeminiDecoder {
    fn decode_event(&mut self, data: &str) -> Vec<StreamChunk> {
        let Ok(json) = serde_json::from_str::<Value>(data.trim()) else {
            return Vec::new();
        };
        let mut chunks = Vec::new();
        if !self.started {
            self.started = true;
            chunks.push(StreamChunk::Start {
                id: json
                    .get("responseId")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
                model: json
                    .get("modelVersion")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
            });
        }
        if let Some(candidate) = json
            .get("candidates")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
        {
            if let Some(parts) = candidate
                .get("content")
                .and_then(|c| c.get("parts"))
                .and_then(|p| p.as_array())
            {
                for part in parts {
                    if let Some(text) = part.get("text").and_then(|v| v.as_str()) {
                        if part.get("thought").and_then(|v| v.as_bool()).unwrap_or(false) {
                            chunks.push(StreamChunk::ReasoningDelta { index: 0, text: text.to_string() });
                        } else {
                            chunks.push(StreamChunk::TextDelta { index: 0, text: text.to_string() });
                        }
                    } else if let Some(call) = part.get("functionCall") {
                        let name = call.get("name").and_then(|v| v.as_str()).unwrap_or("tool");
                        let index = self.tool_index;
                        self.tool_index += 1;
                        chunks.push(StreamChunk::ToolCallStart {
                            index,
                            id: name.to_string(),
                            name: name.to_string(),
                        });
                        let args = call.get("args").cloned().unwrap_or_else(|| json!({}));
                        chunks.push(StreamChunk::ToolCallDelta {
                            index,
                            arguments: args.to_string(),
                        });
                    }
                }
            }
            if let Some(reason) = candidate.get("finishReason").and_then(|v| v.as_str()) {
                chunks.push(StreamChunk::Finish { reason: FinishReason::from_gemini(reason) });
            }
        }
        if let Some(metadata) = json.get("usageMetadata") {
            let delta = usage_from_metadata(metadata);
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

struct GeminiEncoder {
    model: String,
}

impl GeminiEncoder {
    fn frame(&self, parts: Vec<Value>, finish: Option<&FinishReason>, usage: Option<&UsageDelta>) -> String {
        let mut candidate = Map::new();
        candidate.insert("content".to_string(), json!({ "role": "model", "parts": parts }));
        candidate.insert("index".to_string(), json!(0));
        if let Some(reason) = finish {
            candidate.insert("finishReason".to_string(), json!(reason.as_gemini()));
        }
        let mut body = Map::new();
        body.insert("candidates".to_string(), json!([Value::Object(candidate)]));
        if let Some(delta) = usage {
            body.insert(
                "usageMetadata".to_string(),
                json!({
                    "promptTokenCount": delta.input.unwrap_or(0),
                    "candidatesTokenCount": delta.output.unwrap_or(0),
                    "thoughtsTokenCount": delta.reasoning.unwrap_or(0),
                    "cachedContentTokenCount": delta.cached.unwrap_or(0),
                    "totalTokenCount": delta.input.unwrap_or(0) + delta.output.unwrap_or(0),
                }),
            );
        }
        body.insert("modelVersion".to_string(), json!(self.model));
        format!("data: {}\n\n", Value::Object(body))
    }
}

impl StreamEncoder for GeminiEncoder {
    fn encode(&mut self, chunk: &StreamChunk) -> Vec<String> {
        match chunk {
            StreamChunk::Start { model, .. } => {
                if !model.is_empty() {
                    self.model = model.clone();
                }
                Vec::new()
            }
            StreamChunk::TextDelta { text, .. } => {
                vec![self.frame(vec![json!({ "text": text })], None, None)]
            }
            StreamChunk::ReasoningDelta { text, .. } => {
                vec![self.frame(vec![json!({ "text": text, "thought": true })], None, None)]
            }
            StreamChunk::ToolCallStart { .. } => Vec::new(),
            StreamChunk::ToolCallDelta { arguments, .. } => {
                let args: Value = serde_json::from_str(arguments).unwrap_or_else(|_| json!({}));
                vec![self.frame(
                    vec![json!({ "functionCall": { "name": "tool", "args": args } })],
                    None,
                    None,
                )]
            }
            StreamChunk::Usage(delta) => vec![self.frame(Vec::new(), None, Some(delta))],
            StreamChunk::Finish { reason } => vec![self.frame(Vec::new(), Some(reason), None)],
            StreamChunk::Done => Vec::new(),
        }
    }

    fn finish(&mut self) -> Vec<String> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_generate_content_request() {
        let body = json!({
            "model": "gemini-pro",
            "contents": [
                { "role": "user", "parts": [{ "text": "Hello" }] }
            ],
            "systemInstruction": { "parts": [{ "text": "be kind" }] },
            "generationConfig": { "temperature": 0.5, "maxOutputTokens": 100 }
        });
        let req = GeminiTransformer.parse_request(&body, "r1").unwrap();
        assert_eq!(req.system.as_deref(), Some("be kind"));
        assert_eq!(req.max_tokens, Some(100));
        assert_eq!(req.temperature, Some(0.5));
        assert_eq!(req.messages[0].plain_text(), "Hello");
    }

    #[test]
    fn function_call_round_trip() {
        let body = json!({
            "model": "gemini-pro",
            "contents": [
                { "role": "model", "parts": [
                    { "functionCall": { "name": "lookup", "args": { "q": "x" } } }
                ]},
                { "role": "user", "parts": [
                    { "functionResponse": { "name": "lookup", "response": { "result": "found" } } }
                ]}
            ]
        });
        let req = GeminiTransformer.parse_request(&body, "r1").unwrap();
        assert!(matches!(req.messages[0].parts[0], ContentPart::ToolUse { .. }));
        assert!(matches!(req.messages[1].parts[0], ContentPart::ToolResult { .. }));

        let (out, _) = GeminiTransformer.transform_request(&req, "gemini-pro");
        assert_eq!(out["contents"][0]["parts"][0]["functionCall"]["name"], "lookup");
        assert_eq!(out["contents"][1]["parts"][0]["functionResponse"]["name"], "lookup");
    }

    #[test]
    fn extract_usage_from_metadata() {
        let data = r#"{"usageMetadata":{"promptTokenCount":11,"candidatesTokenCount":22,"cachedContentTokenCount":3}}"#;
        let usage = GeminiTransformer.extract_usage(data).unwrap();
        assert_eq!(usage.input, Some(11));
        assert_eq!(usage.output, Some(22));
        assert_eq!(usage.cached, Some(3));
    }

    #[test]
    fn decoder_reads_candidate_deltas() {
        let mut decoder = GeminiDecoder::default();
        let chunks = decoder.decode_event(
            r#"{"candidates":[{"content":{"parts":[{"text":"hi"}]},"finishReason":"STOP"}],
                "usageMetadata":{"promptTokenCount":4,"candidatesTokenCount":2}}"#,
        );
        assert!(matches!(chunks[0], StreamChunk::Start { .. }));
        assert!(matches!(&chunks[1], StreamChunk::TextDelta { text, .. } if text == "hi"));
        assert!(matches!(chunks[2], StreamChunk::Finish { reason: FinishReason::Stop }));
        assert!(matches!(chunks[3], StreamChunk::Usage(_)));
    }

    #[test]
    fn encoder_produces_candidate_frames() {
        let mut encoder = GeminiEncoder { model: "gemini-pro".to_string() };
        let frames = encoder.encode(&StreamChunk::TextDelta { index: 0, text: "yo".to_string() });
        assert!(frames[0].starts_with("data: "));
        assert!(frames[0].contains("\"text\":\"yo\""));
        assert!(frames[0].ends_with("\n\n"));
    }
}
