//! Response pipeline.
//!
//! Owns everything between the provider's reply and the client: stream taps
//! into the debug capture, dialect re-encoding when the client and provider
//! speak different dialects, usage inspection, and the single persistence
//! point when the response completes (or the client disconnects).

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use axum::body::{Body, Bytes};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;

use super::client::{drain_sse_events, event_data};
use super::usage::{InspectionResult, UsageInspector};
use crate::config::QuotaConfig;
use crate::db::UsageRecord;
use crate::pricing::{self, OpenRouterRates, Pricing};
use crate::transform::{self, StreamDecoder, StreamEncoder, UnifiedRequest, UnifiedResponse};

/// Tap sinks drop chunks instead of blocking once this many are queued.
const TAP_BUFFER: usize = 256;

/// Everything the completion path needs, bundled so it can run from either
/// the end-of-stream finalizer or the disconnect guard.
pub struct CompletionParams {
    pub record: UsageRecord,
    pub pricing: Option<Pricing>,
    pub provider_discount: Option<f64>,
    pub openrouter: BTreeMap<String, OpenRouterRates>,
    pub quota: Option<(String, QuotaConfig)>,
    pub estimate_tokens: bool,
}

/// Apply an inspection and cost calculation to the record. Pure with respect
/// to the stores; `finalize_usage` persists the result.
fn apply_completion(
    params: &mut CompletionParams,
    inspection: Option<InspectionResult>,
    success: bool,
) -> crate::pricing::TokenCounts {
    if let Some(result) = inspection {
        params.record.tokens_input = result.tokens.input;
        params.record.tokens_output = result.tokens.output;
        params.record.tokens_reasoning = result.tokens.reasoning;
        params.record.tokens_cached = result.tokens.cached;
        params.record.tokens_cache_write = result.tokens.cache_write;
        params.record.ttft_ms = result.ttft_ms;
        params.record.duration_ms = Some(result.duration_ms);
        params.record.tokens_per_sec = result.tokens_per_sec;
        params.record.tokens_estimated = result.tokens_estimated;
        if params.record.finish_reason.is_none() {
            params.record.finish_reason = result.finish_reason;
        }
    }

    let tokens = crate::pricing::TokenCounts {
        input: params.record.tokens_input,
        output: params.record.tokens_output,
        reasoning: params.record.tokens_reasoning,
        cached: params.record.tokens_cached,
        cache_write: params.record.tokens_cache_write,
    };
    let cost = pricing::calculate(
        &tokens,
        params.pricing.as_ref(),
        params.provider_discount,
        &params.openrouter,
    );
    params.record.cost_input = cost.input;
    params.record.cost_output = cost.output;
    params.record.cost_cached = cost.cached;
    params.record.cost_cache_write = cost.cache_write;
    params.record.cost_total = cost.total;
    params.record.cost_source = cost.source;
    params.record.cost_metadata = Some(cost.metadata.to_string());

    if success {
        params.record.response_status = "success".to_string();
    } else if !params.record.response_status.starts_with("HTTP") {
        params.record.response_status = "error".to_string();
    }
    tokens
}

fn finalize_usage(mut params: CompletionParams, inspection: Option<InspectionResult>, success: bool) {
    let tokens = apply_completion(&mut params, inspection, success);

    crate::db::save_request(&params.record);

    if success {
        if let (Some(provider), Some(model)) =
            (params.record.provider.clone(), params.record.selected_model_name.clone())
        {
            crate::perf::global().record(crate::perf::PerformanceSample {
                provider,
                model,
                canonical_model: params.record.canonical_model_name.clone(),
                request_id: params.record.request_id.clone(),
                ttft_ms: params.record.ttft_ms,
                total_tokens: Some(params.record.tokens_output),
                duration_ms: params.record.duration_ms.unwrap_or(0),
                tokens_per_sec: params.record.tokens_per_sec,
                created_at: chrono::Utc::now().timestamp(),
            });
        }
        if let Some((key_name, quota)) = &params.quota {
            crate::quota::global().record(key_name, quota, &tokens);
        }
    }

    crate::debug_capture::global().flush(&params.record.request_id);
}

/// Runs the completion path exactly once: from the end-of-stream finalizer
/// on normal completion, or from Drop when the client disconnects mid-stream.
struct StreamFinalizer {
    pending: Mutex<Option<CompletionParams>>,
    inspector: Mutex<Option<UsageInspector>>,
}

impl StreamFinalizer {
    fn new(params: CompletionParams, inspector: UsageInspector) -> Self {
        Self {
            pending: Mutex::new(Some(params)),
            inspector: Mutex::new(Some(inspector)),
        }
    }

    fn observe(&self, bytes: &[u8]) {
        if let Ok(mut guard) = self.inspector.lock() {
            if let Some(inspector) = guard.as_mut() {
                inspector.observe(bytes);
            }
        }
    }

    fn complete(&self, success: bool) {
        let Some(params) = self.pending.lock().ok().and_then(|mut p| p.take()) else {
            return;
        };
        let inspector = self.inspector.lock().ok().and_then(|mut i| i.take());
        let inspection = inspector.map(|inspector| {
            let estimation_body = if params.estimate_tokens && !inspector.saw_usage() {
                crate::debug_capture::global().transformed_snapshot(&params.record.request_id)
            } else {
                None
            };
            inspector.finalize_at(chrono::Utc::now().timestamp_millis(), estimation_body.as_deref())
        });
        finalize_usage(params, inspection, success);
    }
}

impl Drop for StreamFinalizer {
    fn drop(&mut self) {
        // Client disconnect: the stream was dropped before the finalizer ran.
        let Some(params) = self.pending.lock().ok().and_then(|mut p| p.take()) else {
            return;
        };
        crate::logger::warn(
            "pipeline",
            &format!("{}: stream cancelled before completion", params.record.request_id),
        );
        let inspector = self.inspector.lock().ok().and_then(|mut i| i.take());
        let inspection =
            inspector.map(|i| i.finalize_at(chrono::Utc::now().timestamp_millis(), None));
        finalize_usage(params, inspection, false);
    }
}

/// Bounded tap: forwards chunks to the debug capture without back-pressuring
/// the client stream. Overflow drops the chunk with a warning.
fn spawn_tap(request_id: &str, raw_side: bool) -> tokio::sync::mpsc::Sender<Bytes> {
    let (tx, mut rx) = tokio::sync::mpsc::channel::<Bytes>(TAP_BUFFER);
    let request_id = request_id.to_string();
    tokio::spawn(async move {
        while let Some(chunk) = rx.recv().await {
            let text = String::from_utf8_lossy(&chunk);
            if raw_side {
                crate::debug_capture::global().add_raw_response_chunk(&request_id, &text);
            } else {
                crate::debug_capture::global().add_transformed_response_chunk(&request_id, &text);
            }
        }
    });
    tx
}

fn tap_send(tap: &tokio::sync::mpsc::Sender<Bytes>, request_id: &str, chunk: Bytes) {
    if tap.try_send(chunk).is_err() {
        crate::logger::warn(
            "pipeline",
            &format!("{}: tap sink full, dropping chunk", request_id),
        );
    }
}

/// Stream the provider reply to the client, re-encoding between dialects
/// unless the dispatch ran pass-through.
pub fn streaming_response(
    provider_response: reqwest::Response,
    request: &UnifiedRequest,
    meta: &UnifiedResponse,
    params: CompletionParams,
) -> Response {
    let request_id = request.request_id.clone();
    let bypass = meta.bypass_transformation;
    let incoming_api = request.incoming_api_type;
    let provider_api = meta.plexus.api_type.unwrap_or(incoming_api);

    // Pass-through observes the provider's own dialect; transformed flows
    // observe the re-encoded client dialect. Either way the inspector sees
    // the bytes the client dialect's extractor understands.
    let inspector = UsageInspector::new(incoming_api, params.record.start_time);
    let finalizer = Arc::new(StreamFinalizer::new(params, inspector));

    let raw_tap = spawn_tap(&request_id, true);
    let transformed_tap = spawn_tap(&request_id, false);

    let decoder: Arc<Mutex<Box<dyn StreamDecoder>>> =
        Arc::new(Mutex::new(transform::get(provider_api).stream_decoder()));
    let encoder: Arc<Mutex<Box<dyn StreamEncoder>>> = Arc::new(Mutex::new(
        transform::get(incoming_api).stream_encoder(&request.model),
    ));
    let sse_buffer = Arc::new(Mutex::new(Vec::<u8>::new()));

    let chunk_finalizer = Arc::clone(&finalizer);
    let chunk_request_id = request_id.clone();
    let chunk_decoder = Arc::clone(&decoder);
    let chunk_encoder = Arc::clone(&encoder);
    let chunk_buffer = Arc::clone(&sse_buffer);
    let chunk_raw_tap = raw_tap.clone();
    let chunk_transformed_tap = transformed_tap.clone();

    let body_stream = provider_response
        .bytes_stream()
        .then(move |result| {
            let finalizer = Arc::clone(&chunk_finalizer);
            let request_id = chunk_request_id.clone();
            let decoder = Arc::clone(&chunk_decoder);
            let encoder = Arc::clone(&chunk_encoder);
            let buffer = Arc::clone(&chunk_buffer);
            let raw_tap = chunk_raw_tap.clone();
            let transformed_tap = chunk_transformed_tap.clone();
            async move {
                let mut out: Vec<Result<Bytes, std::io::Error>> = Vec::new();
                match result {
                    Ok(bytes) => {
                        tap_send(&raw_tap, &request_id, bytes.clone());
                        if bypass {
                            finalizer.observe(&bytes);
                            tap_send(&transformed_tap, &request_id, bytes.clone());
                            out.push(Ok(bytes));
                        } else {
                            let events = {
                                let mut buffer = buffer.lock().unwrap();
                                drain_sse_events(&mut buffer, &bytes)
                            };
                            let mut frames = String::new();
                            for event in events {
                                let Some(data) = event_data(&event) else { continue };
                                let chunks = decoder.lock().unwrap().decode_event(&data);
                                let mut encoder = encoder.lock().unwrap();
                                for chunk in &chunks {
                                    for frame in encoder.encode(chunk) {
                                        frames.push_str(&frame);
                                    }
                                }
                            }
                            if !frames.is_empty() {
                                let encoded = Bytes::from(frames);
                                tap_send(&transformed_tap, &request_id, encoded.clone());
                                finalizer.observe(&encoded);
                                out.push(Ok(encoded));
                            }
                        }
                    }
                    Err(e) => {
                        crate::logger::error(
                            "pipeline",
                            &format!("{}: provider stream error: {}", request_id, e),
                        );
                        out.push(Err(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())));
                    }
                }
                out
            }
        })
        .flat_map(futures_util::stream::iter);

    // End of provider stream: close the codec pair, emit trailing frames,
    // and run the completion path. The finalizer's Drop covers disconnects.
    let end_finalizer = Arc::clone(&finalizer);
    let end_request_id = request_id.clone();
    let tail = futures_util::stream::once(async move {
        let mut frames = String::new();
        if !bypass {
            let trailing = decoder.lock().unwrap().finish();
            let mut encoder = encoder.lock().unwrap();
            for chunk in &trailing {
                for frame in encoder.encode(chunk) {
                    frames.push_str(&frame);
                }
            }
            for frame in encoder.finish() {
                frames.push_str(&frame);
            }
        }
        if !frames.is_empty() {
            let encoded = Bytes::from(frames.clone());
            tap_send(&transformed_tap, &end_request_id, encoded.clone());
            end_finalizer.observe(&encoded);
        }
        end_finalizer.complete(true);
        if frames.is_empty() {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "stream_end"))
        } else {
            Ok(Bytes::from(frames))
        }
    });

    let stream = body_stream.chain(tail).filter_map(|result| async move {
        match result {
            Ok(bytes) => Some(Ok::<Bytes, std::io::Error>(bytes)),
            Err(e) if e.to_string() == "stream_end" => None,
            Err(e) => Some(Err(e)),
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|e| {
            crate::logger::error("pipeline", &format!("failed to build response: {}", e));
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        })
}

/// Serialize a unary reply in the client's dialect, record usage, respond.
pub fn unary_response(
    request: &UnifiedRequest,
    unified: &UnifiedResponse,
    mut params: CompletionParams,
) -> Response {
    let body = if unified.bypass_transformation {
        unified
            .raw_response
            .clone()
            .unwrap_or_else(|| transform::get(request.incoming_api_type).format_response(unified))
    } else {
        transform::get(request.incoming_api_type).format_response(unified)
    };

    if let Some(raw) = &unified.raw_response {
        crate::debug_capture::global().add_raw_response(&request.request_id, &raw.to_string());
    }
    crate::debug_capture::global().add_transformed_response(&request.request_id, &body.to_string());

    let now = chrono::Utc::now().timestamp_millis();
    let duration = (now - params.record.start_time).max(0);
    params.record.finish_reason = unified
        .finish_reason
        .as_ref()
        .map(|r| r.as_openai().to_string());
    params.record.tool_calls_count = Some(
        unified
            .parts
            .iter()
            .filter(|p| matches!(p, transform::ContentPart::ToolUse { .. }))
            .count() as i64,
    );
    let inspection = InspectionResult {
        tokens: unified.usage,
        ttft_ms: Some(duration),
        duration_ms: duration,
        tokens_per_sec: None,
        tokens_estimated: false,
        finish_reason: params.record.finish_reason.clone(),
    };
    finalize_usage(params, Some(inspection), true);

    axum::Json(body).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params_with(pricing: Option<Pricing>) -> CompletionParams {
        let mut record = UsageRecord::new("req-final", "chat");
        record.provider = Some("p".to_string());
        CompletionParams {
            record,
            pricing,
            provider_discount: None,
            openrouter: BTreeMap::new(),
            quota: None,
            estimate_tokens: false,
        }
    }

    fn inspection() -> InspectionResult {
        InspectionResult {
            tokens: crate::pricing::TokenCounts {
                input: 2000,
                output: 500,
                cached: 200,
                ..Default::default()
            },
            ttft_ms: Some(10),
            duration_ms: 100,
            tokens_per_sec: Some(5000.0),
            tokens_estimated: false,
            finish_reason: Some("stop".to_string()),
        }
    }

    #[test]
    fn completion_applies_cost_and_status() {
        let mut params = params_with(Some(Pricing::Simple { input: 3.0, output: 15.0, cached: 0.3 }));
        apply_completion(&mut params, Some(inspection()), true);
        let record = &params.record;
        assert!((record.cost_input - 0.006).abs() < 1e-9);
        assert!((record.cost_output - 0.0075).abs() < 1e-9);
        assert!((record.cost_cached - 0.00006).abs() < 1e-9);
        assert!((record.cost_total - 0.01356).abs() < 1e-8);
        assert_eq!(record.response_status, "success");
        assert_eq!(record.finish_reason.as_deref(), Some("stop"));
        assert_eq!(record.duration_ms, Some(100));
    }

    #[test]
    fn cancelled_completion_keeps_http_status() {
        let mut params = params_with(None);
        params.record.response_status = "HTTP 502".to_string();
        apply_completion(&mut params, None, false);
        assert_eq!(params.record.response_status, "HTTP 502");

        let mut params = params_with(None);
        apply_completion(&mut params, None, false);
        assert_eq!(params.record.response_status, "error");
        assert_eq!(params.record.cost_source, "default");
        assert_eq!(params.record.cost_total, 0.0);
    }
}
