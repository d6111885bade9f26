//! HTTP surface.
//!
//! Inference endpoints for the four dialects plus the operator API. Inbound
//! auth resolves a secret to a key name; the name is what gets logged and
//! quota-checked. Errors are rendered in the caller's own dialect.

use axum::{
    extract::{Path, Query},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use tower_http::cors::CorsLayer;

use crate::config::{self, ApiKeyConfig, QuotaConfig, Settings};
use crate::db::{self, UsageRecord};
use crate::dispatch::client::ProviderError;
use crate::dispatch::pipeline::{self, CompletionParams};
use crate::dispatch::{self, DispatchContext, DispatchError, ProviderReply};
use crate::error::AppError;
use crate::quota::QuotaDecision;
use crate::router::RouteError;
use crate::transform::{self, ApiType, TransformError};
use crate::{cooldown, debug_capture, logger, perf, quota};

// ============================================================================
// Dialect error bodies
// ============================================================================

fn anthropic_error_type(status: u16) -> &'static str {
    match status {
        401 => "authentication_error",
        429 => "rate_limit_error",
        400 => "invalid_request_error",
        404 => "not_found_error",
        _ => "api_error",
    }
}

fn gemini_status_name(status: u16) -> &'static str {
    match status {
        400 => "INVALID_ARGUMENT",
        401 | 403 => "PERMISSION_DENIED",
        404 => "NOT_FOUND",
        429 => "RESOURCE_EXHAUSTED",
        503 => "UNAVAILABLE",
        504 => "DEADLINE_EXCEEDED",
        _ => "INTERNAL",
    }
}

fn error_body(api: ApiType, status: u16, kind: &str, message: &str) -> Value {
    match api {
        ApiType::Chat | ApiType::Responses => json!({
            "error": { "message": message, "type": kind }
        }),
        ApiType::Messages => json!({
            "type": "error",
            "error": { "type": anthropic_error_type(status), "message": message }
        }),
        ApiType::Gemini => json!({
            "error": { "code": status, "message": message, "status": gemini_status_name(status) }
        }),
    }
}

fn error_response(api: ApiType, status: u16, kind: &str, message: &str) -> Response {
    logger::error(
        "server",
        &format!("returning {}: {} ({})", status, message, kind),
    );
    let code = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (code, Json(error_body(api, status, kind, message))).into_response()
}

fn quota_denied_response(api: ApiType, decision: &QuotaDecision) -> Response {
    let status = StatusCode::TOO_MANY_REQUESTS;
    let mut body = error_body(
        api,
        429,
        "quota_exceeded",
        &format!(
            "Quota exceeded: {:.0}/{:.0} {} used",
            decision.current_usage,
            decision.limit,
            decision.limit_type.as_str()
        ),
    );
    if let Some(error) = body.get_mut("error").and_then(|e| e.as_object_mut()) {
        error.insert("remaining".to_string(), json!(decision.remaining));
        error.insert("resets_at".to_string(), json!(decision.resets_at));
        error.insert("retry_after".to_string(), json!(decision.retry_after_secs));
    }
    let mut response = (status, Json(body)).into_response();
    let headers = response.headers_mut();
    if let Ok(v) = format!("{:.0}", decision.remaining).parse() {
        headers.insert("x-ratelimit-remaining", v);
    }
    if let Some(resets_at) = decision.resets_at {
        if let Ok(v) = resets_at.to_string().parse() {
            headers.insert("x-ratelimit-reset", v);
        }
    }
    if let Some(retry) = decision.retry_after_secs {
        if let Ok(v) = retry.to_string().parse() {
            headers.insert("retry-after", v);
        }
    }
    response
}

fn route_error_response(api: ApiType, error: &RouteError) -> Response {
    let (status, kind) = match error {
        RouteError::AliasNotFound(_) => (404, "model_not_found"),
        RouteError::NoEnabledTargets(_) => (404, "model_not_found"),
        RouteError::AllProvidersOnCooldown { .. } => (503, "all_providers_cooling_down"),
        RouteError::ProviderNotFound(_) => (404, "provider_not_found"),
        RouteError::DirectRoutingInvalid(_) => (400, "invalid_request_error"),
    };
    error_response(api, status, kind, &error.to_string())
}

fn provider_error_response(api: ApiType, error: &ProviderError, detail: &str) -> Response {
    let (status, kind) = match error {
        ProviderError::InvalidRequest { .. } => (400, "invalid_request_error"),
        ProviderError::Authentication { .. } => (502, "upstream_auth_error"),
        ProviderError::RateLimit { .. } => (429, "rate_limit_error"),
        ProviderError::Timeout(_) => (504, "timeout_error"),
        ProviderError::ServerError { .. } => (502, "upstream_error"),
        ProviderError::ConnectionError(_) => (502, "connection_error"),
        ProviderError::Internal(_) => (500, "internal_error"),
    };
    error_response(api, status, kind, detail)
}

// ============================================================================
// Inbound auth
// ============================================================================

fn bearer_or_api_key(headers: &HeaderMap) -> Option<String> {
    if let Some(token) = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|raw| raw.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        return Some(token.to_string());
    }
    for header in ["x-api-key", "x-goog-api-key"] {
        if let Some(token) = headers
            .get(header)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            return Some(token.to_string());
        }
    }
    None
}

struct KeyAuth {
    name: String,
    config: ApiKeyConfig,
}

/// Resolve the caller's secret to a configured key name. With no keys
/// configured the gateway is open and callers stay anonymous.
fn authenticate(settings: &Settings, headers: &HeaderMap) -> Result<Option<KeyAuth>, ()> {
    if settings.keys.is_empty() {
        return Ok(None);
    }
    let Some(secret) = bearer_or_api_key(headers) else {
        return Err(());
    };
    settings
        .keys
        .iter()
        .find(|(_, key)| !key.secret.is_empty() && key.secret == secret)
        .map(|(name, key)| {
            Some(KeyAuth {
                name: name.clone(),
                config: key.clone(),
            })
        })
        .ok_or(())
}

// ============================================================================
// Inference handling
// ============================================================================

fn source_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|raw| raw.split(',').next())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn quota_of(auth: &Option<KeyAuth>) -> Option<(String, QuotaConfig)> {
    auth.as_ref().and_then(|auth| {
        auth.config
            .quota
            .clone()
            .map(|quota| (auth.name.clone(), quota))
    })
}

async fn handle_inference(api: ApiType, headers: HeaderMap, mut body: Value) -> Response {
    let settings = config::snapshot();

    let auth = match authenticate(&settings, &headers) {
        Ok(auth) => auth,
        Err(()) => {
            return error_response(api, 401, "authentication_error", "Invalid or missing API key")
        }
    };

    let request_id = uuid::Uuid::new_v4().to_string();
    let mut record = UsageRecord::new(&request_id, api.as_str());
    record.source_ip = source_ip(&headers);
    record.api_key = auth.as_ref().map(|a| a.name.clone());
    record.attribution = auth.as_ref().and_then(|a| a.config.attribution.clone());

    // Quota denial happens before any routing or provider contact.
    let quota = quota_of(&auth);
    if let Some((key_name, quota_config)) = &quota {
        let decision = quota::global().check(key_name, quota_config);
        if !decision.allowed {
            record.response_status = "HTTP 429".to_string();
            db::save_request(&record);
            return quota_denied_response(api, &decision);
        }
    }

    // The responses dialect can chain onto a stored response.
    if api == ApiType::Responses {
        resolve_previous_response(&mut body);
    }

    let transformer = transform::get(api);
    let request = match transformer.parse_request(&body, &request_id) {
        Ok(request) => request,
        Err(TransformError::InvalidRequest(message)) => {
            record.response_status = "HTTP 400".to_string();
            db::save_request(&record);
            return error_response(api, 400, "invalid_request_error", &message);
        }
    };
    for warning in &request.warnings {
        logger::warn(
            "transform",
            &format!("{}: {} ({})", request_id, warning.message, warning.kind),
        );
    }

    let capture = settings.debug.capture;
    let ephemeral = !capture && settings.debug.estimate_tokens && request.stream;
    if capture || ephemeral {
        debug_capture::global().start_log(&request_id, &body.to_string(), ephemeral);
    }

    let ctx = DispatchContext {
        settings: &settings,
        cooldowns: cooldown::global(),
        perf: perf::global(),
    };

    match dispatch::dispatch(&ctx, &request, &mut record).await {
        Ok(ProviderReply::Unary(unified)) => {
            let params = CompletionParams {
                pricing: unified.plexus.pricing.clone(),
                provider_discount: unified.plexus.provider_discount,
                openrouter: settings.openrouter_pricing.clone(),
                quota,
                estimate_tokens: settings.debug.estimate_tokens,
                record,
            };
            let response = pipeline::unary_response(&request, &unified, params);
            if api == ApiType::Responses {
                store_response_if_requested(&request.original_body, &unified);
            }
            response
        }
        Ok(ProviderReply::Stream { response, meta }) => {
            let params = CompletionParams {
                pricing: meta.plexus.pricing.clone(),
                provider_discount: meta.plexus.provider_discount,
                openrouter: settings.openrouter_pricing.clone(),
                quota,
                estimate_tokens: settings.debug.estimate_tokens,
                record,
            };
            pipeline::streaming_response(response, &request, &meta, params)
        }
        Err(DispatchError::Route(error)) => {
            record.response_status = match &error {
                RouteError::AllProvidersOnCooldown { .. } => "HTTP 503".to_string(),
                RouteError::DirectRoutingInvalid(_) => "HTTP 400".to_string(),
                _ => "HTTP 404".to_string(),
            };
            db::save_request(&record);
            debug_capture::global().flush(&request_id);
            route_error_response(api, &error)
        }
        Err(DispatchError::Provider { error, routing }) => {
            let status = error.status_code().unwrap_or(502);
            record.response_status = format!("HTTP {}", status);
            db::save_request(&record);
            db::save_error(
                &request_id,
                &error.to_string(),
                Some(&format!(
                    "attempts={} providers={}",
                    routing.attempts,
                    routing.attempted_providers.join(",")
                )),
            );
            debug_capture::global().flush(&request_id);
            provider_error_response(
                api,
                &error,
                &format!(
                    "{} (attempted: {})",
                    error,
                    routing.attempted_providers.join(", ")
                ),
            )
        }
    }
}

/// Splice the stored output items of `previous_response_id` in front of the
/// request input, when the prior call was stored.
fn resolve_previous_response(body: &mut Value) {
    let Some(previous_id) = body
        .get("previous_response_id")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
    else {
        return;
    };
    let items = db::get_response_items(&previous_id);
    if items.is_empty() {
        return;
    }
    let Some(obj) = body.as_object_mut() else { return };
    let existing = match obj.get("input") {
        Some(Value::Array(current)) => current.clone(),
        Some(Value::String(text)) => vec![json!({
            "type": "message", "role": "user",
            "content": [{ "type": "input_text", "text": text }]
        })],
        _ => Vec::new(),
    };
    let mut combined = items;
    combined.extend(existing);
    obj.insert("input".to_string(), Value::Array(combined));
    obj.remove("previous_response_id");
}

fn store_response_if_requested(original_body: &Value, unified: &transform::UnifiedResponse) {
    let store = original_body
        .get("store")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    if !store {
        return;
    }
    let body = transform::get(ApiType::Responses).format_response(unified);
    let Some(id) = body.get("id").and_then(|v| v.as_str()) else { return };
    let items: Vec<Value> = body
        .get("output")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    let conversation_id = original_body.get("conversation").and_then(|v| v.as_str());
    db::save_response(id, conversation_id, &unified.model, &body.to_string(), &items);
}

// ============================================================================
// Inference endpoints
// ============================================================================

async fn chat_completions(headers: HeaderMap, Json(payload): Json<Value>) -> Response {
    handle_inference(ApiType::Chat, headers, payload).await
}

async fn messages_endpoint(headers: HeaderMap, Json(payload): Json<Value>) -> Response {
    handle_inference(ApiType::Messages, headers, payload).await
}

async fn responses_endpoint(headers: HeaderMap, Json(payload): Json<Value>) -> Response {
    handle_inference(ApiType::Responses, headers, payload).await
}

/// Gemini routes carry the model and action in the path:
/// `/v1beta/models/{model}:generateContent`.
async fn gemini_endpoint(
    Path(model_action): Path<String>,
    headers: HeaderMap,
    Json(mut payload): Json<Value>,
) -> Response {
    let Some((model, action)) = model_action.split_once(':') else {
        return error_response(
            ApiType::Gemini,
            400,
            "invalid_request_error",
            "expected '{model}:generateContent' or '{model}:streamGenerateContent'",
        );
    };
    let stream = action.starts_with("streamGenerateContent");
    if !stream && action != "generateContent" {
        return error_response(
            ApiType::Gemini,
            404,
            "not_found",
            &format!("unsupported action '{}'", action),
        );
    }
    if let Some(obj) = payload.as_object_mut() {
        obj.insert("model".to_string(), json!(model));
        obj.insert("stream".to_string(), json!(stream));
    }
    handle_inference(ApiType::Gemini, headers, payload).await
}

async fn list_models(headers: HeaderMap) -> Response {
    let settings = config::snapshot();
    if authenticate(&settings, &headers).is_err() {
        return error_response(ApiType::Chat, 401, "authentication_error", "Invalid or missing API key");
    }
    let mut data = Vec::new();
    for (name, alias) in &settings.models {
        let owned_by = alias
            .targets
            .first()
            .map(|t| t.provider.clone())
            .unwrap_or_else(|| "plexus".to_string());
        data.push(json!({
            "id": name,
            "object": "model",
            "created": 1700000000,
            "owned_by": owned_by,
        }));
        for extra in &alias.additional_aliases {
            data.push(json!({
                "id": extra,
                "object": "model",
                "created": 1700000000,
                "owned_by": owned_by,
            }));
        }
    }
    Json(json!({ "object": "list", "data": data })).into_response()
}

// ============================================================================
// Operator API
// ============================================================================

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

#[derive(Deserialize)]
struct SummaryQuery {
    days: Option<i64>,
}

async fn stats_summary(Query(q): Query<SummaryQuery>) -> Json<Value> {
    let days = q.days.unwrap_or(1);
    let (requests, tokens, cost) = db::summary_since(days);
    Json(json!({
        "days": days,
        "requests": requests,
        "tokens": tokens,
        "cost_usd": cost,
    }))
}

async fn stats_models(Query(q): Query<SummaryQuery>) -> Json<Value> {
    let days = q.days.unwrap_or(30);
    Json(json!({ "models": db::models_cost_since(days) }))
}

#[derive(Deserialize)]
struct UsageQuery {
    provider: Option<String>,
    alias: Option<String>,
    model: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

async fn list_usage(Query(q): Query<UsageQuery>) -> Json<Value> {
    let filters = db::UsageFilters {
        provider: q.provider,
        alias: q.alias,
        model: q.model,
    };
    let rows = db::get_usage(&filters, q.limit.unwrap_or(50), q.offset.unwrap_or(0));
    Json(json!({ "usage": rows }))
}

async fn get_usage_record(Path(request_id): Path<String>) -> Result<Json<Value>, AppError> {
    db::get_usage_by_id(&request_id)
        .map(|record| Json(json!(record)))
        .ok_or_else(|| AppError::NotFound(format!("usage record '{}' not found", request_id)))
}

async fn list_cooldowns() -> Json<Value> {
    Json(json!({ "cooldowns": cooldown::global().active() }))
}

#[derive(Deserialize)]
struct ClearCooldownsRequest {
    provider: Option<String>,
}

async fn clear_cooldowns(Json(req): Json<ClearCooldownsRequest>) -> Json<Value> {
    let removed = cooldown::global().clear(req.provider.as_deref());
    Json(json!({ "cleared": removed }))
}

async fn performance_window(Path((provider, model)): Path<(String, String)>) -> Json<Value> {
    let perf = perf::global();
    Json(json!({
        "provider": provider,
        "model": model,
        "samples": perf.sample_count(&provider, &model),
        "mean_duration_ms": perf.mean(&provider, &model, crate::perf::Metric::DurationMs),
        "p95_duration_ms": perf.percentile(&provider, &model, crate::perf::Metric::DurationMs, 95.0),
        "mean_ttft_ms": perf.mean(&provider, &model, crate::perf::Metric::TtftMs),
        "mean_tokens_per_sec": perf.mean(&provider, &model, crate::perf::Metric::TokensPerSec),
    }))
}

async fn get_config() -> Json<Value> {
    let settings = config::snapshot();
    // Secrets are not echoed back.
    let mut value = serde_json::to_value(settings.as_ref().clone()).unwrap_or(json!({}));
    if let Some(keys) = value.get_mut("keys").and_then(|k| k.as_object_mut()) {
        for (_, key) in keys.iter_mut() {
            if let Some(obj) = key.as_object_mut() {
                obj.insert("secret".to_string(), json!("***"));
            }
        }
    }
    Json(value)
}

async fn put_config(Json(payload): Json<Value>) -> Result<Json<Value>, AppError> {
    let settings: Settings = serde_json::from_value(payload)
        .map_err(|e| AppError::BadRequest(format!("invalid settings: {}", e)))?;
    config::install(settings.clone()).map_err(AppError::BadRequest)?;
    if let Err(e) = config::save(&settings) {
        logger::error("config", &format!("failed to persist settings: {}", e));
    }
    logger::info("config", "settings snapshot swapped");
    Ok(Json(json!({ "ok": true })))
}

async fn get_debug_log(Path(request_id): Path<String>) -> Result<Json<Value>, AppError> {
    db::get_debug_log(&request_id)
        .map(|log| Json(json!(log)))
        .ok_or_else(|| AppError::NotFound(format!("debug log '{}' not found", request_id)))
}

async fn delete_debug_log(Path(request_id): Path<String>) -> Result<StatusCode, AppError> {
    if debug_capture::global().delete(&request_id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound(format!("debug log '{}' not found", request_id)))
    }
}

async fn get_logs(Query(q): Query<logger::LogQuery>) -> Json<Value> {
    Json(json!({ "logs": logger::list(&q) }))
}

#[derive(Deserialize)]
struct PruneLogsQuery {
    before_time: i64,
}

async fn prune_logs(Query(q): Query<PruneLogsQuery>) -> Json<Value> {
    Json(json!({ "deleted": logger::prune(q.before_time) }))
}

pub fn app() -> Router {
    Router::new()
        // Inference endpoints
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/messages", post(messages_endpoint))
        .route("/v1/responses", post(responses_endpoint))
        .route("/v1beta/models/:model_action", post(gemini_endpoint))
        .route("/v1/models", get(list_models))
        // Health
        .route("/health", get(health))
        // Operator API
        .route("/api/stats/summary", get(stats_summary))
        .route("/api/stats/models", get(stats_models))
        .route("/api/usage", get(list_usage))
        .route("/api/usage/:request_id", get(get_usage_record))
        .route("/api/cooldowns", get(list_cooldowns))
        .route("/api/cooldowns/clear", post(clear_cooldowns))
        .route("/api/performance/:provider/:model", get(performance_window))
        .route("/api/config", get(get_config).put(put_config))
        .route(
            "/api/debug/:request_id",
            get(get_debug_log).delete(delete_debug_log),
        )
        .route("/api/logs", get(get_logs).delete(prune_logs))
        .layer(CorsLayer::permissive())
}

pub async fn serve() {
    let settings = config::snapshot();
    let addr: SocketAddr = settings
        .listen
        .as_deref()
        .unwrap_or("127.0.0.1:8787")
        .parse()
        .unwrap_or_else(|_| "127.0.0.1:8787".parse().unwrap());
    logger::info("server", &format!("listening on {}", addr));
    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app()).await.unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_bodies_match_dialect_shapes() {
        let chat = error_body(ApiType::Chat, 404, "model_not_found", "nope");
        assert_eq!(chat["error"]["type"], "model_not_found");

        let messages = error_body(ApiType::Messages, 401, "x", "denied");
        assert_eq!(messages["type"], "error");
        assert_eq!(messages["error"]["type"], "authentication_error");

        let messages = error_body(ApiType::Messages, 429, "x", "slow down");
        assert_eq!(messages["error"]["type"], "rate_limit_error");

        let gemini = error_body(ApiType::Gemini, 429, "x", "slow down");
        assert_eq!(gemini["error"]["code"], 429);
        assert_eq!(gemini["error"]["status"], "RESOURCE_EXHAUSTED");
    }

    #[test]
    fn auth_resolves_name_not_secret() {
        let mut settings = Settings::default();
        settings.keys.insert(
            "alice".to_string(),
            ApiKeyConfig {
                secret: "sk-secret-1".to_string(),
                ..Default::default()
            },
        );

        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer sk-secret-1".parse().unwrap());
        let auth = authenticate(&settings, &headers).unwrap().unwrap();
        assert_eq!(auth.name, "alice");

        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "sk-secret-1".parse().unwrap());
        let auth = authenticate(&settings, &headers).unwrap().unwrap();
        assert_eq!(auth.name, "alice");

        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "sk-wrong".parse().unwrap());
        assert!(authenticate(&settings, &headers).is_err());
    }

    #[test]
    fn open_gateway_without_keys() {
        let settings = Settings::default();
        let headers = HeaderMap::new();
        assert!(authenticate(&settings, &headers).unwrap().is_none());
    }

    #[tokio::test]
    async fn health_endpoint_responds() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move { axum::serve(listener, app()).await.unwrap() });
        let body = reqwest::get(format!("http://{}/health", addr))
            .await
            .unwrap()
            .json::<Value>()
            .await
            .unwrap();
        assert_eq!(body["status"], "ok");
        handle.abort();
    }

    #[tokio::test]
    async fn unknown_alias_is_dialect_shaped_404() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move { axum::serve(listener, app()).await.unwrap() });

        let client = reqwest::Client::new();
        let response = client
            .post(format!("http://{}/v1/messages", addr))
            .json(&json!({
                "model": "definitely-not-configured",
                "max_tokens": 16,
                "messages": [{ "role": "user", "content": "hi" }]
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 404);
        let body = response.json::<Value>().await.unwrap();
        assert_eq!(body["type"], "error");
        assert_eq!(body["error"]["type"], "not_found_error");
        handle.abort();
    }
}
