//! HTTP client for provider invocation.
//!
//! Builds per-dialect URLs and auth headers, resolves `{env:VAR}` key sigils
//! at request time, and classifies transport/status failures into the error
//! kinds the dispatcher's failover loop acts on.

use std::time::Duration;

use once_cell::sync::Lazy;
use rand::RngCore;
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Response};
use serde_json::Value;

use crate::config::{AuthScheme, ProviderConfig};
use crate::cooldown::CooldownReason;
use crate::transform::ApiType;

const ANTHROPIC_VERSION: &str = "2023-06-01";
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;
pub const STREAM_TIMEOUT_SECS: u64 = 300;

/// Provider-side failure, classified for retry/cooldown policy.
#[derive(Debug, Clone)]
pub enum ProviderError {
    InvalidRequest { status: u16, body: String },
    Authentication { status: u16, body: String },
    RateLimit { retry_after_secs: Option<u64>, body: String },
    Timeout(String),
    ServerError { status: u16, body: String },
    ConnectionError(String),
    Internal(String),
}

impl ProviderError {
    pub fn cooldown_reason(&self) -> Option<CooldownReason> {
        match self {
            ProviderError::RateLimit { .. } => Some(CooldownReason::RateLimit),
            ProviderError::Authentication { .. } => Some(CooldownReason::AuthError),
            ProviderError::Timeout(_) => Some(CooldownReason::Timeout),
            ProviderError::ServerError { .. } => Some(CooldownReason::ServerError),
            ProviderError::ConnectionError(_) => Some(CooldownReason::ConnectionError),
            ProviderError::InvalidRequest { .. } | ProviderError::Internal(_) => None,
        }
    }

    /// Whether the failover loop should try another target.
    pub fn retryable(&self) -> bool {
        !matches!(self, ProviderError::InvalidRequest { .. } | ProviderError::Internal(_))
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            ProviderError::InvalidRequest { status, .. }
            | ProviderError::Authentication { status, .. }
            | ProviderError::ServerError { status, .. } => Some(*status),
            ProviderError::RateLimit { .. } => Some(429),
            ProviderError::Timeout(_) => Some(504),
            ProviderError::ConnectionError(_) | ProviderError::Internal(_) => None,
        }
    }

    pub fn retry_after(&self) -> Option<u64> {
        match self {
            ProviderError::RateLimit { retry_after_secs, .. } => *retry_after_secs,
            _ => None,
        }
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderError::InvalidRequest { status, body } => {
                write!(f, "provider rejected request ({}): {}", status, truncate(body))
            }
            ProviderError::Authentication { status, body } => {
                write!(f, "provider auth failed ({}): {}", status, truncate(body))
            }
            ProviderError::RateLimit { body, .. } => {
                write!(f, "provider rate limited: {}", truncate(body))
            }
            ProviderError::Timeout(msg) => write!(f, "provider timeout: {}", msg),
            ProviderError::ServerError { status, body } => {
                write!(f, "provider error ({}): {}", status, truncate(body))
            }
            ProviderError::ConnectionError(msg) => write!(f, "connection failed: {}", msg),
            ProviderError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for ProviderError {}

fn truncate(body: &str) -> &str {
    if body.len() <= 500 {
        return body;
    }
    let mut end = 500;
    while end > 0 && !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}

static ENV_SIGIL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\{env:([A-Za-z_][A-Za-z0-9_]*)\}$").unwrap());

/// Resolve a configured API key, expanding a `{env:VAR}` sigil from the
/// process environment at request time.
pub fn resolve_api_key(raw: &str) -> Result<String, ProviderError> {
    if let Some(captures) = ENV_SIGIL.captures(raw.trim()) {
        let var = &captures[1];
        return std::env::var(var).map_err(|_| {
            ProviderError::Internal(format!("environment variable '{}' is not set", var))
        });
    }
    Ok(raw.to_string())
}

/// Build the outbound header set: auth per the provider's scheme, dialect
/// headers, custom headers, and the tracing request id.
pub fn build_headers(
    provider: &ProviderConfig,
    api: ApiType,
    request_id: &str,
) -> Result<HeaderMap, ProviderError> {
    let mut headers = HeaderMap::new();
    headers.insert("content-type", HeaderValue::from_static("application/json"));

    if let Some(raw) = provider.api_key.as_deref().filter(|s| !s.is_empty()) {
        let api_key = resolve_api_key(raw)?;
        match provider.auth_scheme {
            AuthScheme::Bearer => {
                let value = HeaderValue::from_str(&format!("Bearer {}", api_key))
                    .map_err(|_| ProviderError::Internal("api key is not header-safe".to_string()))?;
                headers.insert("authorization", value);
            }
            AuthScheme::XApiKey => {
                let value = HeaderValue::from_str(&api_key)
                    .map_err(|_| ProviderError::Internal("api key is not header-safe".to_string()))?;
                headers.insert("x-api-key", value.clone());
                if api == ApiType::Gemini {
                    headers.insert("x-goog-api-key", value);
                }
            }
        }
    }

    if api == ApiType::Messages {
        headers.insert("anthropic-version", HeaderValue::from_static(ANTHROPIC_VERSION));
    }

    for (name, value) in &provider.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.insert(name, value);
        }
    }

    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert("x-plexus-request-id", value);
    }

    Ok(headers)
}

/// Full request URL for a target: per-dialect base URL plus the dialect's
/// endpoint path. Gemini paths embed the model name and stream mode.
pub fn endpoint_url(
    provider: &ProviderConfig,
    api: ApiType,
    model: &str,
    stream: bool,
) -> Result<String, ProviderError> {
    let base = provider
        .base_url_for(api)
        .ok_or_else(|| ProviderError::Internal("provider has no base URL".to_string()))?
        .trim_end_matches('/');
    Ok(match api {
        ApiType::Chat => format!("{}/chat/completions", base),
        ApiType::Messages => format!("{}/v1/messages", base),
        ApiType::Responses => format!("{}/responses", base),
        ApiType::Gemini => {
            let action = if stream {
                "streamGenerateContent?alt=sse"
            } else {
                "generateContent"
            };
            format!("{}/models/{}:{}", base, model, action)
        }
    })
}

pub fn create_client(timeout_secs: u64) -> Result<Client, ProviderError> {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| ProviderError::Internal(format!("failed to create HTTP client: {}", e)))
}

fn map_transport_error(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout(e.to_string())
    } else if e.is_connect() {
        ProviderError::ConnectionError(e.to_string())
    } else {
        ProviderError::ConnectionError(format!("request error: {}", e))
    }
}

/// How a Retry-After value was obtained.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryAfter {
    pub secs: Option<u64>,
    pub source: &'static str,
}

/// Parse a Retry-After header: integer seconds or an HTTP-date. Absent or
/// unparseable yields `{source: "default"}`.
pub fn parse_retry_after(response: &Response) -> RetryAfter {
    parse_retry_after_value(
        response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok()),
    )
}

pub fn parse_retry_after_value(raw: Option<&str>) -> RetryAfter {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return RetryAfter { secs: None, source: "default" };
    };
    if let Ok(secs) = raw.parse::<u64>() {
        return RetryAfter { secs: Some(secs), source: "header" };
    }
    if let Ok(date) = chrono::DateTime::parse_from_rfc2822(raw) {
        let delta = date.timestamp() - chrono::Utc::now().timestamp();
        if delta > 0 {
            return RetryAfter { secs: Some(delta as u64), source: "header" };
        }
        return RetryAfter { secs: Some(0), source: "header" };
    }
    RetryAfter { secs: None, source: "default" }
}

/// Classify a non-success status into the failover error kinds.
pub fn classify_status(status: u16, retry_after: RetryAfter, body: String) -> ProviderError {
    match status {
        401 | 403 => ProviderError::Authentication { status, body },
        429 => ProviderError::RateLimit { retry_after_secs: retry_after.secs, body },
        408 | 504 => ProviderError::Timeout(format!("HTTP {}: {}", status, truncate(&body))),
        s if s >= 500 => ProviderError::ServerError { status, body },
        _ => ProviderError::InvalidRequest { status, body },
    }
}

pub struct ProviderRequest<'a> {
    pub provider: &'a ProviderConfig,
    pub api_type: ApiType,
    pub model: &'a str,
    pub body: &'a Value,
    pub request_id: &'a str,
    pub timeout_secs: u64,
}

/// Send and return the raw response. Transport failures are classified; the
/// caller interprets the status (needed for streaming).
pub async fn request_raw(req: &ProviderRequest<'_>, stream: bool) -> Result<Response, ProviderError> {
    let url = endpoint_url(req.provider, req.api_type, req.model, stream)?;
    let headers = build_headers(req.provider, req.api_type, req.request_id)?;
    let client = create_client(req.timeout_secs)?;
    crate::logger::debug("client", &format!("sending request to {}", url));
    client
        .post(&url)
        .headers(headers)
        .json(req.body)
        .send()
        .await
        .map_err(map_transport_error)
}

/// Send, require 2xx, and parse the JSON body. Non-2xx is classified with
/// the response body attached.
pub async fn request_parsed(req: &ProviderRequest<'_>) -> Result<Value, ProviderError> {
    let response = request_raw(req, false).await?;
    let status = response.status().as_u16();
    if !(200..300).contains(&status) {
        let retry_after = parse_retry_after(&response);
        let body = response.text().await.unwrap_or_default();
        return Err(classify_status(status, retry_after, body));
    }
    response
        .json::<Value>()
        .await
        .map_err(|e| ProviderError::ConnectionError(format!("failed to read response body: {}", e)))
}

/// Exponential backoff with jitter between failover attempts.
pub fn failover_delay(attempt: u32) -> Duration {
    let base: u64 = 200;
    let exp = (1u64 << attempt.min(4)) * base;
    let capped = exp.min(2000);
    let mut jitter_bytes = [0u8; 8];
    rand::rngs::OsRng.fill_bytes(&mut jitter_bytes);
    let jitter = u64::from_le_bytes(jitter_bytes) % (capped / 4 + 1);
    Duration::from_millis(capped + jitter)
}

// ============================================================================
// SSE framing
// ============================================================================

/// Drain complete SSE events (terminated by a blank line) from a rolling
/// byte buffer. Events that straddle reads stay buffered until complete.
pub fn drain_sse_events(buffer: &mut Vec<u8>, chunk: &[u8]) -> Vec<String> {
    if !chunk.is_empty() {
        buffer.extend_from_slice(chunk);
    }
    let mut events = Vec::new();
    loop {
        let Some(pos) = buffer.windows(2).position(|w| w == b"\n\n") else {
            break;
        };
        let event: Vec<u8> = buffer.drain(..pos + 2).collect();
        events.push(String::from_utf8_lossy(&event).to_string());
    }
    events
}

/// The joined `data:` payload of one SSE event, if it has any.
pub fn event_data(event: &str) -> Option<String> {
    let mut data_lines = Vec::new();
    for line in event.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
        }
    }
    if data_lines.is_empty() {
        None
    } else {
        Some(data_lines.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn provider(scheme: AuthScheme, key: &str) -> ProviderConfig {
        ProviderConfig {
            api_type: Some(ApiType::Chat),
            base_url: Some("https://api.example.test/v1".to_string()),
            auth_scheme: scheme,
            api_key: Some(key.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn env_sigil_resolution() {
        std::env::set_var("PLEXUS_TEST_KEY", "sk-resolved");
        assert_eq!(resolve_api_key("{env:PLEXUS_TEST_KEY}").unwrap(), "sk-resolved");
        assert_eq!(resolve_api_key("sk-plain").unwrap(), "sk-plain");
        assert!(resolve_api_key("{env:PLEXUS_TEST_MISSING_VAR}").is_err());
    }

    #[test]
    fn bearer_and_x_api_key_headers() {
        let headers = build_headers(&provider(AuthScheme::Bearer, "sk-1"), ApiType::Chat, "req-1").unwrap();
        assert_eq!(headers.get("authorization").unwrap(), "Bearer sk-1");
        assert_eq!(headers.get("content-type").unwrap(), "application/json");
        assert_eq!(headers.get("x-plexus-request-id").unwrap(), "req-1");

        let headers =
            build_headers(&provider(AuthScheme::XApiKey, "sk-2"), ApiType::Messages, "req-2").unwrap();
        assert_eq!(headers.get("x-api-key").unwrap(), "sk-2");
        assert_eq!(headers.get("anthropic-version").unwrap(), ANTHROPIC_VERSION);
        assert!(headers.get("authorization").is_none());
    }

    #[test]
    fn custom_headers_are_merged() {
        let mut p = provider(AuthScheme::Bearer, "sk");
        p.headers = BTreeMap::from([("x-custom".to_string(), "yes".to_string())]);
        let headers = build_headers(&p, ApiType::Chat, "r").unwrap();
        assert_eq!(headers.get("x-custom").unwrap(), "yes");
    }

    #[test]
    fn endpoint_urls_per_dialect() {
        let p = provider(AuthScheme::Bearer, "sk");
        assert_eq!(
            endpoint_url(&p, ApiType::Chat, "m", false).unwrap(),
            "https://api.example.test/v1/chat/completions"
        );
        assert_eq!(
            endpoint_url(&p, ApiType::Responses, "m", false).unwrap(),
            "https://api.example.test/v1/responses"
        );
        assert_eq!(
            endpoint_url(&p, ApiType::Gemini, "gemini-pro", true).unwrap(),
            "https://api.example.test/v1/models/gemini-pro:streamGenerateContent?alt=sse"
        );
    }

    #[test]
    fn retry_after_seconds_and_date() {
        assert_eq!(
            parse_retry_after_value(Some("30")),
            RetryAfter { secs: Some(30), source: "header" }
        );
        assert_eq!(
            parse_retry_after_value(None),
            RetryAfter { secs: None, source: "default" }
        );
        assert_eq!(
            parse_retry_after_value(Some("not-a-date")),
            RetryAfter { secs: None, source: "default" }
        );
        let future = (chrono::Utc::now() + chrono::Duration::seconds(90)).to_rfc2822();
        let parsed = parse_retry_after_value(Some(&future));
        assert_eq!(parsed.source, "header");
        assert!(parsed.secs.unwrap() > 80);
    }

    #[test]
    fn status_classification() {
        let default = RetryAfter { secs: None, source: "default" };
        assert!(matches!(
            classify_status(401, default.clone(), String::new()),
            ProviderError::Authentication { .. }
        ));
        assert!(matches!(
            classify_status(429, RetryAfter { secs: Some(5), source: "header" }, String::new()),
            ProviderError::RateLimit { retry_after_secs: Some(5), .. }
        ));
        assert!(matches!(
            classify_status(503, default.clone(), String::new()),
            ProviderError::ServerError { .. }
        ));
        let invalid = classify_status(400, default, String::new());
        assert!(matches!(invalid, ProviderError::InvalidRequest { .. }));
        assert!(!invalid.retryable());
    }

    #[test]
    fn sse_event_framing_across_reads() {
        let mut buffer = Vec::new();
        let events = drain_sse_events(&mut buffer, b"event: message_start\ndata: {\"a\":");
        assert!(events.is_empty());
        let events = drain_sse_events(&mut buffer, b"1}\n\ndata: next");
        assert_eq!(events.len(), 1);
        assert_eq!(event_data(&events[0]).unwrap(), "{\"a\":1}");
        let events = drain_sse_events(&mut buffer, b"\n\n");
        assert_eq!(event_data(&events[0]).unwrap(), "next");
        assert!(buffer.is_empty());
    }

    #[test]
    fn multi_line_data_joins() {
        let event = "data: line1\ndata: line2\n\n";
        assert_eq!(event_data(event).unwrap(), "line1\nline2");
        assert!(event_data("event: ping\n\n").is_none());
    }
}
