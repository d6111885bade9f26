//! Request dispatch: target iteration, pass-through, failover.
//!
//! One entry point takes a parsed unified request, asks the router for the
//! eligible targets, then walks them in selector order. Failures classify
//! into cooldown reasons and move on to the next target; success attaches
//! the internal routing envelope and returns either a parsed unary response
//! or the raw provider stream for the pipeline.

pub mod client;
pub mod pipeline;
pub mod usage;

use serde_json::Value;

use crate::config::Settings;
use crate::cooldown::CooldownManager;
use crate::db::UsageRecord;
use crate::perf::PerformanceStore;
use crate::router::select::{select, SelectorContext};
use crate::router::{Route, RouteError, RouteTarget};
use crate::transform::{self, PlexusEnvelope, UnifiedRequest, UnifiedResponse};

use client::{ProviderError, ProviderRequest};

pub struct DispatchContext<'a> {
    pub settings: &'a Settings,
    pub cooldowns: &'a CooldownManager,
    pub perf: &'a PerformanceStore,
}

/// Attempt history attached to a dispatch failure.
#[derive(Debug, Clone, Default)]
pub struct RoutingContext {
    pub attempts: u32,
    pub attempted_providers: Vec<String>,
    pub final_provider: Option<String>,
    pub final_model: Option<String>,
    pub status_code: Option<u16>,
}

#[derive(Debug)]
pub enum DispatchError {
    Route(RouteError),
    Provider {
        error: ProviderError,
        routing: RoutingContext,
    },
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchError::Route(e) => write!(f, "{}", e),
            DispatchError::Provider { error, routing } => write!(
                f,
                "{} (after {} attempt(s): {})",
                error,
                routing.attempts,
                routing.attempted_providers.join(", ")
            ),
        }
    }
}

impl std::error::Error for DispatchError {}

/// Successful dispatch outcome.
pub enum ProviderReply {
    Unary(UnifiedResponse),
    Stream {
        response: reqwest::Response,
        /// Envelope-only response carrying routing metadata for the pipeline.
        meta: UnifiedResponse,
    },
}

/// Clone the inbound body and swap only the model name. The original body is
/// left untouched for debug capture. Gemini carries the model in the URL, so
/// its pass-through instead strips the fields the route handler injected.
pub fn pass_through_body(original: &Value, model: &str, api: crate::transform::ApiType) -> Value {
    let mut body = original.clone();
    if let Some(obj) = body.as_object_mut() {
        if api == crate::transform::ApiType::Gemini {
            obj.remove("model");
            obj.remove("stream");
        } else {
            obj.insert("model".to_string(), Value::String(model.to_string()));
        }
    }
    body
}

fn envelope(
    route: &Route,
    target: &RouteTarget,
    attempt_count: u32,
    attempted: &[String],
) -> PlexusEnvelope {
    PlexusEnvelope {
        provider: target.provider.clone(),
        model: target.model.clone(),
        canonical_model: route.canonical_model.clone(),
        api_type: Some(target.api_type),
        pricing: target.model_config.as_ref().and_then(|mc| mc.pricing.clone()),
        provider_discount: target.provider_discount,
        attempt_count,
        final_attempt_provider: target.provider.clone(),
        final_attempt_model: target.model.clone(),
        all_attempted_providers: attempted.to_vec(),
    }
}

fn fill_record(record: &mut UsageRecord, request: &UnifiedRequest, meta: &UnifiedResponse) {
    record.provider = Some(meta.plexus.provider.clone());
    record.outgoing_api_type = meta.plexus.api_type.map(|a| a.as_str().to_string());
    record.selected_model_name = Some(meta.plexus.model.clone());
    record.canonical_model_name = Some(meta.plexus.canonical_model.clone());
    record.attempt_count = meta.plexus.attempt_count as i64;
    record.final_attempt_provider = Some(meta.plexus.final_attempt_provider.clone());
    record.final_attempt_model = Some(meta.plexus.final_attempt_model.clone());
    record.all_attempted_providers = meta.plexus.all_attempted_providers.clone();
    record.is_passthrough = meta.bypass_transformation;
    record.is_streamed = request.stream;
    record.message_count = Some(request.messages.len() as i64);
    record.tools_defined = Some(request.tools.len() as i64);
}

/// Dispatch a unified request to one healthy target, failing over through
/// the alias's targets in selector order.
pub async fn dispatch(
    ctx: &DispatchContext<'_>,
    request: &UnifiedRequest,
    record: &mut UsageRecord,
) -> Result<ProviderReply, DispatchError> {
    let route = crate::router::resolve(
        ctx.settings,
        ctx.cooldowns,
        &request.model,
        Some(request.incoming_api_type),
    )
    .map_err(DispatchError::Route)?;

    record.incoming_model_alias = Some(route.incoming_model_alias.clone());
    record.canonical_model_name = Some(route.canonical_model.clone());

    let timeout_secs = if request.stream {
        ctx.settings.stream_timeout_secs.unwrap_or(client::STREAM_TIMEOUT_SECS)
    } else {
        ctx.settings.request_timeout_secs.unwrap_or(client::DEFAULT_TIMEOUT_SECS)
    };

    let mut attempts: Vec<(String, String)> = Vec::new();
    let mut attempted_keys: Vec<String> = Vec::new();
    let mut last_error: Option<ProviderError> = None;
    let mut last_target: Option<(String, String)> = None;

    loop {
        let selector_ctx = SelectorContext {
            previous_attempts: &attempts,
            perf: Some(ctx.perf),
            openrouter: &ctx.settings.openrouter_pricing,
        };
        let Some(target) = select(&route.targets, route.selector, &selector_ctx) else {
            break;
        };
        attempts.push((target.provider.clone(), target.model.clone()));
        attempted_keys.push(format!("{}/{}", target.provider, target.model));
        let attempt_count = attempts.len() as u32;

        let pass_through = request.incoming_api_type == target.api_type;
        let body = if pass_through {
            pass_through_body(&request.original_body, &target.model, target.api_type)
        } else {
            let outgoing = transform::get(target.api_type);
            let (body, warnings) = outgoing.transform_request(request, &target.model);
            for warning in &warnings {
                crate::logger::warn(
                    "transform",
                    &format!("{}: {} ({})", request.request_id, warning.message, warning.kind),
                );
            }
            body
        };
        crate::debug_capture::global()
            .add_transformed_request(&request.request_id, &body.to_string());

        crate::logger::info(
            "dispatch",
            &format!(
                "{}: attempt {} -> {}/{} via {} (passthrough={})",
                request.request_id,
                attempt_count,
                target.provider,
                target.model,
                target.api_type,
                pass_through
            ),
        );

        let provider_request = ProviderRequest {
            provider: &target.provider_config,
            api_type: target.api_type,
            model: &target.model,
            body: &body,
            request_id: &request.request_id,
            timeout_secs,
        };

        let error = if request.stream {
            match client::request_raw(&provider_request, true).await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    if (200..300).contains(&status) {
                        ctx.cooldowns.reset(&target.provider, &target.model, None);
                        let mut meta = UnifiedResponse {
                            model: target.model.clone(),
                            bypass_transformation: pass_through,
                            plexus: envelope(&route, &target, attempt_count, &attempted_keys),
                            ..Default::default()
                        };
                        meta.id = request.request_id.clone();
                        fill_record(record, request, &meta);
                        return Ok(ProviderReply::Stream { response, meta });
                    }
                    let retry_after = client::parse_retry_after(&response);
                    let body_text = response.text().await.unwrap_or_default();
                    client::classify_status(status, retry_after, body_text)
                }
                Err(e) => e,
            }
        } else {
            match client::request_parsed(&provider_request).await {
                Ok(value) => {
                    ctx.cooldowns.reset(&target.provider, &target.model, None);
                    // The parsing transformer is the target's dialect; for
                    // pass-through both sides speak it.
                    let mut unified =
                        transform::get(target.api_type).parse_response(&value, &target.model);
                    unified.bypass_transformation = pass_through;
                    unified.plexus = envelope(&route, &target, attempt_count, &attempted_keys);
                    fill_record(record, request, &unified);
                    return Ok(ProviderReply::Unary(unified));
                }
                Err(e) => e,
            }
        };

        crate::logger::warn(
            "dispatch",
            &format!(
                "{}: {}/{} failed: {}",
                request.request_id, target.provider, target.model, error
            ),
        );
        if let Some(reason) = error.cooldown_reason() {
            // Direct routes skip cooldown bookkeeping the same way they skip
            // cooldown filtering.
            if !route.direct {
                ctx.cooldowns.set_cooldown(
                    &target.provider,
                    &target.model,
                    None,
                    reason,
                    error.retry_after(),
                    &ctx.settings.cooldown,
                );
            }
        }
        last_target = Some((target.provider.clone(), target.model.clone()));
        let retryable = error.retryable();
        last_error = Some(error);
        if !retryable {
            break;
        }
        if attempts.len() < route.targets.len() {
            tokio::time::sleep(client::failover_delay(attempt_count)).await;
        }
    }

    let error = last_error
        .unwrap_or_else(|| ProviderError::Internal("no targets available".to_string()));
    let routing = RoutingContext {
        attempts: attempts.len() as u32,
        attempted_providers: attempted_keys.clone(),
        final_provider: last_target.as_ref().map(|(p, _)| p.clone()),
        final_model: last_target.as_ref().map(|(_, m)| m.clone()),
        status_code: error.status_code(),
    };
    record.attempt_count = routing.attempts as i64;
    record.all_attempted_providers = attempted_keys;
    record.final_attempt_provider = routing.final_provider.clone();
    record.final_attempt_model = routing.final_model.clone();
    Err(DispatchError::Provider { error, routing })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn pass_through_clones_and_swaps_model_only() {
        let original = json!({
            "model": "my-alias",
            "messages": [{ "role": "user", "content": "hi" }],
            "stream": true
        });
        let swapped = pass_through_body(&original, "target-model", crate::transform::ApiType::Chat);
        assert_eq!(swapped["model"], "target-model");
        assert_eq!(swapped["messages"], original["messages"]);
        // The inbound body is untouched.
        assert_eq!(original["model"], "my-alias");
    }

    #[test]
    fn gemini_pass_through_strips_injected_fields() {
        let original = json!({
            "model": "gemini-pro",
            "stream": true,
            "contents": [{ "role": "user", "parts": [{ "text": "hi" }] }]
        });
        let body = pass_through_body(&original, "gemini-pro", crate::transform::ApiType::Gemini);
        assert!(body.get("model").is_none());
        assert!(body.get("stream").is_none());
        assert_eq!(body["contents"], original["contents"]);
    }

    #[test]
    fn envelope_carries_attempt_history() {
        let route = Route {
            targets: Vec::new(),
            selector: crate::config::SelectorStrategy::Random,
            incoming_model_alias: "fast".to_string(),
            canonical_model: "fast".to_string(),
            direct: false,
        };
        let target = RouteTarget {
            provider: "beta".to_string(),
            model: "m2".to_string(),
            weight: None,
            api_type: crate::transform::ApiType::Chat,
            provider_config: Default::default(),
            model_config: None,
            provider_discount: Some(0.1),
        };
        let attempted = vec!["alpha/m1".to_string(), "beta/m2".to_string()];
        let env = envelope(&route, &target, 2, &attempted);
        assert_eq!(env.attempt_count, 2);
        assert_eq!(env.final_attempt_provider, "beta");
        assert_eq!(env.canonical_model, "fast");
        assert_eq!(env.all_attempted_providers, attempted);
        assert_eq!(env.provider_discount, Some(0.1));
    }
}
