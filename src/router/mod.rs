//! Alias resolution and target routing.
//!
//! A request's model string resolves either through the `direct/` escape
//! hatch (no cooldown filtering) or through the alias table, producing the
//! set of eligible targets the dispatcher will iterate over.

pub mod select;

use crate::config::{ModelAlias, ProviderConfig, ProviderModelConfig, SelectorStrategy, Settings};
use crate::cooldown::CooldownManager;
use crate::transform::ApiType;

/// One eligible `(provider, model)` pair, enriched with the config the
/// selector and dispatcher need.
#[derive(Debug, Clone)]
pub struct RouteTarget {
    pub provider: String,
    pub model: String,
    pub weight: Option<f64>,
    pub api_type: ApiType,
    pub provider_config: ProviderConfig,
    pub model_config: Option<ProviderModelConfig>,
    pub provider_discount: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct Route {
    pub targets: Vec<RouteTarget>,
    pub selector: SelectorStrategy,
    pub incoming_model_alias: String,
    pub canonical_model: String,
    pub direct: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RouteError {
    AliasNotFound(String),
    NoEnabledTargets(String),
    AllProvidersOnCooldown {
        alias: String,
        /// Remaining cooldown seconds per provider.
        remaining: Vec<(String, i64)>,
    },
    ProviderNotFound(String),
    DirectRoutingInvalid(String),
}

impl std::fmt::Display for RouteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouteError::AliasNotFound(alias) => write!(f, "Model '{}' not found", alias),
            RouteError::NoEnabledTargets(alias) => {
                write!(f, "Model '{}' has no enabled targets", alias)
            }
            RouteError::AllProvidersOnCooldown { alias, remaining } => {
                let detail: Vec<String> = remaining
                    .iter()
                    .map(|(provider, secs)| format!("{} ({}s)", provider, secs))
                    .collect();
                write!(
                    f,
                    "All providers for '{}' are cooling down: {}",
                    alias,
                    detail.join(", ")
                )
            }
            RouteError::ProviderNotFound(provider) => {
                write!(f, "Provider '{}' not found or disabled", provider)
            }
            RouteError::DirectRoutingInvalid(detail) => {
                write!(f, "Invalid direct route: {}", detail)
            }
        }
    }
}

impl std::error::Error for RouteError {}

/// Dialect a target is reached through: the incoming dialect when the model
/// declares it, otherwise the model's first declared dialect, otherwise the
/// provider default.
fn target_api_type(
    provider: &ProviderConfig,
    model_config: Option<&ProviderModelConfig>,
    incoming: Option<ApiType>,
) -> ApiType {
    if let Some(mc) = model_config {
        if !mc.access_via.is_empty() {
            if let Some(api) = incoming {
                if mc.access_via.contains(&api) {
                    return api;
                }
            }
            return mc.access_via[0];
        }
    }
    provider.default_api_type()
}

fn build_target(
    settings: &Settings,
    provider_name: &str,
    model: &str,
    weight: Option<f64>,
    incoming: Option<ApiType>,
) -> Option<RouteTarget> {
    let provider = settings.providers.get(provider_name)?;
    let model_config = provider.models.get(model).cloned();
    Some(RouteTarget {
        provider: provider_name.to_string(),
        model: model.to_string(),
        weight,
        api_type: target_api_type(provider, model_config.as_ref(), incoming),
        provider_config: provider.clone(),
        model_config,
        provider_discount: provider.discount,
    })
}

fn resolve_direct(
    settings: &Settings,
    rest: &str,
    original: &str,
    incoming: Option<ApiType>,
) -> Result<Route, RouteError> {
    let (provider_name, model) = rest
        .split_once('/')
        .filter(|(p, m)| !p.is_empty() && !m.is_empty())
        .ok_or_else(|| {
            RouteError::DirectRoutingInvalid(
                "expected 'direct/<provider>/<model>'".to_string(),
            )
        })?;
    let provider = settings
        .providers
        .get(provider_name)
        .ok_or_else(|| RouteError::ProviderNotFound(provider_name.to_string()))?;
    if !provider.is_enabled() {
        return Err(RouteError::ProviderNotFound(provider_name.to_string()));
    }
    let target = build_target(settings, provider_name, model, None, incoming)
        .ok_or_else(|| RouteError::ProviderNotFound(provider_name.to_string()))?;
    Ok(Route {
        targets: vec![target],
        selector: SelectorStrategy::InOrder,
        incoming_model_alias: original.to_string(),
        canonical_model: original.to_string(),
        direct: true,
    })
}

/// Exact alias match first, then a scan of `additional_aliases`. Returns the
/// canonical (owning) key alongside the alias definition.
fn find_alias<'a>(settings: &'a Settings, name: &str) -> Option<(&'a str, &'a ModelAlias)> {
    if let Some(alias) = settings.models.get(name) {
        return Some((settings.models.get_key_value(name)?.0.as_str(), alias));
    }
    settings
        .models
        .iter()
        .find(|(_, alias)| alias.additional_aliases.iter().any(|a| a == name))
        .map(|(key, alias)| (key.as_str(), alias))
}

/// Resolve a model string to its route.
pub fn resolve(
    settings: &Settings,
    cooldowns: &CooldownManager,
    model: &str,
    incoming: Option<ApiType>,
) -> Result<Route, RouteError> {
    if let Some(rest) = model.strip_prefix("direct/") {
        return resolve_direct(settings, rest, model, incoming);
    }

    let (canonical, alias) =
        find_alias(settings, model).ok_or_else(|| RouteError::AliasNotFound(model.to_string()))?;

    // A target is eligible only when it is enabled, its provider is enabled,
    // and the model is listed under that provider.
    let enabled: Vec<RouteTarget> = alias
        .targets
        .iter()
        .filter(|t| t.is_enabled())
        .filter(|t| {
            settings
                .providers
                .get(&t.provider)
                .map(|p| p.is_enabled() && p.models.contains_key(&t.model))
                .unwrap_or(false)
        })
        .filter_map(|t| build_target(settings, &t.provider, &t.model, t.weight, incoming))
        .collect();

    if enabled.is_empty() {
        return Err(RouteError::NoEnabledTargets(model.to_string()));
    }

    let healthy = cooldowns.filter_healthy(enabled.clone(), |t| (t.provider.as_str(), t.model.as_str()));
    if healthy.is_empty() {
        let remaining = enabled
            .iter()
            .map(|t| {
                (
                    t.provider.clone(),
                    cooldowns.remaining_secs(&t.provider, &t.model, None),
                )
            })
            .collect();
        return Err(RouteError::AllProvidersOnCooldown {
            alias: model.to_string(),
            remaining,
        });
    }

    // api_match priority: prefer targets reachable through the caller's own
    // dialect, falling back to every healthy target when none declares it.
    let targets = match (alias.priority, incoming) {
        (Some(crate::config::AliasPriority::ApiMatch), Some(api)) => {
            let matched: Vec<RouteTarget> = healthy
                .iter()
                .filter(|t| {
                    t.model_config
                        .as_ref()
                        .map(|mc| mc.access_via.contains(&api))
                        .unwrap_or(false)
                })
                .cloned()
                .collect();
            if matched.is_empty() { healthy } else { matched }
        }
        _ => healthy,
    };

    Ok(Route {
        targets,
        selector: alias.selector,
        incoming_model_alias: model.to_string(),
        canonical_model: canonical.to_string(),
        direct: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AliasTarget, ProviderConfig, ProviderModelConfig};
    use crate::cooldown::{CooldownManager, CooldownReason};

    fn settings_with_two_targets() -> Settings {
        let mut settings = Settings::default();
        for (name, api) in [("alpha", ApiType::Chat), ("beta", ApiType::Messages)] {
            let mut provider = ProviderConfig {
                api_type: Some(api),
                base_url: Some(format!("https://{}.test", name)),
                ..Default::default()
            };
            provider.models.insert("model-1".to_string(), ProviderModelConfig::default());
            settings.providers.insert(name.to_string(), provider);
        }
        settings.models.insert(
            "my-alias".to_string(),
            ModelAlias {
                targets: vec![
                    AliasTarget { provider: "alpha".to_string(), model: "model-1".to_string(), ..Default::default() },
                    AliasTarget { provider: "beta".to_string(), model: "model-1".to_string(), ..Default::default() },
                ],
                selector: SelectorStrategy::InOrder,
                additional_aliases: vec!["my-alias-2".to_string()],
                ..Default::default()
            },
        );
        settings
    }

    #[test]
    fn alias_resolves_with_canonical_name() {
        let settings = settings_with_two_targets();
        let cooldowns = CooldownManager::new(false);
        let route = resolve(&settings, &cooldowns, "my-alias", Some(ApiType::Chat)).unwrap();
        assert_eq!(route.canonical_model, "my-alias");
        assert_eq!(route.targets.len(), 2);
        assert!(!route.direct);
    }

    #[test]
    fn additional_alias_round_trips_to_same_targets() {
        let settings = settings_with_two_targets();
        let cooldowns = CooldownManager::new(false);
        let a = resolve(&settings, &cooldowns, "my-alias", None).unwrap();
        let b = resolve(&settings, &cooldowns, "my-alias-2", None).unwrap();
        assert_eq!(a.canonical_model, b.canonical_model);
        let pair = |r: &Route| {
            r.targets
                .iter()
                .map(|t| (t.provider.clone(), t.model.clone()))
                .collect::<Vec<_>>()
        };
        assert_eq!(pair(&a), pair(&b));
        assert_eq!(b.incoming_model_alias, "my-alias-2");
    }

    #[test]
    fn unknown_alias_is_not_found() {
        let settings = settings_with_two_targets();
        let cooldowns = CooldownManager::new(false);
        assert!(matches!(
            resolve(&settings, &cooldowns, "ghost", None),
            Err(RouteError::AliasNotFound(_))
        ));
    }

    #[test]
    fn cooldown_filters_targets_and_exhaustion_reports_remaining() {
        let settings = settings_with_two_targets();
        let cooldowns = CooldownManager::new(false);
        let cd = crate::config::CooldownSettings::default();
        cooldowns.set_cooldown("alpha", "model-1", None, CooldownReason::RateLimit, None, &cd);

        let route = resolve(&settings, &cooldowns, "my-alias", None).unwrap();
        assert_eq!(route.targets.len(), 1);
        assert_eq!(route.targets[0].provider, "beta");

        cooldowns.set_cooldown("beta", "model-1", None, CooldownReason::RateLimit, None, &cd);
        match resolve(&settings, &cooldowns, "my-alias", None) {
            Err(RouteError::AllProvidersOnCooldown { remaining, .. }) => {
                assert_eq!(remaining.len(), 2);
                assert!(remaining.iter().all(|(_, secs)| *secs > 0));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn direct_routing_bypasses_cooldowns_and_aliases() {
        let mut settings = settings_with_two_targets();
        settings
            .providers
            .get_mut("alpha")
            .unwrap()
            .models
            .insert("namespace/model-name".to_string(), ProviderModelConfig::default());
        let cooldowns = CooldownManager::new(false);
        let cd = crate::config::CooldownSettings::default();
        cooldowns.set_cooldown("alpha", "namespace/model-name", None, CooldownReason::AuthError, None, &cd);

        let route = resolve(
            &settings,
            &cooldowns,
            "direct/alpha/namespace/model-name",
            None,
        )
        .unwrap();
        assert!(route.direct);
        assert_eq!(route.targets.len(), 1);
        assert_eq!(route.targets[0].provider, "alpha");
        assert_eq!(route.targets[0].model, "namespace/model-name");
        assert_eq!(route.canonical_model, "direct/alpha/namespace/model-name");
    }

    #[test]
    fn direct_routing_rejects_unknown_provider() {
        let settings = settings_with_two_targets();
        let cooldowns = CooldownManager::new(false);
        assert!(matches!(
            resolve(&settings, &cooldowns, "direct/ghost/model", None),
            Err(RouteError::ProviderNotFound(_))
        ));
        assert!(matches!(
            resolve(&settings, &cooldowns, "direct/alpha", None),
            Err(RouteError::DirectRoutingInvalid(_))
        ));
    }

    #[test]
    fn disabled_target_and_unlisted_model_are_skipped() {
        let mut settings = settings_with_two_targets();
        settings.models.get_mut("my-alias").unwrap().targets[0].enabled = Some(false);
        settings
            .providers
            .get_mut("beta")
            .unwrap()
            .models
            .remove("model-1");
        let cooldowns = CooldownManager::new(false);
        assert!(matches!(
            resolve(&settings, &cooldowns, "my-alias", None),
            Err(RouteError::NoEnabledTargets(_))
        ));
    }

    #[test]
    fn api_match_prefers_matching_dialect() {
        let mut settings = settings_with_two_targets();
        settings
            .providers
            .get_mut("beta")
            .unwrap()
            .models
            .insert(
                "model-1".to_string(),
                ProviderModelConfig {
                    pricing: None,
                    access_via: vec![ApiType::Messages],
                },
            );
        settings.models.get_mut("my-alias").unwrap().priority =
            Some(crate::config::AliasPriority::ApiMatch);

        let route = resolve(&settings, &cooldowns_none(), "my-alias", Some(ApiType::Messages)).unwrap();
        assert_eq!(route.targets.len(), 1);
        assert_eq!(route.targets[0].provider, "beta");
        assert_eq!(route.targets[0].api_type, ApiType::Messages);

        // No dialect match falls back to every healthy target.
        let route = resolve(&settings, &cooldowns_none(), "my-alias", Some(ApiType::Gemini)).unwrap();
        assert_eq!(route.targets.len(), 2);
    }

    fn cooldowns_none() -> CooldownManager {
        CooldownManager::new(false)
    }
}
