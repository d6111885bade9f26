//! Gateway configuration.
//!
//! Settings are read from a TOML file under the platform data directory and
//! published as an immutable snapshot. Request handlers take one snapshot
//! reference and carry it for the life of the request; hot-reload swaps the
//! published pointer without touching in-flight requests.

use once_cell::sync::Lazy;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::{fs, path::Path};

use crate::pricing::{OpenRouterRates, Pricing};
use crate::transform::ApiType;

#[derive(serde::Serialize, serde::Deserialize, Clone, Default)]
#[serde(default)]
pub struct Settings {
    /// Listen address for the HTTP server.
    pub listen: Option<String>,
    pub providers: BTreeMap<String, ProviderConfig>,
    pub models: BTreeMap<String, ModelAlias>,
    pub keys: BTreeMap<String, ApiKeyConfig>,
    pub cooldown: CooldownSettings,
    pub debug: DebugSettings,
    /// OpenRouter pricing table, keyed by slug. Rates are per-token strings.
    pub openrouter_pricing: BTreeMap<String, OpenRouterRates>,
    /// Provider request timeout in seconds.
    pub request_timeout_secs: Option<u64>,
    /// Streaming request timeout in seconds.
    pub stream_timeout_secs: Option<u64>,
}

#[derive(serde::Serialize, serde::Deserialize, Clone, Default, Debug)]
#[serde(default)]
pub struct ProviderConfig {
    /// Default dialect spoken by this provider.
    #[serde(rename = "type")]
    pub api_type: Option<ApiType>,
    pub base_url: Option<String>,
    /// Per-dialect base URL overrides.
    pub base_urls: BTreeMap<String, String>,
    pub auth_scheme: AuthScheme,
    /// API key; a `{env:VAR}` sigil is resolved at request time.
    pub api_key: Option<String>,
    pub enabled: Option<bool>,
    pub headers: BTreeMap<String, String>,
    /// Discount applied to all costs from this provider, in [0, 1].
    pub discount: Option<f64>,
    pub models: BTreeMap<String, ProviderModelConfig>,
}

impl ProviderConfig {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    pub fn default_api_type(&self) -> ApiType {
        self.api_type.unwrap_or(ApiType::Chat)
    }

    /// Base URL for a dialect: per-dialect override first, then the shared one.
    pub fn base_url_for(&self, api: ApiType) -> Option<&str> {
        self.base_urls
            .get(api.as_str())
            .map(|s| s.as_str())
            .or(self.base_url.as_deref())
    }
}

#[derive(serde::Serialize, serde::Deserialize, Clone, Default, Debug)]
#[serde(default)]
pub struct ProviderModelConfig {
    pub pricing: Option<Pricing>,
    /// Dialects this model is reachable through, most preferred first.
    pub access_via: Vec<ApiType>,
}

#[derive(serde::Serialize, serde::Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum AuthScheme {
    #[default]
    Bearer,
    XApiKey,
}

#[derive(serde::Serialize, serde::Deserialize, Clone, Default)]
#[serde(default)]
pub struct ModelAlias {
    pub targets: Vec<AliasTarget>,
    pub selector: SelectorStrategy,
    pub priority: Option<AliasPriority>,
    pub additional_aliases: Vec<String>,
    pub description: Option<String>,
}

#[derive(serde::Serialize, serde::Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct AliasTarget {
    pub provider: String,
    pub model: String,
    pub weight: Option<f64>,
    pub enabled: Option<bool>,
}

impl AliasTarget {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }
}

#[derive(serde::Serialize, serde::Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AliasPriority {
    ApiMatch,
}

#[derive(serde::Serialize, serde::Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SelectorStrategy {
    #[default]
    Random,
    InOrder,
    Weighted,
    Cost,
    Latency,
    Performance,
}

#[derive(serde::Serialize, serde::Deserialize, Clone, Default)]
#[serde(default)]
pub struct ApiKeyConfig {
    pub secret: String,
    /// Free-form attribution recorded on usage rows for this key.
    pub attribution: Option<String>,
    pub quota: Option<QuotaConfig>,
}

#[derive(serde::Serialize, serde::Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct QuotaConfig {
    pub name: String,
    pub limit: i64,
    pub limit_type: QuotaLimitType,
    pub period: QuotaPeriod,
    /// Window length for rolling quotas.
    pub duration_secs: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            limit: 0,
            limit_type: QuotaLimitType::Tokens,
            period: QuotaPeriod::Rolling,
            duration_secs: 3600,
        }
    }
}

#[derive(serde::Serialize, serde::Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QuotaLimitType {
    #[default]
    Tokens,
    Requests,
}

impl QuotaLimitType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaLimitType::Tokens => "tokens",
            QuotaLimitType::Requests => "requests",
        }
    }
}

#[derive(serde::Serialize, serde::Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QuotaPeriod {
    #[default]
    Rolling,
    Daily,
    Weekly,
}

#[derive(serde::Serialize, serde::Deserialize, Clone, Debug)]
#[serde(default)]
pub struct CooldownSettings {
    pub min_secs: u64,
    pub max_secs: u64,
    pub rate_limit_secs: u64,
    pub auth_error_secs: u64,
    pub timeout_secs: u64,
    pub server_error_secs: u64,
    pub connection_error_secs: u64,
}

impl Default for CooldownSettings {
    fn default() -> Self {
        Self {
            min_secs: 5,
            max_secs: 1800,
            rate_limit_secs: 60,
            auth_error_secs: 300,
            timeout_secs: 30,
            server_error_secs: 60,
            connection_error_secs: 30,
        }
    }
}

#[derive(serde::Serialize, serde::Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct DebugSettings {
    /// Capture raw/transformed bodies for every request.
    pub capture: bool,
    /// Estimate token counts from captured bodies when the provider reports none.
    pub estimate_tokens: bool,
}

fn settings_path() -> PathBuf {
    let mut p = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
    p.push("plexus");
    fs::create_dir_all(&p).ok();
    p.push("settings.toml");
    p
}

/// Validate a settings tree. Returns the first problem found.
pub fn validate(settings: &Settings) -> Result<(), String> {
    let mut seen_aliases: BTreeMap<&str, &str> = BTreeMap::new();
    for (name, alias) in &settings.models {
        for extra in std::iter::once(name.as_str()).chain(alias.additional_aliases.iter().map(|s| s.as_str())) {
            if let Some(owner) = seen_aliases.insert(extra, name) {
                return Err(format!(
                    "alias '{}' is defined by both '{}' and '{}'",
                    extra, owner, name
                ));
            }
        }
        for target in &alias.targets {
            if !settings.providers.contains_key(&target.provider) {
                return Err(format!(
                    "alias '{}' targets unknown provider '{}'",
                    name, target.provider
                ));
            }
        }
    }
    for (pname, provider) in &settings.providers {
        if let Some(d) = provider.discount {
            if !(0.0..=1.0).contains(&d) {
                return Err(format!("provider '{}' discount must be within [0, 1]", pname));
            }
        }
        for (mname, model) in &provider.models {
            if let Some(pricing) = &model.pricing {
                pricing
                    .validate()
                    .map_err(|e| format!("pricing for {}/{}: {}", pname, mname, e))?;
            }
        }
    }
    Ok(())
}

/// Read settings from disk. Parse failures fall back to defaults with a log
/// line rather than refusing to start.
pub fn load_from(path: &Path) -> Settings {
    if !path.exists() {
        return Settings::default();
    }
    let raw = fs::read_to_string(path).unwrap_or_default();
    match toml::from_str::<Settings>(&raw) {
        Ok(cfg) => match validate(&cfg) {
            Ok(()) => cfg,
            Err(e) => {
                crate::logger::error("config", &format!("invalid settings file: {}", e));
                Settings::default()
            }
        },
        Err(e) => {
            crate::logger::error("config", &format!("failed to parse settings file: {}", e));
            Settings::default()
        }
    }
}

pub fn load() -> Settings {
    load_from(&settings_path())
}

pub fn save(settings: &Settings) -> Result<(), String> {
    let p = settings_path();
    if let Some(parent) = p.parent() {
        fs::create_dir_all(parent).map_err(|e| format!("failed to create config dir: {}", e))?;
    }
    let raw = toml::to_string_pretty(settings).map_err(|e| format!("failed to serialize settings: {}", e))?;
    fs::write(&p, raw).map_err(|e| format!("failed to write {:?}: {}", p, e))
}

static CURRENT: Lazy<RwLock<Arc<Settings>>> =
    Lazy::new(|| RwLock::new(Arc::new(Settings::default())));

/// Current immutable snapshot. Cheap to call; the returned Arc stays valid
/// across hot-reloads.
pub fn snapshot() -> Arc<Settings> {
    CURRENT.read().map(|g| Arc::clone(&g)).unwrap_or_default()
}

/// Validate and atomically publish a new snapshot.
pub fn install(settings: Settings) -> Result<(), String> {
    validate(&settings)?;
    let next = Arc::new(settings);
    if let Ok(mut guard) = CURRENT.write() {
        *guard = next;
    }
    Ok(())
}

/// Load from disk and publish.
pub fn init() {
    let cfg = load();
    if let Err(e) = install(cfg) {
        crate::logger::error("config", &format!("settings rejected at startup: {}", e));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricing::Pricing;

    fn provider(api: ApiType) -> ProviderConfig {
        ProviderConfig {
            api_type: Some(api),
            base_url: Some("https://example.test".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn duplicate_alias_rejected() {
        let mut settings = Settings::default();
        settings.providers.insert("p".to_string(), provider(ApiType::Chat));
        settings.models.insert(
            "a".to_string(),
            ModelAlias {
                targets: vec![AliasTarget { provider: "p".to_string(), model: "m".to_string(), ..Default::default() }],
                additional_aliases: vec!["b".to_string()],
                ..Default::default()
            },
        );
        settings.models.insert(
            "b".to_string(),
            ModelAlias {
                targets: vec![AliasTarget { provider: "p".to_string(), model: "m".to_string(), ..Default::default() }],
                ..Default::default()
            },
        );
        assert!(validate(&settings).is_err());
    }

    #[test]
    fn unknown_target_provider_rejected() {
        let mut settings = Settings::default();
        settings.models.insert(
            "a".to_string(),
            ModelAlias {
                targets: vec![AliasTarget { provider: "ghost".to_string(), model: "m".to_string(), ..Default::default() }],
                ..Default::default()
            },
        );
        assert!(validate(&settings).is_err());
    }

    #[test]
    fn negative_per_request_pricing_rejected() {
        let mut settings = Settings::default();
        let mut p = provider(ApiType::Chat);
        p.models.insert(
            "m".to_string(),
            ProviderModelConfig {
                pricing: Some(Pricing::PerRequest { amount: -1.0 }),
                access_via: Vec::new(),
            },
        );
        settings.providers.insert("p".to_string(), p);
        assert!(validate(&settings).is_err());
    }

    #[test]
    fn snapshot_swap_is_visible() {
        let mut settings = Settings::default();
        settings.providers.insert("swap-test".to_string(), provider(ApiType::Messages));
        install(settings).unwrap();
        assert!(snapshot().providers.contains_key("swap-test"));
    }

    #[test]
    fn toml_round_trip() {
        let raw = r#"
            [providers.openai]
            type = "chat"
            base_url = "https://api.openai.com/v1"
            auth_scheme = "bearer"
            api_key = "{env:OPENAI_API_KEY}"

            [providers.openai.models."gpt-4o".pricing]
            source = "simple"
            input = 2.5
            output = 10.0

            [models.fast]
            selector = "in_order"
            additional_aliases = ["quick"]

            [[models.fast.targets]]
            provider = "openai"
            model = "gpt-4o"
        "#;
        let cfg: Settings = toml::from_str(raw).unwrap();
        assert!(validate(&cfg).is_ok());
        let alias = &cfg.models["fast"];
        assert_eq!(alias.selector, SelectorStrategy::InOrder);
        assert_eq!(alias.targets[0].model, "gpt-4o");
        let model = &cfg.providers["openai"].models["gpt-4o"];
        assert!(matches!(model.pricing, Some(Pricing::Simple { .. })));
    }
}
