use std::{env, fmt, str::FromStr, time::Duration};

use thiserror::Error;
use tracing::warn;

use crate::{
    image::ImageLimits,
    models::Capability,
    retry::RetryPolicy,
};

pub const DEFAULT_BACKEND_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_MAX_RETRIES: u32 = 2;
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(300);
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(3_600);

const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_GEMINI_MODEL: &str = "gemini-2.0-flash";
const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
const DEFAULT_OLLAMA_MODEL: &str = "llama3.2";
const DEFAULT_OLLAMA_VISION_MODEL: &str = "llama3.2-vision";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown backend `{0}`, expected `hosted` or `local`")]
    UnknownBackend(String),
    #[error("unknown environment `{0}`, expected `development` or `production`")]
    UnknownEnvironment(String),
    #[error("{0} backend requires an API key")]
    MissingApiKey(BackendKind),
    #[error("failed to build HTTP client: {0}")]
    HttpClient(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Hosted,
    Local,
}

impl BackendKind {
    pub const ALL: [BackendKind; 2] = [BackendKind::Hosted, BackendKind::Local];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Hosted => "hosted",
            BackendKind::Local => "local",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "hosted" | "gemini" => Ok(BackendKind::Hosted),
            "local" | "ollama" => Ok(BackendKind::Local),
            other => Err(ConfigError::UnknownBackend(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }
}

impl FromStr for Environment {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "development" | "dev" | "local" | "test" => Ok(Environment::Development),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(ConfigError::UnknownEnvironment(other.to_owned())),
        }
    }
}

/// One configured inference backend. Read-only after startup.
#[derive(Clone)]
pub struct BackendConfig {
    pub kind: BackendKind,
    pub endpoint: String,
    pub model: String,
    /// Model used for image-bearing capabilities; falls back to `model`.
    pub vision_model: Option<String>,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub max_retries: u32,
}

impl BackendConfig {
    pub fn new(kind: BackendKind, endpoint: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            kind,
            endpoint: endpoint.into().trim_end_matches('/').to_owned(),
            model: model.into(),
            vision_model: None,
            api_key: None,
            timeout: DEFAULT_BACKEND_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_vision_model(mut self, model: impl Into<String>) -> Self {
        self.vision_model = Some(model.into());
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// A zero timeout means "use the default", never "wait forever".
    pub fn effective_timeout(&self) -> Duration {
        if self.timeout.is_zero() {
            DEFAULT_BACKEND_TIMEOUT
        } else {
            self.timeout
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn model_for(&self, capability: Capability) -> &str {
        if capability.requires_image() {
            self.vision_model.as_deref().unwrap_or(&self.model)
        } else {
            &self.model
        }
    }
}

impl fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendConfig")
            .field("kind", &self.kind)
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("vision_model", &self.vision_model)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("timeout", &self.timeout)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

/// Which backend serves which capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilityRoutes {
    pub vision: BackendKind,
    pub text: BackendKind,
}

impl Default for CapabilityRoutes {
    fn default() -> Self {
        Self {
            vision: BackendKind::Hosted,
            text: BackendKind::Hosted,
        }
    }
}

impl CapabilityRoutes {
    pub fn backend_for(&self, capability: Capability) -> BackendKind {
        if capability.requires_image() {
            self.vision
        } else {
            self.text
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetrySettings {
    pub base_backoff: Duration,
    pub multiplier: f64,
    pub max_backoff: Duration,
    pub jitter: f64,
    pub deadline: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            base_backoff: Duration::from_millis(1_000),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(30),
            jitter: 0.1,
            deadline: DEFAULT_DEADLINE,
        }
    }
}

impl RetrySettings {
    pub fn policy_for(&self, backend: &BackendConfig) -> RetryPolicy {
        RetryPolicy {
            max_attempts: backend.max_attempts(),
            base_backoff: self.base_backoff,
            multiplier: self.multiplier,
            max_backoff: self.max_backoff,
            jitter: self.jitter,
            deadline: self.deadline,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitSettings {
    pub enabled: bool,
    pub per_minute: u32,
    pub per_hour: u32,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            per_minute: 60,
            per_hour: 1_000,
        }
    }
}

/// Response cache for the text capabilities. Off unless enabled.
#[derive(Clone, PartialEq, Eq)]
pub struct CacheSettings {
    pub enabled: bool,
    pub redis_url: Option<String>,
    pub ttl: Duration,
    pub prefix: String,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            redis_url: None,
            ttl: DEFAULT_CACHE_TTL,
            prefix: "chefassist".to_owned(),
        }
    }
}

impl fmt::Debug for CacheSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheSettings")
            .field("enabled", &self.enabled)
            .field("redis", &self.redis_url.is_some())
            .field("ttl", &self.ttl)
            .field("prefix", &self.prefix)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub service_name: String,
    pub environment: Environment,
    pub api_key: Option<String>,
    pub port: u16,
    pub backends: Vec<BackendConfig>,
    pub routes: CapabilityRoutes,
    pub retry: RetrySettings,
    pub images: ImageLimits,
    pub rate_limit: RateLimitSettings,
    pub cache: CacheSettings,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            service_name: "chefassist-ai".to_owned(),
            environment: Environment::Development,
            api_key: None,
            port: 8000,
            backends: Vec::new(),
            routes: CapabilityRoutes::default(),
            retry: RetrySettings::default(),
            images: ImageLimits::default(),
            rate_limit: RateLimitSettings::default(),
            cache: CacheSettings::default(),
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars { lookup: &lookup };
        let defaults = Self::default();

        let environment = vars
            .string("ENVIRONMENT")
            .map(|value| value.parse::<Environment>())
            .transpose()?
            .unwrap_or(Environment::Development);

        let mut backends = Vec::new();
        if let Some(api_key) = vars
            .string("GOOGLE_API_KEY")
            .or_else(|| vars.string("GOOGLE_GENERATIVE_AI_API_KEY"))
        {
            let model = vars
                .string("GEMINI_MODEL")
                .unwrap_or_else(|| DEFAULT_GEMINI_MODEL.to_owned());
            let mut hosted = BackendConfig::new(
                BackendKind::Hosted,
                vars.string("GEMINI_BASE_URL")
                    .unwrap_or_else(|| DEFAULT_GEMINI_BASE_URL.to_owned()),
                model,
            )
            .with_api_key(api_key)
            .with_timeout(vars.seconds("GEMINI_TIMEOUT", DEFAULT_BACKEND_TIMEOUT))
            .with_max_retries(vars.number("GEMINI_MAX_RETRIES", DEFAULT_MAX_RETRIES));
            if let Some(vision_model) = vars.string("GEMINI_VISION_MODEL") {
                hosted = hosted.with_vision_model(vision_model);
            }
            backends.push(hosted);
        }

        let ollama_url = match lookup("OLLAMA_URL") {
            Some(value) => Some(value.trim().to_owned()).filter(|value| !value.is_empty()),
            None => Some(DEFAULT_OLLAMA_URL.to_owned()),
        };
        if let Some(url) = ollama_url {
            let local = BackendConfig::new(
                BackendKind::Local,
                url,
                vars.string("OLLAMA_MODEL")
                    .unwrap_or_else(|| DEFAULT_OLLAMA_MODEL.to_owned()),
            )
            .with_vision_model(
                vars.string("OLLAMA_VISION_MODEL")
                    .unwrap_or_else(|| DEFAULT_OLLAMA_VISION_MODEL.to_owned()),
            )
            .with_timeout(vars.seconds("OLLAMA_TIMEOUT", DEFAULT_BACKEND_TIMEOUT))
            .with_max_retries(vars.number("OLLAMA_MAX_RETRIES", DEFAULT_MAX_RETRIES));
            backends.push(local);
        }

        let routes = CapabilityRoutes {
            vision: vars
                .string("GATEWAY_VISION_BACKEND")
                .map(|value| value.parse())
                .transpose()?
                .unwrap_or(defaults.routes.vision),
            text: vars
                .string("GATEWAY_TEXT_BACKEND")
                .map(|value| value.parse())
                .transpose()?
                .unwrap_or(defaults.routes.text),
        };

        let retry = RetrySettings {
            base_backoff: Duration::from_millis(vars.number(
                "GATEWAY_RETRY_BASE_MS",
                defaults.retry.base_backoff.as_millis() as u64,
            )),
            multiplier: vars.float("GATEWAY_RETRY_MULTIPLIER", defaults.retry.multiplier),
            max_backoff: Duration::from_millis(vars.number(
                "GATEWAY_RETRY_MAX_BACKOFF_MS",
                defaults.retry.max_backoff.as_millis() as u64,
            )),
            jitter: vars.float("GATEWAY_RETRY_JITTER", defaults.retry.jitter),
            deadline: vars.seconds("GATEWAY_DEADLINE_SECS", DEFAULT_DEADLINE),
        };

        let images = ImageLimits {
            max_bytes: vars.number("MAX_IMAGE_BYTES", defaults.images.max_bytes),
            fetch_timeout: vars.seconds("HTTP_TIMEOUT", defaults.images.fetch_timeout),
        };

        let rate_limit = RateLimitSettings {
            enabled: vars.flag("RATE_LIMIT_ENABLED", defaults.rate_limit.enabled),
            per_minute: vars.number("RATE_LIMIT_PER_MINUTE", defaults.rate_limit.per_minute),
            per_hour: vars.number("RATE_LIMIT_PER_HOUR", defaults.rate_limit.per_hour),
        };

        let redis_enabled = vars.flag("REDIS_ENABLED", false);
        let redis_url = vars.string("REDIS_URL").or_else(|| {
            redis_enabled.then(|| {
                let host = vars.string("REDIS_HOST").unwrap_or_else(|| "localhost".to_owned());
                let port = vars.number("REDIS_PORT", 6379u16);
                match vars.string("REDIS_PASSWORD") {
                    Some(password) => format!("redis://:{password}@{host}:{port}"),
                    None => format!("redis://{host}:{port}"),
                }
            })
        });
        let cache = CacheSettings {
            enabled: vars.flag("CACHE_ENABLED", defaults.cache.enabled) || redis_enabled,
            redis_url,
            ttl: vars.seconds("CACHE_TTL_SECS", defaults.cache.ttl),
            prefix: vars.string("CACHE_PREFIX").unwrap_or(defaults.cache.prefix),
        };

        Ok(Self {
            service_name: vars
                .string("SERVICE_NAME")
                .unwrap_or(defaults.service_name),
            environment,
            api_key: vars.string("API_KEY"),
            port: vars.number("PORT", defaults.port),
            backends,
            routes,
            retry,
            images,
            rate_limit,
            cache,
        })
    }

    pub fn backend(&self, kind: BackendKind) -> Option<&BackendConfig> {
        self.backends.iter().find(|backend| backend.kind == kind)
    }
}

struct Vars<'a, F> {
    lookup: &'a F,
}

impl<F> Vars<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty())
    }

    fn number<T>(&self, name: &str, default: T) -> T
    where
        T: FromStr,
    {
        let Some(raw) = self.string(name) else {
            return default;
        };
        match raw.parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                warn!(variable = name, value = %raw, "ignoring unparsable setting");
                default
            }
        }
    }

    fn float(&self, name: &str, default: f64) -> f64 {
        let value = self.number(name, default);
        if value.is_finite() && value >= 0.0 {
            value
        } else {
            default
        }
    }

    fn seconds(&self, name: &str, default: Duration) -> Duration {
        match self.number::<u64>(name, default.as_secs()) {
            0 => default,
            secs => Duration::from_secs(secs),
        }
    }

    fn flag(&self, name: &str, default: bool) -> bool {
        match self.string(name).map(|value| value.to_ascii_lowercase()) {
            Some(value) if matches!(value.as_str(), "1" | "true" | "yes" | "on") => true,
            Some(value) if matches!(value.as_str(), "0" | "false" | "no" | "off") => false,
            _ => default,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> Result<GatewayConfig, ConfigError> {
        let vars = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect::<HashMap<_, _>>();
        GatewayConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_enable_only_the_local_backend() {
        let config = config_from(&[]).expect("defaults should load");

        assert!(config.backend(BackendKind::Hosted).is_none());
        let local = config.backend(BackendKind::Local).expect("local backend");
        assert_eq!(local.endpoint, "http://localhost:11434");
        assert_eq!(local.model_for(Capability::SuggestRecipes), "llama3.2");
        assert_eq!(
            local.model_for(Capability::RecognizeIngredients),
            "llama3.2-vision"
        );
        assert_eq!(local.max_attempts(), 3);
        assert_eq!(config.environment, Environment::Development);
        assert!(config.api_key.is_none());
    }

    #[test]
    fn hosted_backend_is_enabled_by_either_google_key() {
        let config = config_from(&[
            ("GOOGLE_GENERATIVE_AI_API_KEY", "secret"),
            ("GEMINI_MODEL", "gemini-test"),
            ("GEMINI_MAX_RETRIES", "4"),
            ("OLLAMA_URL", ""),
        ])
        .expect("config should load");

        let hosted = config.backend(BackendKind::Hosted).expect("hosted backend");
        assert_eq!(hosted.api_key.as_deref(), Some("secret"));
        assert_eq!(hosted.model_for(Capability::RecognizeIngredients), "gemini-test");
        assert_eq!(hosted.max_attempts(), 5);
        assert!(config.backend(BackendKind::Local).is_none());
    }

    #[test]
    fn zero_timeouts_fall_back_to_defaults() {
        let config = config_from(&[("OLLAMA_TIMEOUT", "0"), ("GATEWAY_DEADLINE_SECS", "0")])
            .expect("config should load");

        let local = config.backend(BackendKind::Local).expect("local backend");
        assert_eq!(local.effective_timeout(), DEFAULT_BACKEND_TIMEOUT);
        assert_eq!(config.retry.deadline, DEFAULT_DEADLINE);

        let zeroed = local.clone().with_timeout(Duration::ZERO);
        assert_eq!(zeroed.effective_timeout(), DEFAULT_BACKEND_TIMEOUT);
    }

    #[test]
    fn routes_are_configured_per_capability_group() {
        let config = config_from(&[
            ("GATEWAY_VISION_BACKEND", "hosted"),
            ("GATEWAY_TEXT_BACKEND", "local"),
        ])
        .expect("config should load");

        assert_eq!(
            config.routes.backend_for(Capability::RecognizeIngredients),
            BackendKind::Hosted
        );
        assert_eq!(
            config.routes.backend_for(Capability::Personalize),
            BackendKind::Local
        );
    }

    #[test]
    fn unknown_backend_name_is_rejected() {
        let error = config_from(&[("GATEWAY_TEXT_BACKEND", "mainframe")])
            .expect_err("unknown backend should fail");
        assert_eq!(error, ConfigError::UnknownBackend("mainframe".to_owned()));
    }

    #[test]
    fn redis_cache_is_built_from_host_settings() {
        let config = config_from(&[
            ("REDIS_ENABLED", "true"),
            ("REDIS_HOST", "cache.internal"),
            ("REDIS_PASSWORD", "pw"),
            ("CACHE_TTL_SECS", "120"),
        ])
        .expect("config should load");

        assert!(config.cache.enabled);
        assert_eq!(
            config.cache.redis_url.as_deref(),
            Some("redis://:pw@cache.internal:6379")
        );
        assert_eq!(config.cache.ttl, Duration::from_secs(120));
        assert!(!format!("{:?}", config.cache).contains("pw"));

        let defaults = config_from(&[]).expect("defaults should load");
        assert!(!defaults.cache.enabled);
        assert!(defaults.cache.redis_url.is_none());
    }

    #[test]
    fn debug_output_redacts_api_keys() {
        let backend = BackendConfig::new(BackendKind::Hosted, "https://example.test/", "m")
            .with_api_key("super-secret");
        let rendered = format!("{backend:?}");
        assert!(!rendered.contains("super-secret"));
        assert_eq!(backend.endpoint, "https://example.test");
    }
}
