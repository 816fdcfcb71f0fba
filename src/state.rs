use std::{sync::Arc, time::Duration};

use crate::{
    auth::AuthGate,
    backend::InferenceBackend,
    cache::ResponseCache,
    config::{ConfigError, GatewayConfig, RetrySettings},
    image::ImageNormalizer,
    limits::RateLimiter,
    metrics::AppMetrics,
    orchestrator::Orchestrator,
    router::BackendRouter,
};

pub const TEST_API_KEY: &str = "test-key";

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub orchestrator: Arc<Orchestrator>,
    pub auth: Arc<AuthGate>,
    pub rate_limiter: Arc<RateLimiter>,
    pub response_cache: Arc<ResponseCache>,
    pub metrics: Arc<AppMetrics>,
}

impl AppState {
    pub fn new(
        config: GatewayConfig,
        backends: Vec<Arc<dyn InferenceBackend>>,
    ) -> Result<Self, ConfigError> {
        let router = BackendRouter::new(backends, config.routes);
        let images = ImageNormalizer::new(config.images)?;
        let orchestrator = Orchestrator::new(router, images, config.retry.clone());
        Ok(Self {
            auth: Arc::new(AuthGate::new(config.api_key.as_deref(), config.environment)),
            rate_limiter: Arc::new(RateLimiter::new(config.rate_limit)),
            response_cache: Arc::new(ResponseCache::from_settings(&config.cache)),
            orchestrator: Arc::new(orchestrator),
            metrics: Arc::new(AppMetrics::new()),
            config: Arc::new(config),
        })
    }

    /// Requires [`TEST_API_KEY`] and retries almost immediately.
    pub fn new_for_tests(backends: Vec<Arc<dyn InferenceBackend>>) -> Self {
        Self::new_for_tests_with(GatewayConfig::default(), backends)
    }

    /// Like [`AppState::new_for_tests`] on top of `config`. A Redis URL is
    /// dropped so the cache, if enabled, stays in memory.
    pub fn new_for_tests_with(
        mut config: GatewayConfig,
        backends: Vec<Arc<dyn InferenceBackend>>,
    ) -> Self {
        config.api_key = Some(TEST_API_KEY.to_owned());
        config.retry = RetrySettings {
            base_backoff: Duration::from_millis(1),
            multiplier: 2.0,
            max_backoff: Duration::from_millis(10),
            jitter: 0.0,
            deadline: Duration::from_secs(5),
        };
        config.cache.redis_url = None;
        Self::new(config, backends).unwrap_or_else(|error| panic!("test state: {error}"))
    }
}
