pub mod auth;
pub mod backend;
pub mod cache;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod image;
pub mod limits;
pub mod metrics;
pub mod models;
pub mod orchestrator;
pub mod parsing;
pub mod prompts;
pub mod recipes;
pub mod retry;
pub mod router;
pub mod state;

use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use backend::InferenceBackend;
use config::{ConfigError, GatewayConfig};
use tracing::{info, warn};

/// Connects every configured backend and assembles the shared state.
pub fn build_state(config: GatewayConfig) -> Result<state::AppState, ConfigError> {
    let backends = config
        .backends
        .iter()
        .map(backend::connect)
        .collect::<Result<Vec<Arc<dyn InferenceBackend>>, _>>()?;

    for backend in &backends {
        info!(
            backend = %backend.kind(),
            endpoint = %backend.config().endpoint,
            model = %backend.config().model,
            vision_model = backend.config().vision_model.as_deref().unwrap_or("-"),
            max_retries = backend.config().max_retries,
            "backend configured"
        );
    }
    for kind in [config.routes.vision, config.routes.text] {
        if config.backend(kind).is_none() {
            warn!(backend = %kind, "capability routed to a backend that is not configured");
        }
    }
    info!(
        vision = %config.routes.vision,
        text = %config.routes.text,
        environment = ?config.environment,
        "capability routes configured"
    );

    let state = state::AppState::new(config, backends)?;
    info!(
        auth_mode = ?state.auth.mode(),
        rate_limiting = state.rate_limiter.enabled(),
        cache = state.response_cache.describe(),
        "gateway state ready"
    );
    Ok(state)
}

pub fn build_app(state: state::AppState) -> Router {
    let body_limit = handlers::body_limit(state.config.images.max_bytes);
    Router::new()
        .route("/", get(handlers::root))
        .route("/healthz", get(handlers::healthz))
        .route("/metrics", get(handlers::metrics))
        .route("/api/ai", get(handlers::api_info))
        .route("/api/ai/health", get(handlers::health))
        .route(
            "/api/ai/recognize-ingredients",
            post(handlers::recognize_ingredients),
        )
        .route("/api/ai/suggest-recipes", post(handlers::suggest_recipes))
        .route(
            "/api/ai/generate-recipe-details",
            post(handlers::generate_recipe_details),
        )
        .route(
            "/api/ai/personalize-suggestions",
            post(handlers::personalize_suggestions),
        )
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}
