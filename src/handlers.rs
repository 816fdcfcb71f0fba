use std::{future::Future, sync::Arc, time::Instant};

use axum::{
    extract::{rejection::JsonRejection, State},
    http::{header::CONTENT_TYPE, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;
use tracing::info;

use crate::{
    cache::{cache_key, CachedResponse},
    config::BackendKind,
    errors::{apply_header, AppError},
    limits::{client_key, RateLimitSnapshot},
    models::{
        Capability, IngredientRecognitionRequest, PersonalizedSuggestionRequest, RecipeDetailsRequest,
        RecipeSuggestionRequest,
    },
    orchestrator::{InferenceResult, OrchestrationError, Orchestrator},
    state::AppState,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Room for the JSON envelope and a `data:` prefix around an inline image.
const BODY_OVERHEAD_BYTES: usize = 64 * 1024;

/// Largest request body accepted: a base64 image at the configured ceiling
/// plus envelope overhead.
pub fn body_limit(max_image_bytes: usize) -> usize {
    max_image_bytes
        .div_ceil(3)
        .saturating_mul(4)
        .saturating_add(BODY_OVERHEAD_BYTES)
}

pub async fn healthz() -> &'static str {
    "ok"
}

pub async fn root(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "service": state.config.service_name,
        "version": VERSION,
        "status": "running"
    }))
}

pub async fn api_info() -> Json<serde_json::Value> {
    Json(json!({
        "service": "ChefAssist AI Service",
        "version": VERSION,
        "endpoints": {
            "recognize_ingredients": {
                "method": "POST",
                "path": "/api/ai/recognize-ingredients",
                "description": "Recognize ingredients from uploaded images"
            },
            "suggest_recipes": {
                "method": "POST",
                "path": "/api/ai/suggest-recipes",
                "description": "Get recipe suggestions based on ingredients"
            },
            "generate_recipe_details": {
                "method": "POST",
                "path": "/api/ai/generate-recipe-details",
                "description": "Generate detailed recipe instructions"
            },
            "personalize_suggestions": {
                "method": "POST",
                "path": "/api/ai/personalize-suggestions",
                "description": "Get personalized recipe suggestions"
            },
            "health": {
                "method": "GET",
                "path": "/api/ai/health",
                "description": "Service health check"
            }
        }
    }))
}

pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let router = state.orchestrator.router();
    let backends = router.health().await;
    let routes = router.routes();
    let serving_ok = [routes.vision, routes.text].iter().all(|kind| {
        backends
            .iter()
            .any(|entry| entry.backend == *kind && entry.reachable)
    });

    Json(json!({
        "status": if serving_ok { "healthy" } else { "degraded" },
        "service": state.config.service_name,
        "version": VERSION,
        "routes": {
            "vision": routes.vision,
            "text": routes.text
        },
        "backends": backends,
        "cache": state.response_cache.describe()
    }))
}

pub async fn metrics(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok(body) => (
            [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(error) => AppError::Internal(format!("metrics render failed: {error}")).into_response(),
    }
}

pub async fn recognize_ingredients(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<IngredientRecognitionRequest>, JsonRejection>,
) -> Response {
    serve(
        state,
        "/api/ai/recognize-ingredients",
        None,
        headers,
        body,
        |orchestrator, request| async move { orchestrator.recognize_ingredients(request).await },
    )
    .await
}

pub async fn suggest_recipes(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<RecipeSuggestionRequest>, JsonRejection>,
) -> Response {
    serve(
        state,
        "/api/ai/suggest-recipes",
        Some(Capability::SuggestRecipes),
        headers,
        body,
        |orchestrator, request| async move { orchestrator.suggest_recipes(request).await },
    )
    .await
}

pub async fn generate_recipe_details(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<RecipeDetailsRequest>, JsonRejection>,
) -> Response {
    serve(
        state,
        "/api/ai/generate-recipe-details",
        Some(Capability::GenerateRecipeDetails),
        headers,
        body,
        |orchestrator, request| async move { orchestrator.generate_recipe_details(request).await },
    )
    .await
}

pub async fn personalize_suggestions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<PersonalizedSuggestionRequest>, JsonRejection>,
) -> Response {
    serve(
        state,
        "/api/ai/personalize-suggestions",
        Some(Capability::Personalize),
        headers,
        body,
        |orchestrator, request| async move { orchestrator.personalize(request).await },
    )
    .await
}

/// Shared request path: gate, limiter, body, cache, orchestrator, metrics.
/// `cache_as` names the capability whose successful responses may be cached.
async fn serve<Req, Res, F, Fut>(
    state: AppState,
    path: &'static str,
    cache_as: Option<Capability>,
    headers: HeaderMap,
    body: Result<Json<Req>, JsonRejection>,
    call: F,
) -> Response
where
    Req: Serialize,
    Res: Serialize,
    F: FnOnce(Arc<Orchestrator>, Req) -> Fut,
    Fut: Future<Output = Result<InferenceResult<Res>, OrchestrationError>>,
{
    let started = Instant::now();
    let _inflight = state.metrics.inflight_guard();

    let response = match process(&state, cache_as, &headers, body, call).await {
        Ok(response) => response,
        Err(error) => {
            if let AppError::Orchestration(failure) = &error {
                state.metrics.observe_failure(failure);
            }
            error.into_response()
        }
    };

    state.metrics.observe_request(
        path,
        "POST",
        response.status().as_u16(),
        started.elapsed(),
    );
    response
}

async fn process<Req, Res, F, Fut>(
    state: &AppState,
    cache_as: Option<Capability>,
    headers: &HeaderMap,
    body: Result<Json<Req>, JsonRejection>,
    call: F,
) -> Result<Response, AppError>
where
    Req: Serialize,
    Res: Serialize,
    F: FnOnce(Arc<Orchestrator>, Req) -> Fut,
    Fut: Future<Output = Result<InferenceResult<Res>, OrchestrationError>>,
{
    let auth_context = state.auth.authenticate(headers)?;
    let rate_snapshot = state
        .rate_limiter
        .check_and_consume(&client_key(headers, &auth_context))
        .await
        .map_err(|error| AppError::RateLimited {
            message: error.message().to_owned(),
            headers: error.snapshot().to_header_pairs(),
        })?;
    let Json(request) = body.map_err(|rejection| {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            AppError::PayloadTooLarge(rejection.body_text())
        } else {
            AppError::BadRequest(rejection.body_text())
        }
    })?;

    let key = cache_as
        .filter(|_| state.response_cache.enabled())
        .and_then(|capability| cache_key(capability, &request));
    if let Some(key) = &key {
        if let Some(hit) = state.response_cache.get(key).await {
            info!(client = %auth_context.client_id, key = %key, "request served from cache");
            let mut response = Json(hit.payload).into_response();
            decorate(response.headers_mut(), hit.backend, None, Some("hit"), rate_snapshot.as_ref());
            return Ok(response);
        }
    }

    let result = call(state.orchestrator.clone(), request).await?;
    state.metrics.observe_attempts(
        result.backend.as_str(),
        result.capability.as_str(),
        &result.attempts,
    );
    info!(
        client = %auth_context.client_id,
        capability = %result.capability,
        backend = %result.backend,
        attempts = result.attempt_count(),
        elapsed_ms = result.latency.as_millis() as u64,
        "request served"
    );

    let payload = serde_json::to_value(&result.payload)
        .map_err(|error| AppError::Internal(format!("response serialization failed: {error}")))?;
    if let Some(key) = &key {
        state
            .response_cache
            .set(
                key,
                &CachedResponse {
                    backend: result.backend,
                    payload: payload.clone(),
                },
            )
            .await;
    }

    let mut response = Json(payload).into_response();
    decorate(
        response.headers_mut(),
        result.backend,
        Some(result.attempt_count()),
        key.as_ref().map(|_| "miss"),
        rate_snapshot.as_ref(),
    );
    Ok(response)
}

fn decorate(
    headers: &mut HeaderMap,
    backend: BackendKind,
    attempts: Option<u32>,
    cache: Option<&str>,
    rate_snapshot: Option<&RateLimitSnapshot>,
) {
    apply_header(headers, "x-inference-backend", backend.as_str());
    if let Some(attempts) = attempts {
        apply_header(headers, "x-inference-attempts", &attempts.to_string());
    }
    if let Some(cache) = cache {
        apply_header(headers, "x-cache", cache);
    }
    if let Some(snapshot) = rate_snapshot {
        for (name, value) in snapshot.to_header_pairs() {
            apply_header(headers, &name, &value);
        }
    }
}
