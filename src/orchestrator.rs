//! Per-capability entry points: validate, pick the backend, normalize the
//! image, call the backend under the retry supervisor and parse the output.

use std::{sync::Arc, time::Duration};

use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::{
    backend::{BackendError, InferenceBackend, InferenceRequest, RawBackendResponse},
    config::{BackendKind, RetrySettings},
    image::{ImageError, ImageNormalizer},
    models::{
        Capability, IngredientRecognitionRequest, IngredientRecognitionResponse, InputError,
        PersonalizedSuggestionRequest, PersonalizedSuggestionResponse, RecipeDetailsRequest,
        RecipeDetailsResponse, RecipeSuggestionRequest, RecipeSuggestionResponse,
    },
    parsing::{self, ParseError},
    prompts, recipes,
    retry::{AttemptOutcome, ExhaustionReason, Supervisor, SupervisorError},
    router::BackendRouter,
};

/// A fully successful capability call. Failures are always an
/// [`OrchestrationError`], never a result with an empty payload.
#[derive(Debug, Clone)]
pub struct InferenceResult<T> {
    pub capability: Capability,
    pub backend: BackendKind,
    pub model: String,
    pub raw: RawBackendResponse,
    pub payload: T,
    pub latency: Duration,
    pub attempts: Vec<AttemptOutcome>,
}

impl<T> InferenceResult<T> {
    pub fn attempt_count(&self) -> u32 {
        self.attempts.len() as u32
    }
}

#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error("{capability}: invalid input: {source}")]
    Input {
        capability: Capability,
        #[source]
        source: InputError,
    },
    #[error("{capability}: {source}")]
    Image {
        capability: Capability,
        #[source]
        source: ImageError,
    },
    #[error("{capability}: {backend} backend is not configured")]
    BackendNotConfigured {
        capability: Capability,
        backend: BackendKind,
    },
    #[error("{capability}: {backend} backend failed after {} attempt(s): {source}", .attempts.len())]
    Backend {
        capability: Capability,
        backend: BackendKind,
        attempts: Vec<AttemptOutcome>,
        exhausted: Option<ExhaustionReason>,
        #[source]
        source: BackendError,
    },
    #[error("{capability}: {backend} backend returned unusable output: {source}")]
    InvalidOutput {
        capability: Capability,
        backend: BackendKind,
        #[source]
        source: ParseError,
    },
}

impl OrchestrationError {
    pub fn capability(&self) -> Capability {
        match self {
            OrchestrationError::Input { capability, .. }
            | OrchestrationError::Image { capability, .. }
            | OrchestrationError::BackendNotConfigured { capability, .. }
            | OrchestrationError::Backend { capability, .. }
            | OrchestrationError::InvalidOutput { capability, .. } => *capability,
        }
    }

    pub fn backend(&self) -> Option<BackendKind> {
        match self {
            OrchestrationError::BackendNotConfigured { backend, .. }
            | OrchestrationError::Backend { backend, .. }
            | OrchestrationError::InvalidOutput { backend, .. } => Some(*backend),
            _ => None,
        }
    }

    /// Stable string callers can branch on.
    pub fn classification(&self) -> &'static str {
        match self {
            OrchestrationError::Input { .. } => "input_error",
            OrchestrationError::Image { source, .. } => source.classification(),
            OrchestrationError::BackendNotConfigured { .. } => "backend_not_configured",
            OrchestrationError::Backend { source, .. } => source.classification(),
            OrchestrationError::InvalidOutput { .. } => "invalid_model_output",
        }
    }

    /// Whether the client may reasonably try the same request again later.
    pub fn is_retryable(&self) -> bool {
        match self {
            OrchestrationError::Image { source, .. } => {
                matches!(source, ImageError::FetchFailed(_))
            }
            OrchestrationError::Backend { source, .. } => source.is_retryable(),
            OrchestrationError::BackendNotConfigured { .. } => true,
            OrchestrationError::Input { .. } | OrchestrationError::InvalidOutput { .. } => false,
        }
    }

    pub fn attempts(&self) -> &[AttemptOutcome] {
        match self {
            OrchestrationError::Backend { attempts, .. } => attempts,
            _ => &[],
        }
    }
}

pub struct Orchestrator {
    router: BackendRouter,
    images: ImageNormalizer,
    retry: RetrySettings,
}

impl Orchestrator {
    pub fn new(router: BackendRouter, images: ImageNormalizer, retry: RetrySettings) -> Self {
        Self {
            router,
            images,
            retry,
        }
    }

    pub fn router(&self) -> &BackendRouter {
        &self.router
    }

    pub async fn recognize_ingredients(
        &self,
        request: IngredientRecognitionRequest,
    ) -> Result<InferenceResult<IngredientRecognitionResponse>, OrchestrationError> {
        let capability = Capability::RecognizeIngredients;
        let started = Instant::now();
        let source = request
            .image_input()
            .map_err(|source| OrchestrationError::Input { capability, source })?;
        let backend = self.resolve(capability)?;
        let image = self
            .images
            .normalize(source)
            .await
            .map_err(|source| OrchestrationError::Image { capability, source })?;

        let inference = InferenceRequest::new(capability, backend.config(), prompts::recognize_ingredients())
            .with_image(image);
        self.run(capability, backend, inference, started, |raw| {
            let ingredients = parsing::parse_ingredients(raw);
            Ok(IngredientRecognitionResponse {
                ingredients,
                processing_time: round_secs(started.elapsed()),
            })
        })
        .await
    }

    pub async fn suggest_recipes(
        &self,
        request: RecipeSuggestionRequest,
    ) -> Result<InferenceResult<RecipeSuggestionResponse>, OrchestrationError> {
        let capability = Capability::SuggestRecipes;
        let started = Instant::now();
        let request = request
            .normalized()
            .map_err(|source| OrchestrationError::Input { capability, source })?;
        let backend = self.resolve(capability)?;

        let inference = InferenceRequest::new(capability, backend.config(), prompts::suggest_recipes(&request));
        self.run(capability, backend, inference, started, |raw| {
            let mut found = parsing::parse_recipes(raw, &request.ingredients)?;
            if let Some(filters) = &request.filters {
                found = recipes::apply_filters(found, filters);
            }
            let found = recipes::rank(found, request.max_results);
            Ok(RecipeSuggestionResponse {
                total_results: found.len(),
                recipes: found,
            })
        })
        .await
    }

    pub async fn generate_recipe_details(
        &self,
        request: RecipeDetailsRequest,
    ) -> Result<InferenceResult<RecipeDetailsResponse>, OrchestrationError> {
        let capability = Capability::GenerateRecipeDetails;
        let started = Instant::now();
        let request = request
            .normalized()
            .map_err(|source| OrchestrationError::Input { capability, source })?;
        let backend = self.resolve(capability)?;

        let inference = InferenceRequest::new(capability, backend.config(), prompts::recipe_details(&request));
        self.run(capability, backend, inference, started, |raw| {
            parsing::parse_recipe_details(raw, &request)
        })
        .await
    }

    pub async fn personalize(
        &self,
        request: PersonalizedSuggestionRequest,
    ) -> Result<InferenceResult<PersonalizedSuggestionResponse>, OrchestrationError> {
        let capability = Capability::Personalize;
        let started = Instant::now();
        let request = request
            .normalized()
            .map_err(|source| OrchestrationError::Input { capability, source })?;
        let backend = self.resolve(capability)?;

        let inference = InferenceRequest::new(capability, backend.config(), prompts::personalize(&request));
        self.run(capability, backend, inference, started, |raw| {
            let found = parsing::parse_recipes(raw, &request.ingredients)?;
            let preferences = request.preferences.as_ref();
            Ok(PersonalizedSuggestionResponse {
                recipes: recipes::rank(found, request.max_results),
                personalization_score: recipes::personalization_score(
                    &request.cooking_history,
                    preferences,
                ),
                recommendation_reason: Some(recipes::recommendation_reason(
                    &request.cooking_history,
                    preferences,
                )),
            })
        })
        .await
    }

    fn resolve(&self, capability: Capability) -> Result<Arc<dyn InferenceBackend>, OrchestrationError> {
        self.router
            .resolve(capability)
            .ok_or_else(|| OrchestrationError::BackendNotConfigured {
                capability,
                backend: self.router.route_for(capability),
            })
    }

    async fn run<T, P>(
        &self,
        capability: Capability,
        backend: Arc<dyn InferenceBackend>,
        request: InferenceRequest,
        started: Instant,
        parse: P,
    ) -> Result<InferenceResult<T>, OrchestrationError>
    where
        P: FnOnce(&RawBackendResponse) -> Result<T, ParseError>,
    {
        let kind = backend.kind();
        let supervisor = Supervisor::new(self.retry.policy_for(backend.config()));
        let supervised = supervisor
            .execute(|_| backend.submit(&request))
            .await
            .map_err(|error| {
                let exhausted = error.exhaustion();
                let (source, attempts) = match error {
                    SupervisorError::Permanent { error, attempts } => (error, attempts),
                    SupervisorError::Exhausted(exhausted) => (exhausted.last_error, exhausted.attempts),
                };
                warn!(
                    capability = %capability,
                    backend = %kind,
                    request_id = request.request_id(),
                    attempts = attempts.len(),
                    classification = source.classification(),
                    "inference failed"
                );
                OrchestrationError::Backend {
                    capability,
                    backend: kind,
                    attempts,
                    exhausted,
                    source,
                }
            })?;

        let raw = supervised.value;
        let payload = parse(&raw).map_err(|source| {
            warn!(
                capability = %capability,
                backend = %kind,
                request_id = request.request_id(),
                output = %raw.text.chars().take(400).collect::<String>(),
                "model output could not be parsed"
            );
            OrchestrationError::InvalidOutput {
                capability,
                backend: kind,
                source,
            }
        })?;

        let latency = started.elapsed();
        info!(
            capability = %capability,
            backend = %kind,
            model = request.model(),
            request_id = request.request_id(),
            attempts = supervised.attempts.len(),
            elapsed_ms = latency.as_millis() as u64,
            "inference completed"
        );

        Ok(InferenceResult {
            capability,
            backend: kind,
            model: request.model().to_owned(),
            raw,
            payload,
            latency,
            attempts: supervised.attempts,
        })
    }
}

fn round_secs(elapsed: Duration) -> f64 {
    (elapsed.as_secs_f64() * 100.0).round() / 100.0
}
