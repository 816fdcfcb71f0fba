pub mod hosted;
pub mod local;
pub mod mock;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::{header::HeaderMap, StatusCode};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::{
    config::{BackendConfig, BackendKind, ConfigError},
    image::CanonicalImage,
    models::Capability,
    retry::{Classify, ErrorClass},
};

pub use hosted::HostedBackend;
pub use local::LocalBackend;
pub use mock::MockBackend;

const ERROR_BODY_LIMIT: usize = 400;

#[async_trait]
pub trait InferenceBackend: Send + Sync {
    fn name(&self) -> &str;

    fn config(&self) -> &BackendConfig;

    fn kind(&self) -> BackendKind {
        self.config().kind
    }

    /// One attempt. Retries are the caller's concern.
    async fn submit(&self, request: &InferenceRequest) -> Result<RawBackendResponse, BackendError>;

    /// Cheap check used by the health endpoint that the server is reachable
    /// and serves `model`.
    async fn probe(&self, model: &str) -> Result<(), BackendError>;
}

/// Builds the concrete client for a configured backend.
pub fn connect(config: &BackendConfig) -> Result<Arc<dyn InferenceBackend>, ConfigError> {
    Ok(match config.kind {
        BackendKind::Hosted => Arc::new(HostedBackend::new(config.clone())?),
        BackendKind::Local => Arc::new(LocalBackend::new(config.clone())?),
    })
}

/// A single provider-agnostic inference call. Immutable once built; retries
/// resubmit the same value.
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    request_id: String,
    capability: Capability,
    backend: BackendKind,
    model: String,
    prompt: String,
    image: Option<CanonicalImage>,
}

impl InferenceRequest {
    pub fn new(
        capability: Capability,
        backend: &BackendConfig,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            capability,
            backend: backend.kind,
            model: backend.model_for(capability).to_owned(),
            prompt: prompt.into(),
            image: None,
        }
    }

    pub fn with_image(mut self, image: CanonicalImage) -> Self {
        self.image = Some(image);
        self
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn capability(&self) -> Capability {
        self.capability
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn image(&self) -> Option<&CanonicalImage> {
        self.image.as_ref()
    }
}

/// Provider-agnostic envelope around whatever the backend generated.
#[derive(Debug, Clone, PartialEq)]
pub struct RawBackendResponse {
    pub backend: BackendKind,
    pub model: String,
    pub text: String,
    /// Present when the generated text is itself a JSON document.
    pub structured: Option<Value>,
    pub success: bool,
    pub finish_reason: Option<String>,
}

impl RawBackendResponse {
    pub fn from_text(backend: BackendKind, model: impl Into<String>, text: impl Into<String>) -> Self {
        let text = text.into();
        let structured = serde_json::from_str::<Value>(text.trim())
            .ok()
            .filter(|value| value.is_object() || value.is_array());
        Self {
            backend,
            model: model.into(),
            text,
            structured,
            success: true,
            finish_reason: None,
        }
    }

    pub fn with_finish_reason(mut self, reason: Option<String>) -> Self {
        self.finish_reason = reason;
        self
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("backend unreachable: {0}")]
    Unreachable(String),
    #[error("backend timeout: {0}")]
    Timeout(String),
    #[error("backend rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },
    #[error("backend rejected request: {0}")]
    Rejected(String),
    #[error("backend response malformed: {0}")]
    MalformedResponse(String),
}

impl BackendError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BackendError::Unreachable(_) | BackendError::Timeout(_) | BackendError::RateLimited { .. }
        )
    }

    pub fn classification(&self) -> &'static str {
        match self {
            BackendError::Unreachable(_) => "backend_unreachable",
            BackendError::Timeout(_) => "backend_timeout",
            BackendError::RateLimited { .. } => "backend_rate_limited",
            BackendError::Rejected(_) => "backend_rejected",
            BackendError::MalformedResponse(_) => "backend_malformed_response",
        }
    }

    pub fn from_reqwest(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            BackendError::Timeout(error.to_string())
        } else if error.is_decode() {
            BackendError::MalformedResponse(error.to_string())
        } else {
            BackendError::Unreachable(error.to_string())
        }
    }

    /// Maps a non-success upstream status. 5xx is treated as a transient
    /// outage, 408/504 as a timeout, 429 as throttling and any other 4xx
    /// as a rejection of the request itself.
    pub fn from_status(status: StatusCode, headers: &HeaderMap, body: &str) -> Self {
        let trimmed = body.chars().take(ERROR_BODY_LIMIT).collect::<String>();
        let detail = format!("status {}: {trimmed}", status.as_u16());
        match status {
            StatusCode::TOO_MANY_REQUESTS => BackendError::RateLimited {
                message: detail,
                retry_after: retry_after(headers),
            },
            StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => BackendError::Timeout(detail),
            status if status.is_server_error() => BackendError::Unreachable(detail),
            _ => BackendError::Rejected(detail),
        }
    }
}

impl Classify for BackendError {
    fn class(&self) -> ErrorClass {
        if self.is_retryable() {
            ErrorClass::Transient
        } else {
            ErrorClass::Permanent
        }
    }

    fn next_wait(&self, scheduled: Duration) -> Duration {
        match self {
            BackendError::RateLimited { retry_after, .. } => {
                let doubled = scheduled.saturating_mul(2);
                retry_after.map_or(doubled, |hint| hint.max(doubled))
            }
            _ => scheduled,
        }
    }

    fn deadline_exceeded(budget: Duration) -> Self {
        BackendError::Timeout(format!(
            "no response within the {}ms deadline",
            budget.as_millis()
        ))
    }
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Reads the body of a non-success response and classifies it.
pub(crate) async fn error_from_response(response: reqwest::Response) -> BackendError {
    let status = response.status();
    let headers = response.headers().clone();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "unknown backend error".to_owned());
    BackendError::from_status(status, &headers, &body)
}

#[cfg(test)]
mod tests {
    use reqwest::header::{HeaderValue, RETRY_AFTER};

    use super::*;

    #[test]
    fn status_codes_map_to_error_classes() {
        let headers = HeaderMap::new();
        assert!(matches!(
            BackendError::from_status(StatusCode::SERVICE_UNAVAILABLE, &headers, "down"),
            BackendError::Unreachable(_)
        ));
        assert!(matches!(
            BackendError::from_status(StatusCode::GATEWAY_TIMEOUT, &headers, ""),
            BackendError::Timeout(_)
        ));
        assert!(matches!(
            BackendError::from_status(StatusCode::NOT_FOUND, &headers, "no such model"),
            BackendError::Rejected(_)
        ));
        assert!(!BackendError::Rejected(String::new()).is_retryable());
        assert!(!BackendError::MalformedResponse(String::new()).is_retryable());
    }

    #[test]
    fn rate_limit_honours_retry_after() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));
        let error = BackendError::from_status(StatusCode::TOO_MANY_REQUESTS, &headers, "slow down");

        assert_eq!(
            error,
            BackendError::RateLimited {
                message: "status 429: slow down".to_owned(),
                retry_after: Some(Duration::from_secs(7)),
            }
        );
        assert_eq!(error.class(), ErrorClass::Transient);
        assert_eq!(
            error.next_wait(Duration::from_secs(1)),
            Duration::from_secs(7)
        );
    }

    #[test]
    fn rate_limit_without_hint_doubles_the_backoff() {
        let error = BackendError::RateLimited {
            message: "busy".to_owned(),
            retry_after: None,
        };
        assert_eq!(
            error.next_wait(Duration::from_millis(500)),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn error_bodies_are_truncated() {
        let body = "x".repeat(1_000);
        let BackendError::Rejected(detail) =
            BackendError::from_status(StatusCode::BAD_REQUEST, &HeaderMap::new(), &body)
        else {
            panic!("expected a rejection");
        };
        assert!(detail.len() < 420);
    }

    #[test]
    fn json_text_is_exposed_as_structured_output() {
        let raw = RawBackendResponse::from_text(BackendKind::Local, "m", r#"[{"name":"egg"}]"#);
        assert!(raw.structured.is_some());

        let raw = RawBackendResponse::from_text(BackendKind::Local, "m", "tomato, onion");
        assert!(raw.structured.is_none());
        assert!(raw.success);
    }
}
