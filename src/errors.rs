use axum::{
    http::{HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::{
    backend::BackendError,
    image::ImageError,
    orchestrator::OrchestrationError,
};

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    PayloadTooLarge(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{message}")]
    RateLimited {
        message: String,
        headers: Vec<(String, String)>,
    },
    #[error(transparent)]
    Orchestration(#[from] OrchestrationError),
    #[error("{0}")]
    Internal(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::Orchestration(error) => orchestration_status(error),
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn classification(&self) -> &'static str {
        match self {
            AppError::BadRequest(_) => "input_error",
            AppError::PayloadTooLarge(_) => "payload_too_large",
            AppError::Unauthorized(_) => "authentication_error",
            AppError::RateLimited { .. } => "rate_limit_error",
            AppError::Orchestration(error) => error.classification(),
            AppError::Internal(_) => "server_error",
        }
    }
}

fn orchestration_status(error: &OrchestrationError) -> StatusCode {
    match error {
        OrchestrationError::Input { .. } => StatusCode::BAD_REQUEST,
        OrchestrationError::Image { source, .. } => match source {
            ImageError::InvalidInput(_) | ImageError::DecodeFailed(_) => StatusCode::BAD_REQUEST,
            ImageError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ImageError::FetchFailed(_) => StatusCode::BAD_GATEWAY,
        },
        OrchestrationError::BackendNotConfigured { .. } => StatusCode::SERVICE_UNAVAILABLE,
        OrchestrationError::Backend { source, .. } => match source {
            BackendError::Unreachable(_) | BackendError::RateLimited { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            BackendError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            BackendError::Rejected(_) | BackendError::MalformedResponse(_) => StatusCode::BAD_GATEWAY,
        },
        OrchestrationError::InvalidOutput { .. } => StatusCode::BAD_GATEWAY,
    }
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    #[serde(rename = "type")]
    error_type: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<ErrorDetails>,
}

#[derive(Debug, Serialize)]
struct ErrorDetails {
    capability: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    backend: Option<&'static str>,
    attempts: usize,
    retryable: bool,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let error_type = self.classification();
        let details = match &self {
            AppError::Orchestration(error) => Some(ErrorDetails {
                capability: error.capability().as_str(),
                backend: error.backend().map(|backend| backend.as_str()),
                attempts: error.attempts().len(),
                retryable: error.is_retryable(),
            }),
            _ => None,
        };
        let message = match &self {
            AppError::Internal(_) => "internal server error".to_owned(),
            other => other.to_string(),
        };

        let mut response = (
            status,
            Json(ErrorEnvelope {
                error: ErrorBody {
                    error_type,
                    message,
                    details,
                },
            }),
        )
            .into_response();

        if let AppError::RateLimited { headers, .. } = self {
            for (name, value) in headers {
                apply_header(response.headers_mut(), &name, &value);
            }
        }
        response
    }
}

pub fn apply_header(headers: &mut axum::http::HeaderMap, name: &str, value: &str) {
    let Ok(header_name) = HeaderName::from_bytes(name.as_bytes()) else {
        return;
    };
    let Ok(header_value) = HeaderValue::from_str(value) else {
        return;
    };
    headers.insert(header_name, header_value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::BackendKind, models::Capability};

    fn backend_failure(source: BackendError) -> AppError {
        AppError::Orchestration(OrchestrationError::Backend {
            capability: Capability::SuggestRecipes,
            backend: BackendKind::Local,
            attempts: Vec::new(),
            exhausted: None,
            source,
        })
    }

    #[test]
    fn backend_failures_map_to_gateway_statuses() {
        assert_eq!(
            backend_failure(BackendError::Unreachable("refused".into())).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            backend_failure(BackendError::Timeout("slow".into())).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            backend_failure(BackendError::Rejected("bad model".into())).status(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn image_failures_map_to_client_statuses() {
        let too_large = AppError::Orchestration(OrchestrationError::Image {
            capability: Capability::RecognizeIngredients,
            source: ImageError::TooLarge { size: 20, limit: 10 },
        });
        assert_eq!(too_large.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(too_large.classification(), "image_too_large");
    }
}
