//! Hosted multimodal API (Gemini `generateContent` wire format).

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    backend::{error_from_response, BackendError, InferenceBackend, InferenceRequest, RawBackendResponse},
    config::{BackendConfig, ConfigError},
};

const API_KEY_HEADER: &str = "x-goog-api-key";
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Clone)]
pub struct HostedBackend {
    client: reqwest::Client,
    config: BackendConfig,
    api_key: String,
}

impl HostedBackend {
    pub fn new(config: BackendConfig) -> Result<Self, ConfigError> {
        let api_key = config
            .api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .ok_or(ConfigError::MissingApiKey(config.kind))?;
        let client = reqwest::Client::builder()
            .timeout(config.effective_timeout())
            .build()
            .map_err(|error| ConfigError::HttpClient(error.to_string()))?;

        Ok(Self {
            client,
            config,
            api_key,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.endpoint, path.trim_start_matches('/'))
    }
}

#[async_trait]
impl InferenceBackend for HostedBackend {
    fn name(&self) -> &str {
        "gemini"
    }

    fn config(&self) -> &BackendConfig {
        &self.config
    }

    async fn submit(&self, request: &InferenceRequest) -> Result<RawBackendResponse, BackendError> {
        let mut parts = vec![Part::Text {
            text: request.prompt(),
        }];
        if let Some(image) = request.image() {
            parts.push(Part::InlineData {
                inline_data: InlineData {
                    mime_type: image.mime_type(),
                    data: image.base64(),
                },
            });
        }
        let payload = GenerateContentRequest {
            contents: vec![Content { role: "user", parts }],
        };

        let response = self
            .client
            .post(self.url(&format!("models/{}:generateContent", request.model())))
            .header(API_KEY_HEADER, &self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(BackendError::from_reqwest)?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let body = response.text().await.map_err(BackendError::from_reqwest)?;
        let parsed: GenerateContentResponse = serde_json::from_str(&body).map_err(|error| {
            warn!(
                backend = self.name(),
                request_id = request.request_id(),
                body = %body.chars().take(400).collect::<String>(),
                "unparsable response body"
            );
            BackendError::MalformedResponse(error.to_string())
        })?;

        if let Some(reason) = parsed
            .prompt_feedback
            .as_ref()
            .and_then(|feedback| feedback.block_reason.as_deref())
        {
            return Err(BackendError::Rejected(format!("prompt blocked: {reason}")));
        }

        let candidate = parsed.candidates.into_iter().next().ok_or_else(|| {
            BackendError::MalformedResponse("missing candidates in response".to_owned())
        })?;
        let text = candidate
            .content
            .map(|content| {
                content
                    .parts
                    .into_iter()
                    .filter_map(|part| part.text)
                    .collect::<String>()
            })
            .unwrap_or_default();
        if text.trim().is_empty() {
            return Err(BackendError::MalformedResponse(
                "response contained no generated text".to_owned(),
            ));
        }

        debug!(
            backend = self.name(),
            request_id = request.request_id(),
            chars = text.len(),
            "generation finished"
        );
        Ok(
            RawBackendResponse::from_text(self.config.kind, request.model(), text)
                .with_finish_reason(candidate.finish_reason),
        )
    }

    async fn probe(&self, model: &str) -> Result<(), BackendError> {
        let response = self
            .client
            .get(self.url(&format!("models/{model}")))
            .header(API_KEY_HEADER, &self.api_key)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .map_err(BackendError::from_reqwest)?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(error_from_response(response).await)
        }
    }
}

#[derive(Debug, Serialize)]
struct GenerateContentRequest<'a> {
    contents: Vec<Content<'a>>,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    role: &'static str,
    parts: Vec<Part<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Part<'a> {
    Text { text: &'a str },
    InlineData { inline_data: InlineData<'a> },
}

#[derive(Debug, Serialize)]
struct InlineData<'a> {
    mime_type: &'static str,
    data: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}
