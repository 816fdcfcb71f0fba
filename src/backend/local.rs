//! Locally hosted model server (Ollama chat wire format).

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    backend::{error_from_response, BackendError, InferenceBackend, InferenceRequest, RawBackendResponse},
    config::{BackendConfig, ConfigError},
};

const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Clone)]
pub struct LocalBackend {
    client: reqwest::Client,
    config: BackendConfig,
}

impl LocalBackend {
    pub fn new(config: BackendConfig) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .timeout(config.effective_timeout())
            .build()
            .map_err(|error| ConfigError::HttpClient(error.to_string()))?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.endpoint, path.trim_start_matches('/'))
    }
}

#[async_trait]
impl InferenceBackend for LocalBackend {
    fn name(&self) -> &str {
        "ollama"
    }

    fn config(&self) -> &BackendConfig {
        &self.config
    }

    async fn submit(&self, request: &InferenceRequest) -> Result<RawBackendResponse, BackendError> {
        let payload = ChatRequest {
            model: request.model(),
            messages: vec![ChatMessage {
                role: "user",
                content: request.prompt(),
                images: request.image().map(|image| vec![image.base64()]),
            }],
            stream: false,
            options: ChatOptions {
                temperature: 0.7,
                top_p: 0.9,
            },
        };

        let response = self
            .client
            .post(self.url("/api/chat"))
            .json(&payload)
            .send()
            .await
            .map_err(BackendError::from_reqwest)?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let body = response.text().await.map_err(BackendError::from_reqwest)?;
        let parsed: ChatResponse = serde_json::from_str(&body).map_err(|error| {
            warn!(
                backend = self.name(),
                request_id = request.request_id(),
                body = %body.chars().take(400).collect::<String>(),
                "unparsable response body"
            );
            BackendError::MalformedResponse(error.to_string())
        })?;

        if let Some(error) = parsed.error {
            return Err(BackendError::Rejected(error));
        }

        let text = parsed
            .message
            .map(|message| message.content)
            .filter(|text| !text.trim().is_empty())
            .or_else(|| parsed.response.filter(|text| !text.trim().is_empty()))
            .ok_or_else(|| {
                BackendError::MalformedResponse("response contained no message content".to_owned())
            })?;

        debug!(
            backend = self.name(),
            request_id = request.request_id(),
            chars = text.len(),
            "generation finished"
        );
        Ok(
            RawBackendResponse::from_text(self.config.kind, request.model(), text)
                .with_finish_reason(parsed.done_reason),
        )
    }

    async fn probe(&self, model: &str) -> Result<(), BackendError> {
        let response = self
            .client
            .get(self.url("/api/tags"))
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .map_err(BackendError::from_reqwest)?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let tags = response
            .json::<TagsResponse>()
            .await
            .map_err(|error| BackendError::MalformedResponse(error.to_string()))?;
        let tagged = format!("{model}:");
        if tags
            .models
            .iter()
            .any(|entry| entry.name == model || entry.name.starts_with(&tagged))
        {
            return Ok(());
        }
        warn!(backend = self.name(), model, "model not installed on local server");
        Err(BackendError::Rejected(format!(
            "model {model} is not installed on the local server"
        )))
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
    options: ChatOptions,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    images: Option<Vec<&'a str>>,
}

#[derive(Debug, Serialize)]
struct ChatOptions {
    temperature: f32,
    top_p: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    message: Option<ChatResponseMessage>,
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    #[serde(default)]
    name: String,
}
