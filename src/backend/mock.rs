use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::time::sleep;

use crate::{
    backend::{BackendError, InferenceBackend, InferenceRequest, RawBackendResponse},
    config::{BackendConfig, BackendKind},
};

type Reply = Result<String, BackendError>;

/// Scripted backend for tests: replays queued replies in order, then keeps
/// answering with the fallback. Records every submitted request.
#[derive(Clone)]
pub struct MockBackend {
    config: BackendConfig,
    script: Arc<Mutex<VecDeque<Reply>>>,
    fallback: Reply,
    delay: Duration,
    calls: Arc<AtomicU32>,
    requests: Arc<Mutex<Vec<InferenceRequest>>>,
    probed: Arc<Mutex<Vec<String>>>,
    probe_result: Result<(), BackendError>,
}

impl MockBackend {
    pub fn new(kind: BackendKind) -> Self {
        Self {
            config: BackendConfig::new(kind, format!("mock://{kind}"), format!("{kind}-text"))
                .with_vision_model(format!("{kind}-vision")),
            script: Arc::new(Mutex::new(VecDeque::new())),
            fallback: Ok("[]".to_owned()),
            delay: Duration::ZERO,
            calls: Arc::new(AtomicU32::new(0)),
            requests: Arc::new(Mutex::new(Vec::new())),
            probed: Arc::new(Mutex::new(Vec::new())),
            probe_result: Ok(()),
        }
    }

    pub fn replying(kind: BackendKind, text: impl Into<String>) -> Self {
        Self::new(kind).with_fallback(Ok(text.into()))
    }

    pub fn failing(kind: BackendKind, error: BackendError) -> Self {
        Self::new(kind).with_fallback(Err(error))
    }

    pub fn with_config(mut self, config: BackendConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.config.max_retries = max_retries;
        self
    }

    pub fn with_fallback(mut self, reply: Reply) -> Self {
        self.fallback = reply;
        self
    }

    pub fn then(self, reply: Reply) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(reply);
        }
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_probe(mut self, result: Result<(), BackendError>) -> Self {
        self.probe_result = result;
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<InferenceRequest> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }

    /// Models passed to `probe`, in call order.
    pub fn probed_models(&self) -> Vec<String> {
        self.probed
            .lock()
            .map(|probed| probed.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl InferenceBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    fn config(&self) -> &BackendConfig {
        &self.config
    }

    async fn submit(&self, request: &InferenceRequest) -> Result<RawBackendResponse, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }

        let reply = self
            .script
            .lock()
            .ok()
            .and_then(|mut script| script.pop_front())
            .unwrap_or_else(|| self.fallback.clone());
        reply.map(|text| RawBackendResponse::from_text(self.config.kind, request.model(), text))
    }

    async fn probe(&self, model: &str) -> Result<(), BackendError> {
        if let Ok(mut probed) = self.probed.lock() {
            probed.push(model.to_owned());
        }
        self.probe_result.clone()
    }
}
