use std::time::Duration;

use prometheus::{
    core::Collector, opts, Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge,
    Registry, TextEncoder,
};

use crate::{orchestrator::OrchestrationError, retry::AttemptOutcome};

const LATENCY_BUCKETS: &[f64] = &[0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0];

/// Prometheus collectors for the gateway, kept in a private registry so
/// every `AppState` renders only its own series.
#[derive(Clone)]
pub struct AppMetrics {
    registry: Registry,
    http_requests: IntCounterVec,
    http_latency: HistogramVec,
    inflight: IntGauge,
    backend_attempts: IntCounterVec,
    capability_failures: IntCounterVec,
}

pub struct InflightGuard<'a> {
    metrics: &'a AppMetrics,
}

fn register<C>(registry: &Registry, collector: C) -> C
where
    C: Collector + Clone + 'static,
{
    registry
        .register(Box::new(collector.clone()))
        .expect("metric names are unique");
    collector
}

impl AppMetrics {
    pub fn new() -> Self {
        let registry = Registry::new_custom(Some("chefassist".to_owned()), None)
            .expect("static registry prefix");

        let http_requests = register(
            &registry,
            IntCounterVec::new(
                opts!("http_requests_total", "HTTP requests by route and status"),
                &["path", "method", "status"],
            )
            .expect("valid http_requests_total"),
        );
        let http_latency = register(
            &registry,
            HistogramVec::new(
                HistogramOpts::new("http_request_duration_seconds", "HTTP request latency")
                    .buckets(LATENCY_BUCKETS.to_vec()),
                &["path", "method"],
            )
            .expect("valid http_request_duration_seconds"),
        );
        let inflight = register(
            &registry,
            IntGauge::new("http_inflight_requests", "Requests currently being served")
                .expect("valid http_inflight_requests"),
        );
        let backend_attempts = register(
            &registry,
            IntCounterVec::new(
                opts!(
                    "backend_attempts_total",
                    "Backend call attempts by backend, capability and outcome"
                ),
                &["backend", "capability", "outcome"],
            )
            .expect("valid backend_attempts_total"),
        );
        let capability_failures = register(
            &registry,
            IntCounterVec::new(
                opts!(
                    "capability_failures_total",
                    "Failed capability calls by error classification"
                ),
                &["capability", "classification"],
            )
            .expect("valid capability_failures_total"),
        );

        Self {
            registry,
            http_requests,
            http_latency,
            inflight,
            backend_attempts,
            capability_failures,
        }
    }

    pub fn inflight_guard(&self) -> InflightGuard<'_> {
        self.inflight.inc();
        InflightGuard { metrics: self }
    }

    pub fn observe_request(&self, path: &str, method: &str, status: u16, duration: Duration) {
        self.http_requests
            .with_label_values(&[path, method, &status.to_string()])
            .inc();
        self.http_latency
            .with_label_values(&[path, method])
            .observe(duration.as_secs_f64());
    }

    /// One increment per attempt, labelled with how that attempt ended.
    pub fn observe_attempts(&self, backend: &str, capability: &str, attempts: &[AttemptOutcome]) {
        for attempt in attempts {
            self.backend_attempts
                .with_label_values(&[backend, capability, attempt.class.as_str()])
                .inc();
        }
    }

    pub fn observe_failure(&self, error: &OrchestrationError) {
        let capability = error.capability().as_str();
        if let Some(backend) = error.backend() {
            self.observe_attempts(backend.as_str(), capability, error.attempts());
        }
        self.capability_failures
            .with_label_values(&[capability, error.classification()])
            .inc();
    }

    pub fn render(&self) -> Result<String, String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|error| error.to_string())?;
        String::from_utf8(buffer).map_err(|error| error.to_string())
    }
}

impl Default for AppMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.metrics.inflight.dec();
    }
}
