use std::{collections::HashMap, sync::Arc, time::Duration};

use futures_util::future::join_all;
use serde::Serialize;
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

use crate::{
    backend::{BackendError, InferenceBackend},
    config::{BackendConfig, BackendKind, CapabilityRoutes},
    models::Capability,
};

const PROBE_LIMIT: Duration = Duration::from_secs(3);

/// Resolves which configured backend serves a capability. Built once at
/// startup and only read afterwards.
#[derive(Clone)]
pub struct BackendRouter {
    backends: HashMap<BackendKind, Arc<dyn InferenceBackend>>,
    routes: CapabilityRoutes,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackendHealth {
    pub backend: BackendKind,
    pub models: Vec<String>,
    pub configured: bool,
    pub reachable: bool,
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BackendRouter {
    pub fn new(backends: Vec<Arc<dyn InferenceBackend>>, routes: CapabilityRoutes) -> Self {
        let mut table = HashMap::new();
        for backend in backends {
            let kind = backend.kind();
            if table.insert(kind, backend).is_some() {
                warn!(backend = %kind, "backend configured twice, keeping the last one");
            }
        }
        Self {
            backends: table,
            routes,
        }
    }

    pub fn routes(&self) -> CapabilityRoutes {
        self.routes
    }

    pub fn route_for(&self, capability: Capability) -> BackendKind {
        self.routes.backend_for(capability)
    }

    /// The backend pinned to `capability`, if it is configured.
    pub fn resolve(&self, capability: Capability) -> Option<Arc<dyn InferenceBackend>> {
        let kind = self.route_for(capability);
        let backend = self.backends.get(&kind).cloned();
        debug!(
            capability = %capability,
            backend = %kind,
            configured = backend.is_some(),
            "backend resolved"
        );
        backend
    }

    /// Models the routes send to `kind`: the vision model for recognition,
    /// the text model for everything else. An unrouted backend reports its
    /// text model.
    fn models_served_by(&self, kind: BackendKind, config: &BackendConfig) -> Vec<String> {
        let mut models = Vec::new();
        if self.routes.vision == kind {
            models.push(config.model_for(Capability::RecognizeIngredients).to_owned());
        }
        if self.routes.text == kind || models.is_empty() {
            models.push(config.model.clone());
        }
        models.dedup();
        models
    }

    /// Probes every known backend concurrently, each bounded to a few seconds.
    pub async fn health(&self) -> Vec<BackendHealth> {
        let probes = BackendKind::ALL.into_iter().map(move |kind| async move {
            let Some(backend) = self.backends.get(&kind) else {
                return BackendHealth {
                    backend: kind,
                    models: Vec::new(),
                    configured: false,
                    reachable: false,
                    latency_ms: None,
                    error: None,
                };
            };

            let models = self.models_served_by(kind, backend.config());
            let started = Instant::now();
            let outcome = timeout(PROBE_LIMIT, async {
                for model in &models {
                    backend.probe(model).await?;
                }
                Ok::<_, BackendError>(())
            })
            .await;
            let latency_ms = Some(started.elapsed().as_millis() as u64);
            let error = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(error)) => Some(error.to_string()),
                Err(_) => Some(format!("probe exceeded {}s", PROBE_LIMIT.as_secs())),
            };
            if let Some(error) = &error {
                warn!(backend = %kind, error = %error, "health probe failed");
            }

            BackendHealth {
                backend: kind,
                models,
                configured: true,
                reachable: error.is_none(),
                latency_ms,
                error,
            }
        });

        join_all(probes).await
    }
}
