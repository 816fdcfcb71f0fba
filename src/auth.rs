use axum::http::HeaderMap;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::{config::Environment, errors::AppError};

pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMode {
    /// A shared secret is configured and must be presented.
    SharedSecret,
    /// No secret outside production: every request is let through.
    Open,
    /// No secret in production: every request is refused.
    Locked,
}

#[derive(Debug, Clone)]
pub struct AuthContext {
    pub client_id: String,
    pub api_key: Option<String>,
}

/// Shared-secret gate in front of the orchestrator. It only answers
/// pass/reject; it never touches request bodies.
#[derive(Clone)]
pub struct AuthGate {
    secret_digest: Option<[u8; 32]>,
    mode: AuthMode,
}

impl AuthGate {
    pub fn new(secret: Option<&str>, environment: Environment) -> Self {
        let secret_digest = secret
            .map(str::trim)
            .filter(|secret| !secret.is_empty())
            .map(digest);
        let mode = match (&secret_digest, environment.is_production()) {
            (Some(_), _) => AuthMode::SharedSecret,
            (None, false) => AuthMode::Open,
            (None, true) => AuthMode::Locked,
        };
        if mode == AuthMode::Open {
            warn!("API_KEY not set, authentication is disabled (development mode)");
        }
        Self {
            secret_digest,
            mode,
        }
    }

    pub fn mode(&self) -> &AuthMode {
        &self.mode
    }

    pub fn authenticate(&self, headers: &HeaderMap) -> Result<AuthContext, AppError> {
        let presented = headers
            .get(API_KEY_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty());

        match (&self.mode, &self.secret_digest) {
            (AuthMode::SharedSecret, Some(expected)) => {
                let api_key = presented.ok_or_else(|| {
                    AppError::Unauthorized(
                        "API key required. Please provide X-API-Key header.".to_owned(),
                    )
                })?;
                if !digests_match(&digest(api_key), expected) {
                    warn!(key = %redact_key(api_key), "invalid api key");
                    return Err(AppError::Unauthorized("Invalid API key".to_owned()));
                }
                debug!(key = %redact_key(api_key), "api key verified");
                Ok(AuthContext {
                    client_id: format!("key_{}", redact_key(api_key)),
                    api_key: Some(api_key.to_owned()),
                })
            }
            (AuthMode::Open, _) => {
                warn!("authentication bypassed: no API key configured (development mode)");
                Ok(AuthContext {
                    client_id: presented
                        .map(|key| format!("key_{}", redact_key(key)))
                        .unwrap_or_else(|| "dev-mode".to_owned()),
                    api_key: presented.map(ToOwned::to_owned),
                })
            }
            _ => Err(AppError::Unauthorized(
                "gateway has no API key configured".to_owned(),
            )),
        }
    }
}

fn digest(value: &str) -> [u8; 32] {
    Sha256::digest(value.as_bytes()).into()
}

fn digests_match(left: &[u8; 32], right: &[u8; 32]) -> bool {
    left.iter()
        .zip(right.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

pub(crate) fn redact_key(key: &str) -> String {
    key.chars().take(6).collect()
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn headers(key: Option<&'static str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(key) = key {
            headers.insert(API_KEY_HEADER, HeaderValue::from_static(key));
        }
        headers
    }

    #[test]
    fn shared_secret_must_match() {
        let gate = AuthGate::new(Some("s3cret-key"), Environment::Production);
        assert_eq!(gate.mode(), &AuthMode::SharedSecret);

        let context = gate
            .authenticate(&headers(Some("s3cret-key")))
            .expect("matching key passes");
        assert_eq!(context.client_id, "key_s3cret");

        assert!(matches!(
            gate.authenticate(&headers(Some("wrong"))),
            Err(AppError::Unauthorized(_))
        ));
        assert!(matches!(
            gate.authenticate(&headers(None)),
            Err(AppError::Unauthorized(_))
        ));
    }

    #[test]
    fn missing_secret_is_open_only_outside_production() {
        let open = AuthGate::new(None, Environment::Development);
        assert_eq!(open.mode(), &AuthMode::Open);
        assert_eq!(
            open.authenticate(&headers(None)).expect("open").client_id,
            "dev-mode"
        );

        let locked = AuthGate::new(Some("  "), Environment::Production);
        assert_eq!(locked.mode(), &AuthMode::Locked);
        assert!(locked.authenticate(&headers(Some("anything"))).is_err());
    }
}
