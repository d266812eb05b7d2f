use std::collections::HashSet;

use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, HeaderMap},
    middleware::Next,
    response::{IntoResponse, Response},
};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::{config::AuthConfig, errors::AppError, state::AppState};

/// Identity attached to an admitted request. Raw keys never leave this
/// module; everything downstream sees the fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub key_id: String,
}

impl AuthContext {
    fn anonymous() -> Self {
        Self {
            key_id: "anonymous".to_owned(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiKeyRegistry {
    enabled: bool,
    valid_keys: HashSet<String>,
}

impl ApiKeyRegistry {
    pub fn from_config(config: &AuthConfig) -> Self {
        let valid_keys = config
            .keys
            .iter()
            .map(|key| key.trim())
            .filter(|key| !key.is_empty())
            .map(ToOwned::to_owned)
            .collect::<HashSet<_>>();

        if config.enabled && valid_keys.is_empty() {
            warn!("authentication is enabled but no API keys are configured; every request will be rejected");
        }

        Self {
            enabled: config.enabled,
            valid_keys,
        }
    }

    pub fn authenticate(&self, headers: &HeaderMap) -> Result<AuthContext, AppError> {
        if !self.enabled {
            return Ok(AuthContext::anonymous());
        }

        let header = headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or(AppError::MissingApiKey)?;

        let api_key = header
            .strip_prefix("Bearer ")
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .ok_or(AppError::InvalidApiKey)?;

        if !self.valid_keys.contains(api_key) {
            warn!(key_id = %fingerprint(api_key), "rejected unknown API key");
            return Err(AppError::InvalidApiKey);
        }

        Ok(AuthContext {
            key_id: fingerprint(api_key),
        })
    }
}

/// Short SHA-256 fingerprint used to log and rate-limit a key.
pub fn fingerprint(api_key: &str) -> String {
    let digest = Sha256::digest(api_key.as_bytes());
    digest
        .iter()
        .take(6)
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

/// Admits the request or answers 401. The resolved [`AuthContext`] is stored
/// in the request extensions for the rate limiter.
pub async fn require_api_key(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    match state.auth.authenticate(request.headers()) {
        Ok(context) => {
            request.extensions_mut().insert(context);
            next.run(request).await
        }
        Err(error) => {
            warn!(path = %request.uri().path(), code = error.code(), "unauthorized request");
            error.into_response()
        }
    }
}
