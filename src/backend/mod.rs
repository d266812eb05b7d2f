pub mod catalog;
pub mod mock;
pub mod opencode;
pub mod registry;

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use thiserror::Error;
use tracing::warn;

use crate::{
    config::{BackendConfig, BackendKind},
    models::{ChatCompletionsChunk, ChatCompletionsResponse, ChatRequest},
};

pub use catalog::{CatalogError, Model, ModelCatalog};

/// Lazily produced chunks of one streaming call. Dropping the stream cancels
/// the call.
pub type BackendStream = BoxStream<'static, Result<ChatCompletionsChunk, BackendError>>;

/// Capability contract every backend adapter satisfies. The registry and the
/// HTTP layer only ever hold `Arc<dyn ChatBackend>`.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> &str;

    /// Runs the initial health probe. An unreachable backend is not an error
    /// here; it is registered and reported unhealthy.
    async fn initialize(&self) -> Result<(), BackendError>;
    async fn shutdown(&self) -> Result<(), BackendError>;

    /// Probes the backend and updates the cached health flag.
    async fn health_check(&self) -> Result<(), BackendError>;
    fn is_healthy(&self) -> bool;

    fn list_models(&self) -> Vec<Model>;
    fn supports_model(&self, model_id: &str) -> bool;
    /// Maps an alias to its canonical id; canonical ids map to themselves.
    fn resolve_model(&self, model_id: &str) -> String;

    async fn chat(&self, request: ChatRequest) -> Result<ChatCompletionsResponse, BackendError>;
    async fn chat_stream(&self, request: ChatRequest) -> Result<BackendStream, BackendError>;

    fn supports_streaming(&self) -> bool {
        false
    }

    fn supports_tools(&self) -> bool {
        false
    }

    fn supports_sessions(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("backend timeout: {0}")]
    Timeout(String),
    #[error("backend protocol error: {0}")]
    Protocol(String),
    #[error("backend misconfigured: {0}")]
    Misconfigured(String),
}

impl BackendError {
    /// Prefixes the message with the failed step, keeping the variant.
    pub fn context(self, step: &str) -> Self {
        match self {
            Self::InvalidRequest(message) => Self::InvalidRequest(message),
            Self::Unavailable(message) => Self::Unavailable(format!("{step}: {message}")),
            Self::Timeout(message) => Self::Timeout(format!("{step}: {message}")),
            Self::Protocol(message) => Self::Protocol(format!("{step}: {message}")),
            Self::Misconfigured(message) => Self::Misconfigured(message),
        }
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Timeout(error.to_string())
        } else if error.is_decode() {
            Self::Protocol(error.to_string())
        } else {
            Self::Unavailable(error.to_string())
        }
    }
}

/// Builds the adapter for one configured backend, or `None` when its type has
/// no adapter.
pub fn build_backend(
    id: &str,
    config: &BackendConfig,
) -> Result<Option<Arc<dyn ChatBackend>>, BackendError> {
    match config.backend_kind() {
        Some(BackendKind::Opencode) => {
            let backend = opencode::OpenCodeBackend::new(id, config)?;
            Ok(Some(Arc::new(backend)))
        }
        None => {
            warn!(backend = %id, kind = %config.kind, "no adapter for backend type, skipping");
            Ok(None)
        }
    }
}
