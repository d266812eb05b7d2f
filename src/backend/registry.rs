use std::{collections::BTreeMap, sync::Arc};

use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::backend::ChatBackend;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("backend '{0}' not found")]
    BackendNotFound(String),
    #[error("model '{model}' not found in backend '{backend}'")]
    ModelNotInBackend { model: String, backend: String },
    #[error("model '{0}' not found in any backend")]
    ModelNotFound(String),
}

/// Backends keyed by id. Reads (resolution, listing) share the lock; only
/// registration takes it exclusively.
pub struct BackendRegistry {
    backends: RwLock<BTreeMap<String, Arc<dyn ChatBackend>>>,
    default_backend: String,
}

impl BackendRegistry {
    pub fn new(default_backend: impl Into<String>) -> Self {
        Self {
            backends: RwLock::new(BTreeMap::new()),
            default_backend: default_backend.into(),
        }
    }

    pub fn register(&self, backend: Arc<dyn ChatBackend>) {
        let id = backend.id().to_owned();
        if self.backends.write().insert(id.clone(), backend).is_some() {
            warn!(backend = %id, "backend re-registered, previous instance replaced");
        } else {
            info!(backend = %id, "backend registered");
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn ChatBackend>> {
        self.backends.read().get(id).cloned()
    }

    pub fn get_default(&self) -> Option<Arc<dyn ChatBackend>> {
        self.get(&self.default_backend)
    }

    pub fn default_backend_id(&self) -> &str {
        &self.default_backend
    }

    pub fn list_all(&self) -> Vec<Arc<dyn ChatBackend>> {
        self.backends.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.backends.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.read().is_empty()
    }

    /// Resolves `backend/model` or a bare model name to a backend and its
    /// canonical model id. Bare names try the default backend first, then
    /// every other backend in id order.
    pub fn resolve(&self, model: &str) -> Result<(Arc<dyn ChatBackend>, String), RegistryError> {
        let backends = self.backends.read();

        if let Some((backend_id, model_id)) = model.split_once('/') {
            let backend = backends
                .get(backend_id)
                .ok_or_else(|| RegistryError::BackendNotFound(backend_id.to_owned()))?;
            if !backend.supports_model(model_id) {
                return Err(RegistryError::ModelNotInBackend {
                    model: model_id.to_owned(),
                    backend: backend_id.to_owned(),
                });
            }
            return Ok((backend.clone(), backend.resolve_model(model_id)));
        }

        if let Some(backend) = backends.get(&self.default_backend) {
            if backend.supports_model(model) {
                return Ok((backend.clone(), backend.resolve_model(model)));
            }
        }

        let found = backends
            .values()
            .find(|backend| backend.id() != self.default_backend && backend.supports_model(model));
        match found {
            Some(backend) => {
                debug!(model = %model, backend = %backend.id(), "model resolved by fallback scan");
                Ok((backend.clone(), backend.resolve_model(model)))
            }
            None => Err(RegistryError::ModelNotFound(model.to_owned())),
        }
    }

    /// Shuts every backend down. Individual failures are logged and skipped.
    pub async fn shutdown_all(&self) {
        for backend in self.list_all() {
            match backend.shutdown().await {
                Ok(()) => info!(backend = %backend.id(), "backend shut down"),
                Err(error) => warn!(backend = %backend.id(), error = %error, "backend shutdown failed"),
            }
        }
    }
}
