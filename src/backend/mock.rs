use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use crate::{
    backend::{BackendError, BackendStream, ChatBackend, Model, ModelCatalog},
    config::ModelConfig,
    models::{ChatCompletionsChunk, ChatCompletionsResponse, ChatRequest},
};

/// In-process backend that echoes the last user turn. Used to exercise the
/// registry and the HTTP surface without a network peer.
#[derive(Debug, Clone)]
pub struct MockBackend {
    id: String,
    catalog: ModelCatalog,
    healthy: Arc<AtomicBool>,
    fail_shutdown: bool,
    shutdown_calls: Arc<AtomicUsize>,
}

impl MockBackend {
    pub fn new(id: &str, models: &[(&str, &[&str])]) -> Self {
        let configs = models
            .iter()
            .map(|(model, aliases)| ModelConfig {
                id: (*model).to_owned(),
                aliases: aliases.iter().map(|alias| (*alias).to_owned()).collect(),
                free: true,
            })
            .collect::<Vec<_>>();

        Self {
            id: id.to_owned(),
            catalog: ModelCatalog::new(id, &configs).expect("mock catalog has conflicting aliases"),
            healthy: Arc::new(AtomicBool::new(true)),
            fail_shutdown: false,
            shutdown_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing_shutdown(mut self) -> Self {
        self.fail_shutdown = true;
        self
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn shutdown_calls(&self) -> usize {
        self.shutdown_calls.load(Ordering::SeqCst)
    }

    fn render(request: &ChatRequest) -> Result<String, BackendError> {
        request
            .last_user_message()
            .map(|prompt| format!("Mock response for model {}: {prompt}", request.model))
            .ok_or_else(|| BackendError::InvalidRequest("no user message found".to_owned()))
    }
}

#[async_trait]
impl ChatBackend for MockBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        "Mock"
    }

    async fn initialize(&self) -> Result<(), BackendError> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), BackendError> {
        self.shutdown_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_shutdown {
            return Err(BackendError::Unavailable("mock shutdown failure".to_owned()));
        }
        Ok(())
    }

    async fn health_check(&self) -> Result<(), BackendError> {
        if self.is_healthy() {
            Ok(())
        } else {
            Err(BackendError::Unavailable("mock marked unhealthy".to_owned()))
        }
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    fn list_models(&self) -> Vec<Model> {
        self.catalog.models().to_vec()
    }

    fn supports_model(&self, model_id: &str) -> bool {
        self.catalog.supports(model_id)
    }

    fn resolve_model(&self, model_id: &str) -> String {
        self.catalog.resolve(model_id)
    }

    async fn chat(&self, request: ChatRequest) -> Result<ChatCompletionsResponse, BackendError> {
        let content = Self::render(&request)?;
        Ok(ChatCompletionsResponse::assistant(
            format!("chatcmpl-{}", request.request_id),
            0,
            request.model,
            content,
        ))
    }

    async fn chat_stream(&self, request: ChatRequest) -> Result<BackendStream, BackendError> {
        let content = Self::render(&request)?;
        let id = format!("chatcmpl-{}", request.request_id);
        let model = request.model;
        let (tx, rx) = mpsc::channel(32);

        tokio::spawn(async move {
            let mut chunks = vec![ChatCompletionsChunk::role(&id, 0, &model)];
            chunks.extend(
                content
                    .split_inclusive(' ')
                    .map(|token| ChatCompletionsChunk::delta(&id, 0, &model, token.to_owned())),
            );
            chunks.push(ChatCompletionsChunk::finish(&id, 0, &model));

            for chunk in chunks {
                if tx.send(Ok(chunk)).await.is_err() {
                    return;
                }
            }
        });

        debug!(backend = %self.id, "mock stream prepared");
        Ok(ReceiverStream::new(rx).boxed())
    }

    fn supports_streaming(&self) -> bool {
        true
    }
}
