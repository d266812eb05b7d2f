//! Adapter for an OpenCode server: every chat call runs in a fresh,
//! disposable backend session.

mod client;
mod events;
mod session;
mod stream;
mod wire;

use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    backend::{BackendError, BackendStream, ChatBackend, Model, ModelCatalog},
    config::BackendConfig,
    models::{unix_timestamp, ChatCompletionsResponse, ChatRequest},
};

pub use client::OpenCodeClient;
pub use events::{Completion, MatchStep, SseDecoder, StreamMatcher};

use session::BackendSession;
use stream::StreamCall;
use wire::{MessageRequest, ModelSelector};

const STREAM_BUFFER: usize = 64;

/// Deadlines of one bridged call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeTimeouts {
    /// From posting the message until the assistant's first matched part.
    pub start: Duration,
    /// From that first part until the listener reports completion.
    pub stream: Duration,
    pub session_delete: Duration,
    pub health_check: Duration,
}

impl Default for BridgeTimeouts {
    fn default() -> Self {
        Self {
            start: Duration::from_secs(30),
            stream: Duration::from_secs(120),
            session_delete: Duration::from_secs(5),
            health_check: Duration::from_secs(5),
        }
    }
}

pub struct OpenCodeBackend {
    id: String,
    client: OpenCodeClient,
    catalog: ModelCatalog,
    timeouts: BridgeTimeouts,
    healthy: AtomicBool,
    /// Parent of every in-flight call's token.
    shutdown: CancellationToken,
}

impl OpenCodeBackend {
    pub fn new(id: &str, config: &BackendConfig) -> Result<Self, BackendError> {
        let catalog = ModelCatalog::new(id, &config.models)
            .map_err(|error| BackendError::Misconfigured(error.to_string()))?;
        let client = OpenCodeClient::new(&config.base_url(), config.timeout())?;

        Ok(Self {
            id: id.to_owned(),
            client,
            catalog,
            timeouts: BridgeTimeouts::default(),
            healthy: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn with_timeouts(mut self, timeouts: BridgeTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    fn prompt<'a>(request: &'a ChatRequest) -> Result<&'a str, BackendError> {
        request
            .last_user_message()
            .ok_or_else(|| BackendError::InvalidRequest("no user message found".to_owned()))
    }

    fn message_for(&self, request: &ChatRequest, prompt: &str) -> MessageRequest {
        MessageRequest::text(prompt, ModelSelector::for_model(&request.model, &self.id))
    }

    fn shut_down(&self) -> BackendError {
        BackendError::Unavailable(format!("backend {} is shutting down", self.id))
    }
}

#[async_trait]
impl ChatBackend for OpenCodeBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        "OpenCode"
    }

    async fn initialize(&self) -> Result<(), BackendError> {
        match self.health_check().await {
            Ok(()) => info!(backend = %self.id, url = %self.client.base_url(), "backend connected"),
            Err(error) => warn!(
                backend = %self.id,
                url = %self.client.base_url(),
                error = %error,
                "backend not reachable at startup, registering as unhealthy"
            ),
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), BackendError> {
        self.shutdown.cancel();
        self.healthy.store(false, Ordering::SeqCst);
        info!(backend = %self.id, "backend shut down");
        Ok(())
    }

    async fn health_check(&self) -> Result<(), BackendError> {
        let result = self.client.probe(self.timeouts.health_check).await;
        self.healthy.store(result.is_ok(), Ordering::SeqCst);
        result
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
        let prompt = Self::prompt(&request)?;
        let message = self.message_for(&request, prompt);
        let session = BackendSession::open(&self.client, self.timeouts.session_delete).await?;

        let reply = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(self.shut_down()),
            reply = self.client.send_message(session.id(), &message) => reply.and_then(|reply| {
                if let Some(message_id) = reply.message_id() {
                    debug!(backend = %self.id, message_id = %message_id, "assistant reply received");
                }
                reply.into_content()
            }),
        };

        let session_id = session.id().to_owned();
        session.close().await;

        let content = reply.map_err(|error| error.context("failed to send message"))?;
        info!(
            backend = %self.id,
            session_id = %session_id,
            model = %request.model,
            "chat completed"
        );
        Ok(ChatCompletionsResponse::assistant(
            format!("chatcmpl-{session_id}"),
            unix_timestamp(),
            request.model,
            content,
        ))
    }

    async fn chat_stream(&self, request: ChatRequest) -> Result<BackendStream, BackendError> {
        let prompt = Self::prompt(&request)?;
        let message = self.message_for(&request, prompt);
        let session = BackendSession::open(&self.client, self.timeouts.session_delete).await?;

        let feed = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(self.shut_down()),
            feed = self.client.open_events() => feed,
        };
        let feed = match feed {
            Ok(feed) => feed,
            Err(error) => {
                session.close().await;
                return Err(error.context("failed to connect to event stream"));
            }
        };

        info!(
            backend = %self.id,
            session_id = %session.id(),
            model = %request.model,
            "streaming chat started"
        );

        let cancel = self.shutdown.child_token();
        let (tx, mut rx) = mpsc::channel(STREAM_BUFFER);
        let call = StreamCall {
            client: self.client.clone(),
            session,
            feed,
            message,
            created: unix_timestamp(),
            model: request.model,
            timeouts: self.timeouts,
            cancel: cancel.clone(),
        };
        tokio::spawn(call.run(tx));

        // Dropping the stream cancels the in-flight call.
        let cancel_on_drop = cancel.drop_guard();
        let chunks = async_stream::stream! {
            let _cancel_on_drop = cancel_on_drop;
            while let Some(item) = rx.recv().await {
                yield item;
            }
        };
        Ok(chunks.boxed())
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    fn supports_sessions(&self) -> bool {
        true
    }
}
