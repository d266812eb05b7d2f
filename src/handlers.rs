use std::{
    collections::BTreeMap,
    convert::Infallible,
    sync::Arc,
    time::{Duration, Instant},
};

use axum::{
    extract::{rejection::JsonRejection, State},
    http::header::CONTENT_TYPE,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Extension, Json,
};
use futures_util::StreamExt;
use tracing::{info, warn};

use crate::{
    auth::AuthContext,
    backend::{BackendError, ChatBackend},
    errors::AppError,
    models::{
        unix_timestamp, BackendInfo, BackendsResponse, ChatCompletionsRequest, ChatRequest,
        HealthResponse, ModelInfo, ModelsResponse,
    },
    state::AppState,
};

const CHAT_PATH: &str = "/v1/chat/completions";

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let backends = state
        .registry
        .list_all()
        .into_iter()
        .map(|backend| {
            let status = if backend.is_healthy() {
                "connected"
            } else {
                "disconnected"
            };
            (backend.id().to_owned(), status.to_owned())
        })
        .collect::<BTreeMap<_, _>>();

    Json(HealthResponse {
        status: "healthy".to_owned(),
        version: env!("CARGO_PKG_VERSION").to_owned(),
        backends,
        uptime: state.started_at.elapsed().as_secs(),
    })
}

pub async fn list_models(State(state): State<AppState>) -> Json<ModelsResponse> {
    let created = unix_timestamp();
    let data = state
        .registry
        .list_all()
        .into_iter()
        .flat_map(|backend| backend.list_models())
        .map(|model| ModelInfo {
            id: model.id,
            object: "model".to_owned(),
            created,
            owned_by: model.backend_id.clone(),
            backend: model.backend_id,
            free: model.free,
        })
        .collect();

    Json(ModelsResponse {
        object: "list".to_owned(),
        data,
    })
}

pub async fn list_backends(State(state): State<AppState>) -> Json<BackendsResponse> {
    let default_id = state.registry.default_backend_id().to_owned();
    let data = state
        .registry
        .list_all()
        .into_iter()
        .map(|backend| BackendInfo {
            id: backend.id().to_owned(),
            name: backend.name().to_owned(),
            status: if backend.is_healthy() { "active" } else { "inactive" }.to_owned(),
            models: backend.list_models().into_iter().map(|model| model.id).collect(),
            default: backend.id() == default_id,
        })
        .collect();

    Json(BackendsResponse {
        object: "list".to_owned(),
        data,
    })
}

pub async fn metrics(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok(body) => (
            [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(error) => AppError::Service(format!("metrics render failed: {error}")).into_response(),
    }
}

pub async fn chat_completions(
    State(state): State<AppState>,
    auth: Option<Extension<AuthContext>>,
    payload: Result<Json<ChatCompletionsRequest>, JsonRejection>,
) -> Response {
    let started = Instant::now();
    let _inflight = state.metrics.inflight_guard();
    let stream = payload.as_ref().map(|Json(request)| request.stream).unwrap_or(false);
    let key_id = auth
        .map(|Extension(context)| context.key_id)
        .unwrap_or_else(|| "anonymous".to_owned());

    let response = match process_chat_completions(state.clone(), key_id, payload).await {
        Ok(response) => response,
        Err(error) => error.into_response(),
    };

    state.metrics.observe_request(
        CHAT_PATH,
        "POST",
        stream,
        response.status().as_u16(),
        started.elapsed(),
    );

    response
}

async fn process_chat_completions(
    state: AppState,
    key_id: String,
    payload: Result<Json<ChatCompletionsRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    let Json(request) = payload.map_err(|rejection| AppError::InvalidRequest(rejection.body_text()))?;

    let (backend, model) = state.registry.resolve(&request.routing_model())?;
    let chat = request
        .into_chat_request(model)
        .map_err(AppError::InvalidRequest)?;

    if !backend.is_healthy() {
        return Err(AppError::BackendUnavailable(format!(
            "backend '{}' is not available",
            backend.id()
        )));
    }

    info!(
        request_id = %chat.request_id,
        key_id = %key_id,
        backend = %backend.id(),
        model = %chat.model,
        stream = chat.stream,
        "chat request accepted"
    );

    if chat.stream {
        stream_completion(state, backend, chat).await
    } else {
        one_shot_completion(state, backend, chat).await
    }
}

async fn one_shot_completion(
    state: AppState,
    backend: Arc<dyn ChatBackend>,
    request: ChatRequest,
) -> Result<Response, AppError> {
    let deadline = Duration::from_secs(state.config.server.request_timeout_secs);
    let result = match tokio::time::timeout(deadline, backend.chat(request)).await {
        Ok(result) => result,
        Err(_) => Err(BackendError::Timeout(format!(
            "request exceeded {}s",
            deadline.as_secs()
        ))),
    };

    let response = result.map_err(|error| {
        state.metrics.observe_backend_error(backend.id(), "chat");
        warn!(backend = %backend.id(), error = %error, "chat request failed");
        AppError::from(error)
    })?;

    Ok(Json(response).into_response())
}

async fn stream_completion(
    state: AppState,
    backend: Arc<dyn ChatBackend>,
    request: ChatRequest,
) -> Result<Response, AppError> {
    let request_id = request.request_id.clone();
    let mut chunks = backend.chat_stream(request).await.map_err(|error| {
        state.metrics.observe_backend_error(backend.id(), "stream_start");
        warn!(backend = %backend.id(), error = %error, "stream could not start");
        AppError::from(error)
    })?;

    let backend_id = backend.id().to_owned();
    // Drained to the end so the body closes only after the backend has torn
    // the call down. An error is always the last item.
    let outbound = async_stream::stream! {
        let mut failed = false;
        while let Some(next) = chunks.next().await {
            match next {
                _ if failed => continue,
                Ok(chunk) => yield Ok::<Event, Infallible>(json_event(&chunk)),
                Err(error) => {
                    state.metrics.observe_backend_error(&backend_id, "stream");
                    warn!(request_id = %request_id, backend = %backend_id, error = %error, "backend stream error");
                    yield Ok::<Event, Infallible>(json_event(&AppError::from(error).envelope()));
                    failed = true;
                }
            }
        }

        yield Ok::<Event, Infallible>(Event::default().data("[DONE]"));
    };

    Ok(Sse::new(outbound)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(10)))
        .into_response())
}

fn json_event<T: serde::Serialize>(payload: &T) -> Event {
    match serde_json::to_string(payload) {
        Ok(serialized) => Event::default().data(serialized),
        Err(error) => {
            let fallback = AppError::Service(format!("serialization error: {error}")).envelope();
            Event::default().data(serde_json::to_string(&fallback).unwrap_or_default())
        }
    }
}
