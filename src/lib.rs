pub mod auth;
pub mod backend;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod health;
pub mod limits;
pub mod metrics;
pub mod models;
pub mod state;

use std::{sync::Arc, time::Duration};

use axum::{
    http::{header, Method},
    middleware,
    routing::{get, post},
    Router,
};
use backend::{build_backend, registry::BackendRegistry};
use config::GatewayConfig;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

/// Builds every enabled backend, runs its initial health probe and registers
/// it. Backends that fail to build are logged and left out.
pub async fn build_state(config: GatewayConfig) -> state::AppState {
    let registry = Arc::new(BackendRegistry::new(config.default_backend.clone()));

    for (id, backend_config) in config.backends.iter().filter(|(_, backend)| backend.enabled) {
        let backend = match build_backend(id, backend_config) {
            Ok(Some(backend)) => backend,
            Ok(None) => continue,
            Err(error) => {
                warn!(backend = %id, error = %error, "failed to build backend, skipping");
                continue;
            }
        };

        if let Err(error) = backend.initialize().await {
            warn!(backend = %id, error = %error, "backend initialization failed");
        }
        registry.register(backend);
    }

    if registry.is_empty() {
        warn!("no backends registered; every chat request will fail");
    } else if registry.get_default().is_none() {
        warn!(default_backend = %config.default_backend, "default backend is not registered");
    }
    info!(backends = registry.len(), "backend registry ready");

    state::AppState::new(config, registry)
}

pub fn build_app(state: state::AppState) -> Router {
    let api = Router::new()
        .route("/v1/models", get(handlers::list_models))
        .route("/v1/backends", get(handlers::list_backends))
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            limits::enforce_rate_limit,
        ))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_api_key,
        ));

    Router::new()
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .merge(api)
        .layer(cors())
        .with_state(state)
}

fn cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::ORIGIN,
            header::CONTENT_TYPE,
            header::ACCEPT,
            header::AUTHORIZATION,
        ])
        .max_age(Duration::from_secs(86_400))
}
