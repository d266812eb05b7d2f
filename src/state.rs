use std::{sync::Arc, time::Instant};

use crate::{
    auth::ApiKeyRegistry, backend::registry::BackendRegistry, config::GatewayConfig,
    limits::RateLimiter, metrics::AppMetrics,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub registry: Arc<BackendRegistry>,
    pub auth: Arc<ApiKeyRegistry>,
    pub rate_limiter: Arc<RateLimiter>,
    pub metrics: Arc<AppMetrics>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: GatewayConfig, registry: Arc<BackendRegistry>) -> Self {
        Self {
            auth: Arc::new(ApiKeyRegistry::from_config(&config.auth)),
            rate_limiter: Arc::new(RateLimiter::from_config(&config.rate_limit)),
            metrics: Arc::new(AppMetrics::new()),
            config: Arc::new(config),
            registry,
            started_at: Instant::now(),
        }
    }
}
