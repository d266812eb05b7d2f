use std::{
    collections::HashMap,
    time::{SystemTime, UNIX_EPOCH},
};

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{
    auth::AuthContext,
    config::RateLimitConfig,
    errors::{apply_header, AppError},
    state::AppState,
};

const WINDOW_SECS: u64 = 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitSnapshot {
    pub limit: u32,
    pub remaining: u32,
    /// Unix time at which the current window ends.
    pub reset: u64,
}

impl RateLimitSnapshot {
    pub fn to_header_pairs(&self) -> Vec<(String, String)> {
        vec![
            ("x-ratelimit-limit-requests".to_owned(), self.limit.to_string()),
            (
                "x-ratelimit-remaining-requests".to_owned(),
                self.remaining.to_string(),
            ),
            ("x-ratelimit-reset-requests".to_owned(), self.reset.to_string()),
        ]
    }
}

#[derive(Debug)]
pub struct RateLimitExceeded(pub RateLimitSnapshot);

impl From<RateLimitExceeded> for AppError {
    fn from(RateLimitExceeded(snapshot): RateLimitExceeded) -> Self {
        AppError::RateLimited {
            message: format!(
                "rate limit of {} requests per minute exceeded",
                snapshot.limit
            ),
            headers: snapshot.to_header_pairs(),
        }
    }
}

/// Fixed-window requests-per-minute admission keyed by API key fingerprint.
/// Counters live in memory or, when a Redis URL is configured, in Redis so
/// several gateway replicas share one budget.
pub struct RateLimiter {
    enabled: bool,
    requests_per_minute: u32,
    store: WindowStore,
}

enum WindowStore {
    Memory(Mutex<HashMap<String, Window>>),
    Redis {
        client: redis::Client,
        prefix: String,
    },
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started_at: u64,
    count: u32,
}

impl RateLimiter {
    pub fn in_memory(requests_per_minute: u32) -> Self {
        Self {
            enabled: true,
            requests_per_minute,
            store: WindowStore::Memory(Mutex::new(HashMap::new())),
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            requests_per_minute: 0,
            store: WindowStore::Memory(Mutex::new(HashMap::new())),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        if !config.enabled {
            return Self::disabled();
        }

        let store = match config.redis_url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => match redis::Client::open(url) {
                Ok(client) => WindowStore::Redis {
                    client,
                    prefix: config.redis_prefix.clone(),
                },
                Err(error) => {
                    warn!(error = %error, "invalid redis url, falling back to in-memory rate limiting");
                    WindowStore::Memory(Mutex::new(HashMap::new()))
                }
            },
            _ => WindowStore::Memory(Mutex::new(HashMap::new())),
        };

        Self {
            enabled: true,
            requests_per_minute: config.requests_per_minute,
            store,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Counts one request against `key_id`. `Ok(None)` when limiting is off.
    pub async fn check(&self, key_id: &str) -> Result<Option<RateLimitSnapshot>, RateLimitExceeded> {
        if !self.enabled {
            return Ok(None);
        }

        let now = unix_seconds();
        let window_start = (now / WINDOW_SECS) * WINDOW_SECS;
        let count = match &self.store {
            WindowStore::Memory(windows) => {
                let mut windows = windows.lock().await;
                let window = windows.entry(key_id.to_owned()).or_insert(Window {
                    started_at: window_start,
                    count: 0,
                });
                if window.started_at != window_start {
                    *window = Window {
                        started_at: window_start,
                        count: 0,
                    };
                }
                window.count = window.count.saturating_add(1);
                window.count
            }
            WindowStore::Redis { client, prefix } => {
                let key = format!("{prefix}:ratelimit:{key_id}:{window_start}");
                match redis_increment(client, &key).await {
                    Ok(count) => count,
                    Err(error) => {
                        // Redis outages admit traffic rather than block it.
                        warn!(error = %error, "redis rate limit check failed, admitting request");
                        return Ok(None);
                    }
                }
            }
        };

        let snapshot = RateLimitSnapshot {
            limit: self.requests_per_minute,
            remaining: self.requests_per_minute.saturating_sub(count),
            reset: window_start + WINDOW_SECS,
        };
        if count > self.requests_per_minute {
            return Err(RateLimitExceeded(snapshot));
        }
        Ok(Some(snapshot))
    }
}

async fn redis_increment(client: &redis::Client, key: &str) -> redis::RedisResult<u32> {
    let mut connection = client.get_multiplexed_async_connection().await?;
    let (count,): (u32,) = redis::pipe()
        .atomic()
        .incr(key, 1)
        .expire(key, WINDOW_SECS as i64)
        .ignore()
        .query_async(&mut connection)
        .await?;
    Ok(count)
}

/// Runs after authentication; a missing [`AuthContext`] is counted under a
/// shared anonymous bucket.
pub async fn enforce_rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let key_id = request
        .extensions()
        .get::<AuthContext>()
        .map(|context| context.key_id.clone())
        .unwrap_or_else(|| "anonymous".to_owned());

    match state.rate_limiter.check(&key_id).await {
        Ok(snapshot) => {
            let mut response = next.run(request).await;
            if let Some(snapshot) = snapshot {
                for (name, value) in snapshot.to_header_pairs() {
                    apply_header(response.headers_mut(), &name, &value);
                }
            }
            response
        }
        Err(exceeded) => {
            debug!(key_id = %key_id, "rate limit exceeded");
            state.metrics.observe_rate_limited();
            AppError::from(exceeded).into_response()
        }
    }
}

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn admits_up_to_the_limit_then_rejects() {
        let limiter = RateLimiter::in_memory(2);

        let first = limiter.check("key-a").await.expect("first").expect("snapshot");
        assert_eq!(first.remaining, 1);
        let second = limiter.check("key-a").await.expect("second").expect("snapshot");
        assert_eq!(second.remaining, 0);

        let RateLimitExceeded(snapshot) = limiter.check("key-a").await.expect_err("third");
        assert_eq!(snapshot.remaining, 0);
        assert_eq!(snapshot.limit, 2);
    }

    #[tokio::test]
    async fn keys_have_independent_windows() {
        let limiter = RateLimiter::in_memory(1);

        assert!(limiter.check("key-a").await.is_ok());
        assert!(limiter.check("key-b").await.is_ok());
        assert!(limiter.check("key-a").await.is_err());
    }

    #[tokio::test]
    async fn disabled_limiter_never_counts() {
        let limiter = RateLimiter::from_config(&RateLimitConfig {
            enabled: false,
            ..RateLimitConfig::default()
        });

        for _ in 0..100 {
            assert_eq!(limiter.check("key-a").await.expect("admitted"), None);
        }
        assert!(!limiter.is_enabled());
    }

    #[test]
    fn snapshot_renders_request_headers() {
        let pairs = RateLimitSnapshot {
            limit: 60,
            remaining: 59,
            reset: 120,
        }
        .to_header_pairs();

        assert_eq!(pairs[0], ("x-ratelimit-limit-requests".to_owned(), "60".to_owned()));
        assert_eq!(pairs[1].1, "59");
        assert_eq!(pairs[2].1, "120");
    }
}
