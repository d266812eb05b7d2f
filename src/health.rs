use std::{sync::Arc, time::Duration};

use tokio::{task::JoinHandle, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::registry::BackendRegistry;

/// Re-probes every registered backend on a fixed interval until `stop` fires.
/// Each probe updates the backend's cached health flag, which is what request
/// admission reads.
pub fn spawn_health_checks(
    registry: Arc<BackendRegistry>,
    interval: Duration,
    stop: CancellationToken,
) -> JoinHandle<()> {
    info!(interval_secs = interval.as_secs(), "periodic health checks enabled");
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = sleep(interval) => {}
            }
            check_once(&registry).await;
        }
        debug!("periodic health checks stopped");
    })
}

pub async fn check_once(registry: &BackendRegistry) {
    for backend in registry.list_all() {
        let was_healthy = backend.is_healthy();
        match backend.health_check().await {
            Ok(()) if !was_healthy => info!(backend = %backend.id(), "backend recovered"),
            Ok(()) => debug!(backend = %backend.id(), "health check passed"),
            Err(error) => warn!(
                backend = %backend.id(),
                error = %error,
                was_healthy,
                "health check failed"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{mock::MockBackend, ChatBackend};

    #[tokio::test]
    async fn check_once_reads_every_backend() {
        let registry = BackendRegistry::new("a");
        let healthy = MockBackend::new("a", &[("m", &[])]);
        let sick = MockBackend::new("b", &[("m", &[])]);
        sick.set_healthy(false);
        registry.register(Arc::new(healthy.clone()));
        registry.register(Arc::new(sick.clone()));

        check_once(&registry).await;

        assert!(healthy.is_healthy());
        assert!(!sick.is_healthy());
    }

    #[tokio::test]
    async fn periodic_task_stops_on_cancel() {
        let registry = Arc::new(BackendRegistry::new("a"));
        let stop = CancellationToken::new();
        let handle = spawn_health_checks(registry, Duration::from_secs(3600), stop.clone());

        stop.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("task should stop promptly")
            .expect("task should not panic");
    }
}
