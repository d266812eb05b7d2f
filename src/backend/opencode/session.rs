use std::time::Duration;

use tracing::{debug, warn};

use super::client::OpenCodeClient;
use crate::backend::BackendError;

/// One ephemeral OpenCode session. `close` deletes it; if the owner is
/// dropped first (caller cancellation, panic) the deletion is spawned from
/// `Drop` instead, so no exit path leaks the session.
pub struct BackendSession {
    client: OpenCodeClient,
    id: String,
    delete_timeout: Duration,
    closed: bool,
}

impl BackendSession {
    pub async fn open(client: &OpenCodeClient, delete_timeout: Duration) -> Result<Self, BackendError> {
        let id = client
            .create_session()
            .await
            .map_err(|error| error.context("failed to create session"))?;

        Ok(Self {
            client: client.clone(),
            id,
            delete_timeout,
            closed: false,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Deletes the session. Failures are logged, never returned. The delete
    /// runs on its own task, so dropping this future does not abort it.
    pub async fn close(mut self) {
        self.closed = true;
        let client = self.client.clone();
        let id = std::mem::take(&mut self.id);
        let timeout = self.delete_timeout;
        let _ = tokio::spawn(async move { delete_logged(&client, &id, timeout).await }).await;
    }
}

impl Drop for BackendSession {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(session_id = %self.id, "no runtime to delete abandoned session");
            return;
        };

        let client = self.client.clone();
        let id = std::mem::take(&mut self.id);
        let timeout = self.delete_timeout;
        debug!(session_id = %id, "deleting abandoned session");
        runtime.spawn(async move {
            delete_logged(&client, &id, timeout).await;
        });
    }
}

async fn delete_logged(client: &OpenCodeClient, session_id: &str, timeout: Duration) {
    match client.delete_session(session_id, timeout).await {
        Ok(()) => debug!(session_id = %session_id, "session deleted"),
        Err(error) => warn!(session_id = %session_id, error = %error, "failed to delete session"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use axum::{extract::State, routing::delete, Json, Router};
    use serde_json::{json, Value};

    use super::*;

    /// Counts DELETEs as they arrive and answers slowly.
    async fn slow_delete_server(deletes: Arc<AtomicUsize>) -> String {
        async fn handle(State(deletes): State<Arc<AtomicUsize>>) -> Json<Value> {
            deletes.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            Json(json!(true))
        }

        let app = Router::new()
            .route("/session/:id", delete(handle))
            .with_state(deletes);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });
        format!("http://{addr}")
    }

    fn session(base_url: &str) -> BackendSession {
        BackendSession {
            client: OpenCodeClient::new(base_url, Duration::from_secs(5)).expect("client"),
            id: "ses_1".to_owned(),
            delete_timeout: Duration::from_secs(5),
            closed: false,
        }
    }

    #[tokio::test]
    async fn close_deletes_once() {
        let deletes = Arc::new(AtomicUsize::new(0));
        let base_url = slow_delete_server(deletes.clone()).await;

        session(&base_url).close().await;

        assert_eq!(deletes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn interrupted_close_still_deletes_exactly_once() {
        let deletes = Arc::new(AtomicUsize::new(0));
        let base_url = slow_delete_server(deletes.clone()).await;

        let interrupted =
            tokio::time::timeout(Duration::from_millis(20), session(&base_url).close()).await;
        assert!(interrupted.is_err());

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(deletes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dropped_session_is_deleted_in_the_background() {
        let deletes = Arc::new(AtomicUsize::new(0));
        let base_url = slow_delete_server(deletes.clone()).await;

        drop(session(&base_url));

        for _ in 0..50 {
            if deletes.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(deletes.load(Ordering::SeqCst), 1);
    }
}
