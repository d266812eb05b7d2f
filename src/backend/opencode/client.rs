use std::time::Duration;

use reqwest::{
    header::{ACCEPT, CONTENT_TYPE},
    StatusCode,
};
use tracing::{debug, warn};

use super::wire::{MessageReply, MessageRequest, SessionInfo};
use crate::backend::BackendError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Thin HTTP client for one OpenCode server. The `/event` feed is long-lived,
/// so the client carries no overall timeout; every other call sets its own.
#[derive(Clone)]
pub struct OpenCodeClient {
    http: reqwest::Client,
    base_url: String,
    request_timeout: Duration,
}

impl OpenCodeClient {
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self, BackendError> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|error| {
                BackendError::Misconfigured(format!("failed to build OpenCode HTTP client: {error}"))
            })?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_owned(),
            request_timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Healthy iff `GET /session` answers 200 with a JSON body.
    pub async fn probe(&self, timeout: Duration) -> Result<(), BackendError> {
        let response = self
            .http
            .get(self.url("/session"))
            .timeout(timeout)
            .send()
            .await?;

        let status = response.status();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_owned();

        if status != StatusCode::OK || !content_type.contains("application/json") {
            return Err(BackendError::Unavailable(format!(
                "health check failed: status {}, content-type {content_type}",
                status.as_u16()
            )));
        }
        Ok(())
    }

    pub async fn create_session(&self) -> Result<String, BackendError> {
        let response = self
            .http
            .post(self.url("/session"))
            .timeout(self.request_timeout)
            .json(&serde_json::json!({}))
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK && status != StatusCode::CREATED {
            let body = response.text().await.unwrap_or_default();
            return Err(map_http_error(status, body));
        }

        let session: SessionInfo = response
            .json()
            .await
            .map_err(|error| BackendError::Protocol(error.to_string()))?;
        debug!(session_id = %session.id, "session created");
        Ok(session.id)
    }

    pub async fn delete_session(&self, session_id: &str, timeout: Duration) -> Result<(), BackendError> {
        let response = self
            .http
            .delete(self.url(&format!("/session/{session_id}")))
            .timeout(timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(map_http_error(status, String::new()));
        }
        Ok(())
    }

    async fn post_raw(&self, session_id: &str, message: &MessageRequest) -> Result<String, BackendError> {
        let response = self
            .http
            .post(self.url(&format!("/session/{session_id}/message")))
            .timeout(self.request_timeout)
            .json(message)
            .send()
            .await?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|error| BackendError::Protocol(format!("failed to read response: {error}")))?;
        if !status.is_success() {
            return Err(map_http_error(status, body));
        }
        Ok(body)
    }

    /// Posts one message and decodes the reply.
    pub async fn send_message(
        &self,
        session_id: &str,
        message: &MessageRequest,
    ) -> Result<MessageReply, BackendError> {
        let body = self.post_raw(session_id, message).await?;
        serde_json::from_str(&body).map_err(|error| {
            BackendError::Protocol(format!(
                "failed to parse response: {error} (body: {})",
                truncate(&body)
            ))
        })
    }

    /// Posts one message whose output is consumed from the event feed. Only
    /// transport failures and replies flagged as failed are errors.
    pub async fn post_message(
        &self,
        session_id: &str,
        message: &MessageRequest,
    ) -> Result<(), BackendError> {
        let body = self.post_raw(session_id, message).await?;
        match serde_json::from_str::<MessageReply>(&body) {
            Ok(reply) => match reply.failure() {
                Some(error) => Err(BackendError::Protocol(format!("opencode error: {error}"))),
                None => Ok(()),
            },
            Err(error) => {
                warn!(session_id = %session_id, error = %error, "undecodable message reply ignored while streaming");
                Ok(())
            }
        }
    }

    pub async fn open_events(&self) -> Result<reqwest::Response, BackendError> {
        let response = self
            .http
            .get(self.url("/event"))
            .header(ACCEPT, "text/event-stream")
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(BackendError::Unavailable(format!(
                "event stream returned status {}",
                status.as_u16()
            )));
        }
        Ok(response)
    }
}

fn map_http_error(status: StatusCode, body: String) -> BackendError {
    let trimmed = truncate(&body);
    match status {
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            BackendError::Timeout(format!("upstream timeout: {trimmed}"))
        }
        StatusCode::SERVICE_UNAVAILABLE | StatusCode::BAD_GATEWAY | StatusCode::TOO_MANY_REQUESTS => {
            BackendError::Unavailable(format!("status {}: {trimmed}", status.as_u16()))
        }
        _ => BackendError::Protocol(format!("status {}: {trimmed}", status.as_u16())),
    }
}

fn truncate(body: &str) -> String {
    body.chars().take(400).collect()
}
