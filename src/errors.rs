use axum::{
    http::{HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::backend::{registry::RegistryError, BackendError};

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error("{0}")]
    ModelNotFound(String),
    #[error("{0}")]
    BackendNotFound(String),
    #[error("missing API key")]
    MissingApiKey,
    #[error("invalid API key")]
    InvalidApiKey,
    #[error("{message}")]
    RateLimited {
        message: String,
        headers: Vec<(String, String)>,
    },
    #[error("{0}")]
    BackendUnavailable(String),
    #[error("{0}")]
    BackendTimeout(String),
    #[error("{0}")]
    BackendProtocol(String),
    #[error("{0}")]
    Service(String),
}

#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
    #[serde(rename = "type")]
    error_type: &'static str,
    code: &'static str,
    status: u16,
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) | Self::ModelNotFound(_) | Self::BackendNotFound(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::MissingApiKey | Self::InvalidApiKey => StatusCode::UNAUTHORIZED,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::BackendTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::BackendProtocol(_) => StatusCode::BAD_GATEWAY,
            Self::Service(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) | Self::ModelNotFound(_) | Self::BackendNotFound(_) => {
                "invalid_request_error"
            }
            Self::MissingApiKey | Self::InvalidApiKey => "authentication_error",
            Self::RateLimited { .. } => "rate_limit_error",
            Self::BackendUnavailable(_) | Self::BackendTimeout(_) | Self::BackendProtocol(_) => {
                "backend_error"
            }
            Self::Service(_) => "service_error",
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_messages",
            Self::ModelNotFound(_) => "invalid_model",
            Self::BackendNotFound(_) => "invalid_backend",
            Self::MissingApiKey => "missing_api_key",
            Self::InvalidApiKey => "invalid_api_key",
            Self::RateLimited { .. } => "rate_limit_exceeded",
            Self::BackendUnavailable(_) => "backend_unavailable",
            Self::BackendTimeout(_) => "backend_timeout",
            Self::BackendProtocol(_) => "backend_protocol_error",
            Self::Service(_) => "service_unavailable",
        }
    }

    /// Body shared by error responses and in-stream error frames.
    pub fn envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            error: ErrorBody {
                message: self.to_string(),
                error_type: self.error_type(),
                code: self.code(),
                status: self.status().as_u16(),
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut response = (status, Json(self.envelope())).into_response();
        if let AppError::RateLimited { headers, .. } = self {
            for (name, value) in headers {
                apply_header(response.headers_mut(), &name, &value);
            }
        }
        response
    }
}

impl From<BackendError> for AppError {
    fn from(error: BackendError) -> Self {
        match error {
            BackendError::InvalidRequest(message) => Self::InvalidRequest(message),
            BackendError::Unavailable(_) => Self::BackendUnavailable(error.to_string()),
            BackendError::Timeout(_) => Self::BackendTimeout(error.to_string()),
            BackendError::Protocol(_) => Self::BackendProtocol(error.to_string()),
            BackendError::Misconfigured(_) => Self::Service(error.to_string()),
        }
    }
}

impl From<RegistryError> for AppError {
    fn from(error: RegistryError) -> Self {
        match error {
            RegistryError::BackendNotFound(_) => Self::BackendNotFound(error.to_string()),
            RegistryError::ModelNotInBackend { .. } | RegistryError::ModelNotFound(_) => {
                Self::ModelNotFound(error.to_string())
            }
        }
    }
}

pub fn apply_header(headers: &mut axum::http::HeaderMap, name: &str, value: &str) {
    let Ok(header_name) = HeaderName::from_bytes(name.as_bytes()) else {
        return;
    };
    let Ok(header_value) = HeaderValue::from_str(value) else {
        return;
    };
    headers.insert(header_name, header_value);
}

#[cfg(test)]
mod tests {
    use axum::body::to_bytes;

    use super::*;

    #[tokio::test]
    async fn error_body_carries_type_code_and_status() {
        let response = AppError::ModelNotFound("model not found: nonexistent".to_owned()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let bytes = to_bytes(response.into_body(), 64 * 1024).await.expect("body");
        let body: serde_json::Value = serde_json::from_slice(&bytes).expect("json body");
        assert_eq!(body["error"]["type"], "invalid_request_error");
        assert_eq!(body["error"]["code"], "invalid_model");
        assert_eq!(body["error"]["status"], 400);
        assert_eq!(body["error"]["message"], "model not found: nonexistent");
    }

    #[test]
    fn backend_failures_map_to_gateway_statuses() {
        let cases = [
            (BackendError::Unavailable("down".to_owned()), StatusCode::SERVICE_UNAVAILABLE),
            (BackendError::Timeout("slow".to_owned()), StatusCode::GATEWAY_TIMEOUT),
            (BackendError::Protocol("garbled".to_owned()), StatusCode::BAD_GATEWAY),
            (BackendError::InvalidRequest("no user".to_owned()), StatusCode::BAD_REQUEST),
            (BackendError::Misconfigured("alias".to_owned()), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (error, status) in cases {
            assert_eq!(AppError::from(error).status(), status);
        }
    }

    #[test]
    fn rate_limited_response_keeps_headers() {
        let response = AppError::RateLimited {
            message: "too many".to_owned(),
            headers: vec![("x-ratelimit-remaining-requests".to_owned(), "0".to_owned())],
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response
                .headers()
                .get("x-ratelimit-remaining-requests")
                .and_then(|value| value.to_str().ok()),
            Some("0")
        );
    }
}
