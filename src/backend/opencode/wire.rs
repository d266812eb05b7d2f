//! Request, reply and event shapes of the OpenCode server API.

use serde::{Deserialize, Serialize};

use crate::backend::BackendError;

#[derive(Debug, Deserialize)]
pub struct SessionInfo {
    pub id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageRequest {
    pub parts: Vec<TextPart>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelSelector>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TextPart {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelSelector {
    #[serde(rename = "providerID")]
    pub provider_id: String,
    #[serde(rename = "modelID")]
    pub model_id: String,
}

impl MessageRequest {
    pub fn text(text: &str, model: Option<ModelSelector>) -> Self {
        Self {
            parts: vec![TextPart {
                kind: "text",
                text: text.to_owned(),
            }],
            model,
        }
    }
}

impl ModelSelector {
    /// `provider/model` selects a provider explicitly; anything else is served
    /// by `default_provider`.
    pub fn for_model(model: &str, default_provider: &str) -> Option<Self> {
        if model.is_empty() {
            return None;
        }
        let mut pieces = model.split('/');
        let selector = match (pieces.next(), pieces.next(), pieces.next()) {
            (Some(provider), Some(model_id), None) => Self {
                provider_id: provider.to_owned(),
                model_id: model_id.to_owned(),
            },
            _ => Self {
                provider_id: default_provider.to_owned(),
                model_id: model.to_owned(),
            },
        };
        Some(selector)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct MessageReply {
    #[serde(default)]
    pub info: Option<ReplyInfo>,
    #[serde(default)]
    pub parts: Vec<ReplyPart>,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub error: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ReplyInfo {
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ReplyPart {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
}

impl MessageReply {
    pub fn message_id(&self) -> Option<&str> {
        self.info.as_ref().and_then(|info| info.id.as_deref())
    }

    pub fn failure(&self) -> Option<String> {
        match &self.error {
            Some(error) if !self.success => Some(error.to_string()),
            _ => None,
        }
    }

    /// Joins every text part in order. A reply flagged as failed is an error,
    /// never a partial result.
    pub fn into_content(self) -> Result<String, BackendError> {
        if let Some(error) = self.failure() {
            return Err(BackendError::Protocol(format!("opencode error: {error}")));
        }

        Ok(self
            .parts
            .into_iter()
            .filter(|part| part.kind == "text")
            .filter_map(|part| part.text)
            .collect())
    }
}

/// One decoded frame of the `/event` feed. Every field is optional; frames of
/// unrelated types simply leave most of them empty.
#[derive(Debug, Default, Deserialize)]
pub struct Event {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub properties: EventProperties,
}

#[derive(Debug, Default, Deserialize)]
pub struct EventProperties {
    #[serde(default)]
    pub info: Option<EventInfo>,
    #[serde(default)]
    pub part: Option<EventPart>,
    #[serde(default)]
    pub delta: Option<String>,
    #[serde(rename = "sessionID", default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub status: Option<EventStatus>,
}

#[derive(Debug, Default, Deserialize)]
pub struct EventInfo {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "sessionID", default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct EventPart {
    #[serde(rename = "messageID", default)]
    pub message_id: Option<String>,
    #[serde(rename = "sessionID", default)]
    pub session_id: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct EventStatus {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
}
