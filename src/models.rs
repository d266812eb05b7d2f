use std::{
    collections::BTreeMap,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionsRequest {
    pub model: String,
    #[serde(default)]
    pub backend: Option<String>,
    #[serde(default)]
    pub messages: Vec<OpenAiMessage>,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct OpenAiMessage {
    pub role: MessageRole,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
    /// Roles such as `developer` or `function`; accepted and never forwarded.
    #[serde(other)]
    Other,
}

/// A validated chat call addressed to one backend. `model` holds the
/// backend's canonical model id once the registry has resolved it.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub request_id: String,
    pub model: String,
    pub messages: Vec<OpenAiMessage>,
    pub stream: bool,
}

impl ChatCompletionsRequest {
    /// The model string handed to the registry: `backend/model` when a
    /// backend is named explicitly.
    pub fn routing_model(&self) -> String {
        match self.backend.as_deref().map(str::trim) {
            Some(backend) if !backend.is_empty() => format!("{backend}/{}", self.model),
            _ => self.model.clone(),
        }
    }

    pub fn into_chat_request(self, resolved_model: String) -> Result<ChatRequest, String> {
        if self.model.trim().is_empty() {
            return Err("model is required".to_owned());
        }
        if self.messages.is_empty() {
            return Err("messages must not be empty".to_owned());
        }

        Ok(ChatRequest {
            request_id: format!("req_{}", Uuid::new_v4()),
            model: resolved_model,
            messages: self.messages,
            stream: self.stream,
        })
    }
}

impl ChatRequest {
    /// Content of the most recent user turn.
    pub fn last_user_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|message| message.role == MessageRole::User)
            .map(|message| message.content.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatCompletionsResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChatChoice>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatChoice {
    pub index: usize,
    pub message: AssistantMessage,
    pub finish_reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AssistantMessage {
    pub role: String,
    pub content: String,
}

impl ChatCompletionsResponse {
    pub fn assistant(id: String, created: i64, model: String, content: String) -> Self {
        Self {
            id,
            object: "chat.completion".to_owned(),
            created,
            model,
            choices: vec![ChatChoice {
                index: 0,
                message: AssistantMessage {
                    role: "assistant".to_owned(),
                    content,
                },
                finish_reason: "stop".to_owned(),
            }],
        }
    }

    pub fn content(&self) -> Option<&str> {
        self.choices
            .first()
            .map(|choice| choice.message.content.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatCompletionsChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkChoice {
    pub index: usize,
    pub delta: DeltaMessage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeltaMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl ChatCompletionsChunk {
    fn with_choice(id: &str, created: i64, model: &str, choice: ChunkChoice) -> Self {
        Self {
            id: id.to_owned(),
            object: "chat.completion.chunk".to_owned(),
            created,
            model: model.to_owned(),
            choices: vec![choice],
        }
    }

    pub fn role(id: &str, created: i64, model: &str) -> Self {
        Self::with_choice(
            id,
            created,
            model,
            ChunkChoice {
                index: 0,
                delta: DeltaMessage {
                    role: Some("assistant".to_owned()),
                    content: None,
                },
                finish_reason: None,
            },
        )
    }

    pub fn delta(id: &str, created: i64, model: &str, content: String) -> Self {
        Self::with_choice(
            id,
            created,
            model,
            ChunkChoice {
                index: 0,
                delta: DeltaMessage {
                    role: None,
                    content: Some(content),
                },
                finish_reason: None,
            },
        )
    }

    pub fn finish(id: &str, created: i64, model: &str) -> Self {
        Self::with_choice(
            id,
            created,
            model,
            ChunkChoice {
                index: 0,
                delta: DeltaMessage::default(),
                finish_reason: Some("stop".to_owned()),
            },
        )
    }

    pub fn finish_reason(&self) -> Option<&str> {
        self.choices
            .first()
            .and_then(|choice| choice.finish_reason.as_deref())
    }

    pub fn content(&self) -> Option<&str> {
        self.choices
            .first()
            .and_then(|choice| choice.delta.content.as_deref())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub owned_by: String,
    pub backend: String,
    pub free: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsResponse {
    pub object: String,
    pub data: Vec<ModelInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendInfo {
    pub id: String,
    pub name: String,
    pub status: String,
    pub models: Vec<String>,
    pub default: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendsResponse {
    pub object: String,
    pub data: Vec<BackendInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub backends: BTreeMap<String, String>,
    pub uptime: u64,
}

pub fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(backend: Option<&str>, messages: Vec<OpenAiMessage>) -> ChatCompletionsRequest {
        ChatCompletionsRequest {
            model: "big-pickle".to_owned(),
            backend: backend.map(ToOwned::to_owned),
            messages,
            stream: false,
        }
    }

    fn message(role: MessageRole, content: &str) -> OpenAiMessage {
        OpenAiMessage {
            role,
            content: content.to_owned(),
        }
    }

    #[test]
    fn backend_field_prefixes_the_routing_model() {
        assert_eq!(request(None, vec![]).routing_model(), "big-pickle");
        assert_eq!(
            request(Some("opencode"), vec![]).routing_model(),
            "opencode/big-pickle"
        );
        assert_eq!(request(Some(" "), vec![]).routing_model(), "big-pickle");
    }

    #[test]
    fn conversion_rejects_empty_message_list() {
        let error = request(None, vec![])
            .into_chat_request("big-pickle".to_owned())
            .expect_err("empty message list should fail");

        assert_eq!(error, "messages must not be empty");
    }

    #[test]
    fn last_user_message_searches_from_the_end() {
        let chat = request(
            None,
            vec![
                message(MessageRole::System, "be brief"),
                message(MessageRole::User, "first"),
                message(MessageRole::Assistant, "ok"),
                message(MessageRole::User, "second"),
                message(MessageRole::Assistant, "draft"),
            ],
        )
        .into_chat_request("big-pickle".to_owned())
        .expect("valid request");

        assert_eq!(chat.last_user_message(), Some("second"));
    }

    #[test]
    fn unknown_roles_are_accepted_and_skipped() {
        let body = r#"{
            "model": "big-pickle",
            "messages": [
                {"role": "developer", "content": "be brief"},
                {"role": "user", "content": "Hello!"},
                {"role": "function", "content": "{}"}
            ]
        }"#;
        let request: ChatCompletionsRequest = serde_json::from_str(body).expect("valid body");

        assert_eq!(request.messages[0].role, MessageRole::Other);
        let chat = request
            .into_chat_request("big-pickle".to_owned())
            .expect("valid request");
        assert_eq!(chat.last_user_message(), Some("Hello!"));
    }

    #[test]
    fn chunks_serialize_without_empty_fields() {
        let role = serde_json::to_value(ChatCompletionsChunk::role("id", 1, "m")).expect("json");
        assert_eq!(role["choices"][0]["delta"], serde_json::json!({"role": "assistant"}));
        assert!(role["choices"][0].get("finish_reason").is_none());

        let finish = serde_json::to_value(ChatCompletionsChunk::finish("id", 1, "m")).expect("json");
        assert_eq!(finish["choices"][0]["delta"], serde_json::json!({}));
        assert_eq!(finish["choices"][0]["finish_reason"], "stop");
        assert_eq!(finish["object"], "chat.completion.chunk");
    }
}
