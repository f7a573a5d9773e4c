//! OpenAI-compatible wire types.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default = "default_stream")]
    pub stream: bool,
    /// Client-chosen session key; turns sharing it continue the same
    /// upstream conversation.
    #[serde(default)]
    pub user: Option<String>,
}

fn default_stream() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletion {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<Choice>,
    pub usage: Usage,
}

impl ChatCompletion {
    /// Buffered completion carrying the whole assistant reply.
    pub fn assistant(id: String, model: String, content: String) -> Self {
        Self {
            id,
            object: "chat.completion",
            created: chrono::Utc::now().timestamp(),
            model,
            choices: vec![Choice {
                index: 0,
                message: ChatMessage {
                    role: "assistant".into(),
                    content,
                },
                finish_reason: "stop",
            }],
            usage: Usage::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Choice {
    pub index: u32,
    pub message: ChatMessage,
    pub finish_reason: &'static str,
}

/// The upstream exposes no token accounting; zeros keep the field shape
/// clients expect.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

impl ChatCompletionChunk {
    pub fn delta(id: &str, model: &str, content: impl Into<String>) -> Self {
        Self::build(
            id,
            model,
            Delta {
                content: Some(content.into()),
            },
            None,
        )
    }

    /// Terminal chunk with an empty delta and `finish_reason: "stop"`.
    pub fn finish(id: &str, model: &str) -> Self {
        Self::build(id, model, Delta::default(), Some("stop"))
    }

    /// Failure surfaced after the stream already started: the message
    /// rides in the delta and the stream finishes immediately.
    pub fn error_text(id: &str, model: &str, message: impl Into<String>) -> Self {
        Self::build(
            id,
            model,
            Delta {
                content: Some(message.into()),
            },
            Some("stop"),
        )
    }

    fn build(id: &str, model: &str, delta: Delta, finish_reason: Option<&'static str>) -> Self {
        Self {
            id: id.to_string(),
            object: "chat.completion.chunk",
            created: chrono::Utc::now().timestamp(),
            model: model.to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: Delta,
    pub finish_reason: Option<&'static str>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Delta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelList {
    pub object: &'static str,
    pub data: Vec<ModelCard>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelCard {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub owned_by: &'static str,
}

impl ModelList {
    pub fn new(ids: impl IntoIterator<Item = String>) -> Self {
        let created = chrono::Utc::now().timestamp();
        Self {
            object: "list",
            data: ids
                .into_iter()
                .map(|id| ModelCard {
                    id,
                    object: "model",
                    created,
                    owned_by: "doubao",
                })
                .collect(),
        }
    }
}

/// OpenAI-style error body.
pub fn error_body(message: &str, kind: &str) -> Value {
    json!({
        "error": { "message": message, "type": kind, "code": null }
    })
}
