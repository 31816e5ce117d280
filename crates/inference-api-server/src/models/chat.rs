use serde::{Deserialize, Serialize};

use crate::services::context::ContextReport;

// ===== REQUEST MODELS =====

/// OpenAI-compatible Chat Completions request body.
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub model: Option<String>,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub max_tokens: Option<usize>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub stream: Option<bool>,
    /// Optional session id for resumable SSE.
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: MessageContent,
}

/// Message content is either a plain string or an OpenAI-style array of typed
/// parts. Only text parts contribute to the rendered prompt; media decoding is
/// the backend's concern.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn text(&self) -> String {
        self.content.text()
    }
}

impl MessageContent {
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter(|p| p.kind == "text")
                .filter_map(|p| p.text.as_deref())
                .collect::<Vec<_>>()
                .join(" "),
        }
    }
}

// ===== NON-STREAMING RESPONSE =====

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<Choice>,
    pub usage: Usage,
    pub context: ContextReport,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Choice {
    pub index: u32,
    pub message: AssistantMessage,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

// ===== STREAMING CHUNK PAYLOADS =====

/// One SSE event payload, OpenAI `chat.completion.chunk` shape.
#[derive(Debug, Serialize, Deserialize)]
pub struct StreamChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: Delta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Delta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl StreamChunk {
    fn new(session_id: &str, model: &str, delta: Delta, finish_reason: Option<String>) -> Self {
        Self {
            id: session_id.to_string(),
            object: "chat.completion.chunk".to_string(),
            created: chrono::Utc::now().timestamp(),
            model: model.to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
        }
    }

    /// Initial role-announcement chunk opening every stream.
    pub fn role(session_id: &str, model: &str) -> Self {
        Self::new(
            session_id,
            model,
            Delta {
                role: Some("assistant".to_string()),
                content: None,
            },
            None,
        )
    }

    pub fn content(session_id: &str, model: &str, piece: &str) -> Self {
        Self::new(
            session_id,
            model,
            Delta {
                role: None,
                content: Some(piece.to_string()),
            },
            None,
        )
    }

    /// Terminal finish chunk (empty delta, `finish_reason: "stop"`).
    pub fn finish(session_id: &str, model: &str) -> Self {
        Self::new(session_id, model, Delta::default(), Some("stop".to_string()))
    }
}

// ===== AUX RESPONSES =====

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    pub ok: bool,
    pub session_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    #[serde(rename = "modelReady")]
    pub model_ready: bool,
    #[serde(rename = "modelId")]
    pub model_id: String,
    pub error: Option<String>,
    pub context: Option<crate::services::context::ContextOverview>,
}
