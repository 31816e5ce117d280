use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::stream::Stream;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::LlmConfig;
use crate::models::chat::ChatMessage;
use crate::utils::error::ApiError;

pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String, ApiError>> + Send>>;

/// Capabilities the streaming core consumes from the generation backend.
/// Production talks to an OpenAI-compatible server; tests substitute a
/// scripted implementation.
#[async_trait::async_trait]
pub trait Generator: Send + Sync {
    fn model_id(&self) -> String;

    /// Exact token count when a tokenizer is available; None falls back to
    /// the word-based estimate.
    fn count_tokens(&self, _text: &str) -> Option<usize> {
        None
    }

    /// Maximum context window reported by the backend, if known.
    fn max_context(&self) -> Option<usize> {
        None
    }

    /// Backend reachability check for readiness reporting. Defaults to ready
    /// for implementations with no remote dependency.
    async fn probe(&self) -> Result<(), String> {
        Ok(())
    }

    async fn generate(
        &self,
        messages: &[ChatMessage],
        max_tokens: usize,
        temperature: f32,
    ) -> Result<String, ApiError>;

    /// Finite lazy fragment stream. The implementation must observe `cancel`
    /// between fragments and stop producing once it is set.
    async fn generate_stream(
        &self,
        messages: &[ChatMessage],
        max_tokens: usize,
        temperature: f32,
        cancel: Arc<AtomicBool>,
    ) -> Result<FragmentStream, ApiError>;
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<OutboundMessage>,
    max_tokens: usize,
    temperature: f32,
    stream: bool,
}

/// Upstream messages are flattened to plain text content.
#[derive(Debug, Serialize)]
struct OutboundMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    choices: Vec<ChoiceChunk>,
}

#[derive(Debug, Deserialize)]
struct ChoiceChunk {
    delta: ChunkDelta,
}

#[derive(Debug, Deserialize)]
struct ChunkDelta {
    content: Option<String>,
}

/// Extract the content delta from one SSE `data:` line of an
/// OpenAI-compatible stream. Returns None for non-data lines, keep-alives and
/// the `[DONE]` marker.
fn extract_delta(line: &str) -> Option<String> {
    let json_str = line.strip_prefix("data: ")?;
    if json_str == "[DONE]" {
        return None;
    }
    let chunk: ChatCompletionChunk = serde_json::from_str(json_str).ok()?;
    chunk
        .choices
        .first()
        .and_then(|c| c.delta.content.clone())
}

#[derive(Clone)]
pub struct LlmService {
    client: Client,
    config: LlmConfig,
}

impl LlmService {
    pub fn new(config: LlmConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_seconds))
            .build()?;
        Ok(Self { client, config })
    }

    fn outbound(&self, messages: &[ChatMessage], max_tokens: usize, temperature: f32, stream: bool) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: self.config.model.clone(),
            messages: messages
                .iter()
                .map(|m| OutboundMessage {
                    role: m.role.clone(),
                    content: m.text(),
                })
                .collect(),
            max_tokens,
            temperature,
            stream,
        }
    }
}

#[async_trait::async_trait]
impl Generator for LlmService {
    fn model_id(&self) -> String {
        self.config.model.clone()
    }

    /// Reachability check against the backend's health endpoint. Serving
    /// never blocks on this; the result only feeds readiness reporting.
    async fn probe(&self) -> Result<(), String> {
        let response = self
            .client
            .get(format!("{}/health", self.config.base_url))
            .send()
            .await
            .map_err(|e| format!("backend unreachable: {}", e))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("backend health returned {}", response.status()))
        }
    }

    async fn generate(
        &self,
        messages: &[ChatMessage],
        max_tokens: usize,
        temperature: f32,
    ) -> Result<String, ApiError> {
        debug!("Starting chat generation with {} messages", messages.len());

        let request = self.outbound(messages, max_tokens, temperature, false);

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.config.base_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| ApiError::LlmError(format!("Failed to call LLM API: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::LlmError(format!(
                "LLM API error: {} - {}",
                status, body
            )));
        }

        #[derive(Deserialize)]
        struct ChatCompletionResponse {
            choices: Vec<Choice>,
        }
        #[derive(Deserialize)]
        struct Choice {
            message: Message,
        }
        #[derive(Deserialize)]
        struct Message {
            content: String,
        }

        let chat_response: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| ApiError::LlmError(format!("Failed to parse LLM response: {}", e)))?;

        chat_response
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .ok_or_else(|| ApiError::LlmError("No choices returned from LLM".to_string()))
    }

    async fn generate_stream(
        &self,
        messages: &[ChatMessage],
        max_tokens: usize,
        temperature: f32,
        cancel: Arc<AtomicBool>,
    ) -> Result<FragmentStream, ApiError> {
        debug!("Starting chat stream with {} messages", messages.len());

        let request = self.outbound(messages, max_tokens, temperature, true);

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.config.base_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| ApiError::LlmError(format!("Failed to call LLM API: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::LlmError(format!(
                "LLM API error: {} - {}",
                status, body
            )));
        }

        let stream = response.bytes_stream();

        // Parse the upstream SSE byte stream into text fragments. An empty
        // fragment is yielded for chunks that carry no delta; the coordinator
        // skips those.
        let parsed_stream = futures::stream::unfold((stream, cancel), |(mut stream, cancel)| async move {
            use futures::StreamExt;

            if cancel.load(Ordering::SeqCst) {
                return None;
            }

            match stream.next().await {
                Some(Ok(bytes)) => {
                    let text = String::from_utf8_lossy(&bytes);
                    let mut out = String::new();
                    for line in text.lines() {
                        if line.strip_prefix("data: ") == Some("[DONE]") {
                            if out.is_empty() {
                                return None;
                            }
                            break;
                        }
                        if let Some(piece) = extract_delta(line) {
                            out.push_str(&piece);
                        }
                    }
                    Some((Ok(out), (stream, cancel)))
                }
                Some(Err(e)) => Some((
                    Err(ApiError::LlmError(format!("Stream error: {}", e))),
                    (stream, cancel),
                )),
                None => None,
            }
        });

        Ok(Box::pin(parsed_stream))
    }
}
