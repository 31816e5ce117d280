use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::{HeaderMap, HeaderValue},
    response::sse::{KeepAlive, Sse},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::chat::{
    AssistantMessage, ChatCompletionResponse, ChatRequest, Choice, Usage,
};
use crate::services::stream::{ResumeCursor, StreamCoordinator};
use crate::state::AppState;
use crate::utils::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct ResumeQuery {
    /// Resume cursor `session_id:index`, equivalent to the Last-Event-ID header.
    #[serde(default)]
    pub last_event_id: Option<String>,
}

fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..12].to_string()
}

/// OpenAI-compatible chat completions: JSON when `stream` is false, resumable
/// SSE when true.
pub async fn chat_completions(
    State(state): State<AppState>,
    Query(query): Query<ResumeQuery>,
    headers: HeaderMap,
    Json(body): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    // Caller input errors are rejected before any session is touched.
    if body.messages.is_empty() {
        return Err(ApiError::BadRequest(
            "messages must be a non-empty array".to_string(),
        ));
    }

    let raw_cursor = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or(query.last_event_id);
    let cursor = raw_cursor.as_deref().and_then(ResumeCursor::parse);

    let max_tokens = body
        .max_tokens
        .unwrap_or(state.settings.llm.default_max_tokens);
    let temperature = body
        .temperature
        .unwrap_or(state.settings.llm.default_temperature);
    let stream = body.stream.unwrap_or(false);

    let session_id = body
        .session_id
        .clone()
        .or_else(|| cursor.as_ref().map(|c| c.session_id.clone()))
        .unwrap_or_else(|| format!("sess-{}", short_id()));

    info!(
        "Chat request: session={}, stream={}, messages={}, resume={}",
        session_id,
        stream,
        body.messages.len(),
        cursor.is_some()
    );

    let session = state.store.get_or_create(&session_id);
    if let Some(log) = &state.event_log {
        if let Err(e) = log.ensure_session(&session_id, session.created_unix()).await {
            warn!("Failed to register session {} durably: {}", session_id, e);
        }
    }

    if !stream {
        let (turns, report) = state
            .context
            .fit(state.generator.as_ref(), &body.messages, max_tokens);
        let content = state
            .generator
            .generate(&turns, max_tokens, temperature)
            .await?;

        let completion_tokens = content.split_whitespace().count().max(1);
        let response = ChatCompletionResponse {
            id: format!("chatcmpl-{}", short_id()),
            object: "chat.completion".to_string(),
            created: chrono::Utc::now().timestamp(),
            model: state.generator.model_id(),
            choices: vec![Choice {
                index: 0,
                message: AssistantMessage {
                    role: "assistant".to_string(),
                    content,
                },
                finish_reason: Some("stop".to_string()),
            }],
            usage: Usage {
                prompt_tokens: report.prompt_tokens,
                completion_tokens,
                total_tokens: report.prompt_tokens + completion_tokens,
            },
            context: report,
        };
        return Ok(Json(response).into_response());
    }

    let coordinator = StreamCoordinator::new(
        session,
        state.generator.clone(),
        state.context.clone(),
        state.event_log.clone(),
        state.store.clone(),
        Duration::from_secs(state.settings.sessions.cancel_after_disconnect_seconds),
        Duration::from_secs(state.settings.sessions.ttl_seconds),
    );
    let events = coordinator.run(body.messages, max_tokens, temperature, cursor);

    let mut response = Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response();
    response
        .headers_mut()
        .insert("Cache-Control", HeaderValue::from_static("no-cache"));
    response
        .headers_mut()
        .insert("X-Accel-Buffering", HeaderValue::from_static("no"));
    Ok(response)
}
