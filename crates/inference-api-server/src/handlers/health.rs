use axum::{extract::State, Json};

use crate::models::chat::HealthResponse;
use crate::state::AppState;

/// Readiness plus the context-window report from the last generation. The
/// backend is probed per request; an unreachable backend is reported, never
/// an error status.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let error = state.generator.probe().await.err();
    Json(HealthResponse {
        ok: error.is_none(),
        model_ready: error.is_none(),
        model_id: state.generator.model_id(),
        error,
        context: Some(state.context.overview(state.generator.as_ref())),
    })
}
