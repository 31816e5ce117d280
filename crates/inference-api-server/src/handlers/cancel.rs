use axum::{
    extract::{Path, State},
    Json,
};
use tracing::{info, warn};

use crate::models::chat::CancelResponse;
use crate::state::AppState;

/// Cooperative cancel. Idempotent: unknown ids and already-finished sessions
/// are a no-op success.
pub async fn cancel_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Json<CancelResponse> {
    if let Some(session) = state.store.get(&session_id) {
        info!("Cancel requested for session {}", session_id);
        session.request_cancel();
        session.finish();
        if let Some(log) = &state.event_log {
            if let Err(e) = log.mark_finished(&session_id).await {
                warn!("Failed to persist cancel for {}: {}", session_id, e);
            }
        }
    }
    Json(CancelResponse {
        ok: true,
        session_id,
    })
}
