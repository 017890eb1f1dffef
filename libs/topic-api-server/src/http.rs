use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};

use super::AppState;

// ═══════════════════════════════════════════════════════════════
//  REST: GET /api/topics
// ═══════════════════════════════════════════════════════════════

pub(crate) async fn handle_list_topics(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(state.query.views()).into_response()
}

// ═══════════════════════════════════════════════════════════════
//  REST: GET <endpoint.path>
// ═══════════════════════════════════════════════════════════════

/// Всегда 200: отсутствие значения отдаётся как `{}`.
pub(crate) fn render_endpoint(state: &AppState, topic: &str) -> Response {
    let body = state.query.render(topic);
    tracing::debug!(topic = %topic, bytes = body.len(), "served latest value");
    ([(header::CONTENT_TYPE, "application/json")], body).into_response()
}
