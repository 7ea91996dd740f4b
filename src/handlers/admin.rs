//! Admin handlers for session and pool introspection.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::pool::PoolOccupancy;
use crate::server::AppState;

#[derive(Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub created: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
    pub hits: u64,
    pub queued: usize,
}

/// GET /admin/sessions
pub async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionSummary>> {
    let mut sessions: Vec<SessionSummary> = state
        .services
        .registry
        .list()
        .into_iter()
        .map(|session| SessionSummary {
            id: session.id().to_string(),
            created: session.created(),
            last_access: session.last_access(),
            hits: session.hits(),
            queued: session.queued(),
        })
        .collect();
    sessions.sort_by(|a, b| a.created.cmp(&b.created));
    Json(sessions)
}

#[derive(Serialize)]
pub struct SessionDetail {
    pub id: String,
    pub created: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
    pub hits: u64,
    pub user_id: i64,
    pub script_path: String,
    pub peer_addr: Option<String>,
    pub host: Option<String>,
    pub user_agent: Option<String>,
    pub window_ids: Vec<u64>,
    pub action_ids: Vec<u64>,
    pub main_window: Option<u64>,
    pub current_window: Option<u64>,
    pub borrowed_handles: usize,
}

/// GET /admin/sessions/{session_id}
pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    let Some(session) = state.services.registry.lookup(&session_id) else {
        return (StatusCode::NOT_FOUND, "session not found").into_response();
    };

    let guard = session.lock().await;
    let detail = SessionDetail {
        id: session.id().to_string(),
        created: session.created(),
        last_access: session.last_access(),
        hits: session.hits(),
        user_id: guard.user_id,
        script_path: guard.script_path.clone(),
        peer_addr: guard.peer_addr.map(|addr| addr.to_string()),
        host: guard.host.clone(),
        user_agent: guard.user_agent.clone(),
        window_ids: guard.windows.ids(),
        action_ids: guard.actions.ids(),
        main_window: guard.main_window,
        current_window: guard.current_window,
        borrowed_handles: guard.borrowed.lock().expect("mutex poisoned").len(),
    };
    Json(detail).into_response()
}

/// DELETE /admin/sessions/{session_id}
///
/// Destroys the session, waiting out any in-flight requests against it.
pub async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    if state.services.registry.kill(&session_id).await {
        StatusCode::NO_CONTENT.into_response()
    } else {
        (StatusCode::NOT_FOUND, "session not found").into_response()
    }
}

/// GET /admin/pool
pub async fn pool_occupancy(State(state): State<AppState>) -> Json<Vec<PoolOccupancy>> {
    let mut occupancy = state.services.pool.occupancy();
    occupancy.sort_by(|a, b| a.conninfo.cmp(&b.conninfo));
    Json(occupancy)
}
