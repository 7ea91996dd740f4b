use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use serde::Serialize;

use crate::server::AppState;

pub async fn livez() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

#[derive(Serialize)]
pub struct ReadyzResponse {
    pub status: String,
    pub sessions: usize,
}

pub async fn readyz(State(state): State<AppState>) -> Json<ReadyzResponse> {
    Json(ReadyzResponse {
        status: "ok".to_string(),
        sessions: state.services.registry.len(),
    })
}

#[derive(Serialize)]
pub struct VersionResponse {
    pub name: &'static str,
    pub version: &'static str,
}

pub async fn version() -> Json<VersionResponse> {
    Json(VersionResponse {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
    })
}
