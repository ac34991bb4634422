//! Health probe with process uptime

use axum::extract::State;
use axum::response::{IntoResponse, Json};
use serde::Serialize;

use crate::http::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_secs: u64,
    pub clients: usize,
    pub playing: bool,
}

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: state.started_at.elapsed().as_secs(),
        clients: state.state.client_count(),
        playing: state.state.is_playing(),
    })
}
