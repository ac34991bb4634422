//! Session validation endpoint used by the web UI before opening the
//! sync channel.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde::{Deserialize, Serialize};

use cinesync_proto::Role;

use crate::http::AppState;

#[derive(Debug, Deserialize)]
pub struct ValidateSessionRequest {
    pub token: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ValidateSessionResponse {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub async fn validate_session(
    State(state): State<AppState>,
    Json(request): Json<ValidateSessionRequest>,
) -> impl IntoResponse {
    let Some(token) = request.token.filter(|t| !t.is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ValidateSessionResponse {
                valid: false,
                role: None,
                name: None,
                error: Some("Missing token".to_string()),
            }),
        );
    };

    match state.auth.validate_session(&token) {
        Some(session) => (
            StatusCode::OK,
            Json(ValidateSessionResponse {
                valid: true,
                role: Some(session.role),
                name: Some(session.name),
                error: None,
            }),
        ),
        None => (
            StatusCode::UNAUTHORIZED,
            Json(ValidateSessionResponse {
                valid: false,
                role: None,
                name: None,
                error: Some("Invalid or expired session".to_string()),
            }),
        ),
    }
}
